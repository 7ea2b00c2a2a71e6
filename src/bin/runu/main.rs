use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nix::sys::signal::Signal;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use runu::machine::qemu::Qemu;
use runu::machine::{sanitize_args, Machine, MachineDriver};
use runu::mocktainer::process::INIT_ARG;
use runu::mocktainer::specconv::{self, CreateOpts};
use runu::mocktainer::{init, state, Container, Error, Factory, Process, Status};
use runu::spec::{self as oci, Spec};

mod ps;
mod signal;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    " ",
    env!("BUILD_DATE"),
    ")"
);

/// Probes after SIGKILL before giving up on a container.
const KILL_PROBES: usize = 100;
const KILL_PROBE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(
    name = "runu",
    version = VERSION,
    about = "OCI-compatible runtime that runs unikernels as containers"
)]
struct Cli {
    /// Root directory for container state (runc: --root)
    #[arg(global = true, long, env = "RUNU_ROOT", value_name = "PATH")]
    root: Option<PathBuf>,

    /// Path to write runtime logs (runc: --log)
    #[arg(global = true, long, env = "RUNU_LOG", value_name = "PATH")]
    log: Option<PathBuf>,

    /// Log format (runc: --log-format)
    #[arg(global = true, long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(global = true, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PsFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a container: boot nothing yet, park the VMM behind the exec fifo
    Create {
        /// Bundle directory containing config.json
        #[arg(short, long, value_name = "PATH", default_value = ".")]
        bundle: PathBuf,
        /// Socket for the pseudo-terminal master; not supported
        #[arg(long, value_name = "PATH")]
        console_socket: Option<PathBuf>,
        /// File to write the init process pid to
        #[arg(long, value_name = "PATH")]
        pid_file: Option<PathBuf>,
        /// Number of extra descriptors, from 3, passed to the VMM
        #[arg(long, default_value_t = 0)]
        preserve_fds: usize,
        /// Container ID
        id: String,
    },
    /// Start a created container
    Start {
        /// Container ID
        id: String,
    },
    /// Send a signal to the container's init process
    Kill {
        /// Container ID
        id: String,
        /// Signal name or number
        #[arg(default_value = "SIGTERM")]
        signal: String,
        /// Do not fail when the container is not running
        #[arg(short, long)]
        all: bool,
    },
    /// Delete a container and its state
    Delete {
        /// Container ID
        id: String,
        /// Kill the container first if it is still running
        #[arg(short, long)]
        force: bool,
    },
    /// Print the OCI state of a container as JSON
    State {
        /// Container ID
        id: String,
    },
    /// List the container's processes
    Ps {
        #[arg(short, long, value_enum, default_value_t = PsFormat::Table)]
        format: PsFormat,
        /// Container ID
        id: String,
        /// Arguments for ps (default: -ef)
        #[arg(last = true)]
        ps_args: Vec<String>,
    },
}

fn init_logging(cli: &Cli) {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Without --log, use a null writer so nothing pollutes stdout.
    let writer = match &cli.log {
        Some(path) => match fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => BoxMakeWriter::new(std::sync::Mutex::new(file)),
            Err(_) => BoxMakeWriter::new(std::sync::Mutex::new(std::io::sink())),
        },
        None => BoxMakeWriter::new(std::sync::Mutex::new(std::io::sink())),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer);
    match cli.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Write the pid through a temp file in the same directory and rename it.
fn write_pid_file(path: &Path, pid: i32) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temporary pid file in {}", dir.display()))?;
    write!(tmp, "{}", pid).context("writing pid file")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("renaming pid file to {}", path.display()))?;
    Ok(())
}

struct CreateArgs<'a> {
    id: &'a str,
    bundle: &'a Path,
    pid_file: Option<&'a Path>,
    preserve_fds: usize,
    log_level: &'static str,
}

fn do_create(factory: &Factory, args: &CreateArgs) -> Result<()> {
    info!(
        "do_create() called - id={}, bundle={}",
        args.id,
        args.bundle.display()
    );
    // Relative paths given by the caller refer to its working directory,
    // which is left below.
    let pid_file = args
        .pid_file
        .map(std::path::absolute)
        .transpose()
        .context("resolving pid file path")?;
    let args = &CreateArgs {
        pid_file: pid_file.as_deref(),
        ..*args
    };
    let bundle = fs::canonicalize(args.bundle)
        .with_context(|| format!("resolving bundle {}", args.bundle.display()))?;
    std::env::set_current_dir(&bundle)
        .with_context(|| format!("changing directory to {}", bundle.display()))?;
    let spec = Spec::load(&bundle)?;
    let process = spec
        .process
        .clone()
        .context("config.json missing 'process' section")?;
    if process.terminal {
        bail!("terminal is not supported");
    }
    let config = specconv::create_config(&CreateOpts { spec })?;

    // Control sockets need a short path; keep them out of the bundle.
    let machine_dir = tempfile::Builder::new()
        .prefix("runu-")
        .tempdir_in("/tmp")
        .context("creating temporary machine directory")?;
    let result = create_container(factory, args, config, &process, machine_dir.path());
    match (result, machine_dir.close()) {
        (Ok(()), Ok(())) => Ok(()),
        (Ok(()), Err(e)) => Err(e).context("removing temporary machine directory"),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(cleanup)) => Err(anyhow!(
            "{:#}; also failed to remove temporary machine directory: {}",
            e,
            cleanup
        )),
    }
}

fn create_container(
    factory: &Factory,
    args: &CreateArgs,
    config: runu::mocktainer::Config,
    process: &oci::Process,
    machine_dir: &Path,
) -> Result<()> {
    let machine = Machine::from_config(args.id, &config, &process.args, machine_dir)?;
    let driver = Qemu::from_env();
    let argv = sanitize_args(&driver.command_line(&machine));
    info!(
        "do_create() - {} machine for {} kernel {}: {:?}",
        driver.name(),
        machine.arch,
        machine.kernel.display(),
        argv
    );

    let container = factory.create(args.id, config)?;
    let init = Process {
        args: argv,
        env: process.env.clone(),
        preserved_fds: args.preserve_fds,
        log_level: args.log_level.to_string(),
        ..Default::default()
    };
    if let Err(e) = container.start(&init) {
        if let Err(cleanup) = container.destroy() {
            warn!("failed to destroy container {}: {}", args.id, cleanup);
        }
        return Err(e.into());
    }

    if let Some(pid_file) = args.pid_file {
        let pid = container.oci_state().pid;
        if let Err(e) = write_pid_file(pid_file, pid) {
            if let Err(cleanup) = kill_container(&container) {
                warn!("failed to destroy container {}: {:#}", args.id, cleanup);
            }
            return Err(e);
        }
    }
    info!("do_create() succeeded - container={}", args.id);
    Ok(())
}

fn do_start(factory: &Factory, id: &str) -> Result<()> {
    info!("do_start() called - id={}", id);
    let container = factory.load(id)?;
    match container.status() {
        Status::Created => container.exec()?,
        Status::Stopped => bail!("cannot start a container that has stopped"),
        Status::Running => bail!("cannot start an already running container"),
    }
    info!("do_start() succeeded - id={}", id);
    Ok(())
}

fn do_kill(factory: &Factory, id: &str, raw_signal: &str, all: bool) -> Result<()> {
    info!("do_kill() called - id={}, signal={}", id, raw_signal);
    let sig = signal::parse_signal(raw_signal)?;
    let container = factory.load(id)?;
    match container.signal(sig) {
        Ok(()) => {}
        Err(Error::NotRunning) if all => {
            info!("do_kill() - container {} is not running", id);
        }
        Err(e) => return Err(e.into()),
    }
    info!("do_kill() succeeded - id={}, signal={:?}", id, sig);
    Ok(())
}

/// SIGKILL the init process, wait for it to go away, then destroy.
fn kill_container(container: &Container) -> Result<()> {
    if let Err(e) = container.signal(Signal::SIGKILL) {
        warn!("killing container {}: {}", container.id(), e);
    }
    for _ in 0..KILL_PROBES {
        thread::sleep(KILL_PROBE_INTERVAL);
        if container.signal(None).is_err() {
            container.destroy()?;
            return Ok(());
        }
    }
    bail!("container init still running")
}

fn do_delete(factory: &Factory, id: &str, force: bool) -> Result<()> {
    info!("do_delete() called - id={}, force={}", id, force);
    let container = match factory.load(id) {
        Ok(container) => container,
        Err(e) if force && e.is_not_found() => {
            state::remove_dir(&factory.container_dir(id))?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    match container.status() {
        Status::Stopped => container.destroy()?,
        Status::Created => kill_container(&container)?,
        status if force => {
            info!("do_delete() - force-killing {} container {}", status, id);
            kill_container(&container)?
        }
        status => bail!("container is not stopped: {}", status),
    }
    info!("do_delete() succeeded - id={}", id);
    Ok(())
}

fn do_state(factory: &Factory, id: &str) -> Result<()> {
    let container = factory.load(id)?;
    let state = container.oci_state();
    info!(
        "do_state() succeeded - id={}, status={}, pid={}",
        id, state.status, state.pid
    );
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn do_ps(factory: &Factory, id: &str, format: PsFormat, ps_args: &[String]) -> Result<()> {
    let container = factory.load(id)?;
    let pids = container.processes();
    match format {
        PsFormat::Json => println!("{}", serde_json::to_string(&pids)?),
        PsFormat::Table => {
            let default_args = ["-ef".to_string()];
            let args = if ps_args.is_empty() {
                &default_args[..]
            } else {
                ps_args
            };
            let output = Command::new("ps")
                .args(args)
                .output()
                .context("running ps")?;
            if !output.status.success() {
                bail!(
                    "ps failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            for line in ps::filter(&String::from_utf8_lossy(&output.stdout), &pids)? {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

fn run(cli: &Cli) -> Result<()> {
    let root = cli
        .root
        .as_deref()
        .context("a root directory is required (--root or RUNU_ROOT)")?;
    let factory = Factory::new(root)?;

    match &cli.command {
        Commands::Create {
            bundle,
            console_socket,
            pid_file,
            preserve_fds,
            id,
        } => {
            if let Some(socket) = console_socket {
                warn!("ignoring console socket {}", socket.display());
            }
            do_create(
                &factory,
                &CreateArgs {
                    id,
                    bundle,
                    pid_file: pid_file.as_deref(),
                    preserve_fds: *preserve_fds,
                    log_level: if cli.debug { "debug" } else { "info" },
                },
            )
        }
        Commands::Start { id } => do_start(&factory, id),
        Commands::Kill { id, signal, all } => do_kill(&factory, id, signal, *all),
        Commands::Delete { id, force } => do_delete(&factory, id, *force),
        Commands::State { id } => do_state(&factory, id),
        Commands::Ps {
            format,
            id,
            ps_args,
        } => do_ps(&factory, id, *format, ps_args),
    }
}

fn main() {
    // The init process must not start threads or read configuration first.
    if std::env::args().nth(1).as_deref() == Some(INIT_ARG) {
        init::start_initialization();
    }

    runu::config::load_config();
    let cli = Cli::parse();
    init_logging(&cli);
    info!("CLI parsed: root={:?}, command={:?}", cli.root, cli.command);

    if let Err(e) = run(&cli) {
        error!("Command failed: {:#}", e);
        eprintln!("runu: {:#}", e);
        std::process::exit(1);
    }
    info!("Command completed successfully");
}
