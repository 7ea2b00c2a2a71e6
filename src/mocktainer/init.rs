//! The init side of the handshake, run as `runu init`.
//!
//! Must run before any other thread exists: joining a user namespace is only
//! allowed for single-threaded processes.

use nix::sys::prctl;
use nix::sys::signal::Signal;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
use nix::unistd::setsid;
use std::backtrace::Backtrace;
use std::convert::Infallible;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::{self, Command};
use std::sync::Mutex;
use tracing::{debug, info};
use tracing_subscriber::filter::LevelFilter;

use super::bootstrap;
use super::error::{Error, Result};
use super::hooks::HookName;
use super::logs::LogPipe;
use super::process::{
    InitConfig, ENV_FIFO_FD, ENV_INIT_PIPE, ENV_INIT_TYPE, ENV_LOG_LEVEL, ENV_LOG_PIPE,
    INIT_TYPE_STANDARD,
};
use super::sync::{self, SyncMsg};

static PANIC_REPORT: Mutex<Option<String>> = Mutex::new(None);

fn env_fd(key: &str) -> Result<RawFd> {
    let value = env::var(key).map_err(|_| Error::Config(format!("{} is not set", key)))?;
    value
        .parse()
        .map_err(|_| Error::Config(format!("unable to convert {}={:?} to int", key, value)))
}

/// Take ownership of a descriptor number received from the runtime.
///
/// Safety: `fd` must be open and not owned by anything else in this process.
unsafe fn adopt(fd: RawFd) -> OwnedFd {
    OwnedFd::from_raw_fd(fd)
}

fn install_logger(pipe: LogPipe) {
    let level = env::var(ENV_LOG_LEVEL)
        .ok()
        .and_then(|l| l.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::INFO);
    let _ = tracing_subscriber::fmt()
        .json()
        .with_ansi(false)
        .with_max_level(level)
        .with_writer(move || pipe.clone())
        .try_init();
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Entry point of the init process. Never returns: it either executes the
/// workload or exits with status 1.
pub fn start_initialization() -> ! {
    let sock = match env_fd(ENV_INIT_PIPE) {
        Ok(fd) => UnixStream::from(unsafe { adopt(fd) }),
        Err(e) => {
            eprintln!("runu init: {}", e);
            process::exit(1);
        }
    };
    let log_pipe = match env_fd(ENV_LOG_PIPE) {
        Ok(fd) => LogPipe::new(File::from(unsafe { adopt(fd) })),
        Err(e) => {
            eprintln!("runu init: {}", e);
            process::exit(1);
        }
    };
    install_logger(log_pipe.clone());

    panic::set_hook(Box::new(|info| {
        let report = format!("panic from initialization: {}\n{}", info, Backtrace::force_capture());
        if let Ok(mut slot) = PANIC_REPORT.lock() {
            *slot = Some(report);
        }
    }));

    let mut sock = Some(sock);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| init(&mut sock, &log_pipe)));
    let message = match outcome {
        Ok(Ok(never)) => match never {},
        Ok(Err(e)) => e.to_string(),
        Err(payload) => PANIC_REPORT
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or_else(|| {
                format!("panic from initialization: {}", panic_message(payload.as_ref()))
            }),
    };

    let reported = match &sock {
        Some(s) => sync::write_sync(s, &SyncMsg::ProcError { message: message.clone() }).is_ok(),
        None => false,
    };
    if !reported {
        eprintln!("{}", message);
    }
    process::exit(1);
}

fn init(sock: &mut Option<UnixStream>, log_pipe: &LogPipe) -> Result<Infallible> {
    let init_type = env::var(ENV_INIT_TYPE).unwrap_or_default();
    if init_type != INIT_TYPE_STANDARD {
        return Err(Error::Config(format!("unknown init type {:?}", init_type)));
    }
    let fifo_fd = env_fd(ENV_FIFO_FD)?;
    for key in [ENV_INIT_PIPE, ENV_LOG_PIPE, ENV_FIFO_FD, ENV_INIT_TYPE, ENV_LOG_LEVEL] {
        env::remove_var(key);
    }

    let stream = sock
        .as_ref()
        .ok_or_else(|| Error::Sync("init socket already closed".to_string()))?;
    let mut reader = BufReader::new(
        stream
            .try_clone()
            .map_err(|e| Error::io("cloning init socket", e))?,
    );

    let bootstrap = bootstrap::read_from(&mut reader)?;
    join_namespaces(&bootstrap)?;

    let init_config: InitConfig = sync::read_json(&mut reader)?
        .ok_or_else(|| Error::Sync("pipe closed before the init config arrived".to_string()))?;
    if init_config.args.is_empty() {
        return Err(Error::Config("process args must not be empty".to_string()));
    }
    for kv in &init_config.env {
        if let Some((key, value)) = kv.split_once('=') {
            env::set_var(key, value);
        }
    }

    let config = &init_config.config;
    if config.wants_loopback() {
        bring_up_loopback()?;
    }
    setsid().map_err(|e| Error::nix("setsid", e))?;
    if config.parent_death_signal != 0 {
        let sig = Signal::try_from(config.parent_death_signal)
            .map_err(|e| Error::nix("parent death signal", e))?;
        prctl::set_pdeathsig(sig).map_err(|e| Error::nix("setting parent death signal", e))?;
    }

    sync::write_sync(stream, &SyncMsg::ProcHooks)?;
    sync::expect_sync(&mut reader, &SyncMsg::ProcResume)?;
    sync::write_sync(stream, &SyncMsg::ProcReady)?;
    sync::expect_sync(&mut reader, &SyncMsg::ProcRun)?;
    debug!("init for {} released, waiting on the exec fifo", init_config.container_id);

    // From here on errors can only go to stderr.
    log_pipe.close();
    drop(reader);
    sock.take();

    close_exec_from(3 + init_config.passed_files_count as RawFd)?;
    write_exec_labels(&init_config)?;

    let mut gate = OpenOptions::new()
        .write(true)
        .open(format!("/proc/self/fd/{}", fifo_fd))
        .map_err(|e| Error::io("opening exec fifo for writing", e))?;
    gate.write_all(b"0")
        .map_err(|e| Error::io("writing to exec fifo", e))?;
    drop(gate);
    drop(unsafe { adopt(fifo_fd) });

    let state = config.hook_state(
        &init_config.container_id,
        "created",
        Some(process::id() as i32),
    );
    config.hooks.run(HookName::StartContainer, &state)?;

    let args = &init_config.args;
    let err = Command::new(&args[0]).args(&args[1..]).exec();
    Err(Error::io(format!("exec {}", args[0]), err))
}

fn join_namespaces(bootstrap: &bootstrap::BootstrapData) -> Result<()> {
    for (typ, path) in &bootstrap.ns_paths {
        let ns = File::open(path)
            .map_err(|e| Error::io(format!("opening {} namespace {}", typ, path.display()), e))?;
        nix::sched::setns(ns, typ.clone_flag())
            .map_err(|e| Error::nix(format!("joining {} namespace {}", typ, path.display()), e))?;
        info!("joined {} namespace {}", typ, path.display());
    }
    if !bootstrap.clone_flags.is_empty() {
        nix::sched::unshare(bootstrap.clone_flags)
            .map_err(|e| Error::nix("creating namespaces", e))?;
        info!("created namespaces {:?}", bootstrap.clone_flags);
    }
    Ok(())
}

/// Set `IFF_UP` on `lo` in the current network namespace.
fn bring_up_loopback() -> Result<()> {
    use nix::libc;

    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| Error::nix("creating ioctl socket", e))?;

    let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
    for (dst, src) in req.ifr_name.iter_mut().zip(b"lo\0") {
        *dst = *src as libc::c_char;
    }
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS as _, &mut req as *mut libc::ifreq) } < 0 {
        return Err(Error::io(
            "reading loopback flags",
            std::io::Error::last_os_error(),
        ));
    }
    unsafe {
        req.ifr_ifru.ifru_flags |= libc::IFF_UP as libc::c_short;
    }
    if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS as _, &req as *const libc::ifreq) } < 0 {
        return Err(Error::io(
            "bringing up loopback",
            std::io::Error::last_os_error(),
        ));
    }
    info!("loopback interface is up");
    Ok(())
}

/// Mark every open descriptor from `min` upwards close-on-exec.
fn close_exec_from(min: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};

    let fds: Vec<RawFd> = fs::read_dir("/proc/self/fd")
        .map_err(|e| Error::io("listing /proc/self/fd", e))?
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
        .filter(|fd| *fd >= min)
        .collect();
    for fd in fds {
        match fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)) {
            // The directory handle used for listing is already gone.
            Ok(_) | Err(nix::Error::EBADF) => {}
            Err(e) => return Err(Error::nix(format!("setting close-on-exec on {}", fd), e)),
        }
    }
    Ok(())
}

fn write_exec_labels(init_config: &InitConfig) -> Result<()> {
    if !init_config.process_label.is_empty() {
        fs::write("/proc/self/attr/exec", &init_config.process_label)
            .map_err(|e| Error::io("setting SELinux exec label", e))?;
    }
    if !init_config.app_armor_profile.is_empty() {
        fs::write(
            "/proc/self/attr/exec",
            format!("exec {}", init_config.app_armor_profile),
        )
        .map_err(|e| Error::io("applying AppArmor profile", e))?;
    }
    Ok(())
}
