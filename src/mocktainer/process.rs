//! The runtime side of the container's init process.
//!
//! The init process is this same binary re-executed as `init`. It receives
//! its end of a socket pair, the write end of a log pipe and an `O_PATH`
//! descriptor of the exec FIFO at fixed descriptor numbers right after the
//! preserved descriptors; the numbers travel in `_RUNU_*` environment
//! variables.

use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{pipe2, Pid};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Child, Command};
use tracing::{debug, info, warn};

use super::bootstrap;
use super::configs::Config;
use super::error::{Error, Result};
use super::fifo;
use super::hooks::HookName;
use super::logs;
use super::sync::{self, SyncMsg};
use super::system;

/// argv[1] that turns the runtime binary into an init process.
pub const INIT_ARG: &str = "init";

pub const ENV_INIT_PIPE: &str = "_RUNU_INITPIPE";
pub const ENV_LOG_PIPE: &str = "_RUNU_LOGPIPE";
pub const ENV_FIFO_FD: &str = "_RUNU_FIFOFD";
pub const ENV_INIT_TYPE: &str = "_RUNU_INITTYPE";
pub const ENV_LOG_LEVEL: &str = "_RUNU_LOGLEVEL";

/// The only kind of init process: the container's first process.
pub const INIT_TYPE_STANDARD: &str = "standard";

const SELF_EXE: &str = "/proc/self/exe";

/// The workload to run as the container's init process.
#[derive(Debug, Clone, Default)]
pub struct Process {
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs applied to the init process before it executes.
    pub env: Vec<String>,
    /// SELinux label; overrides the container's when set.
    pub label: String,
    /// AppArmor profile; overrides the container's when set.
    pub app_armor_profile: String,
    /// Descriptors 3..3+N are passed through to the workload.
    pub preserved_fds: usize,
    /// Level for the init process' own log records.
    pub log_level: String,
}

/// Sent to the init process after the bootstrap data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitConfig {
    pub config: Config,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub process_label: String,
    #[serde(default)]
    pub app_armor_profile: String,
    #[serde(default)]
    pub passed_files_count: usize,
    pub container_id: String,
}

impl InitConfig {
    pub fn new(id: &str, config: &Config, process: &Process) -> Self {
        let pick = |own: &str, fallback: &str| {
            if own.is_empty() {
                fallback.to_string()
            } else {
                own.to_string()
            }
        };
        InitConfig {
            config: config.clone(),
            args: process.args.clone(),
            env: process.env.clone(),
            process_label: pick(&process.label, &config.process_label),
            app_armor_profile: pick(&process.app_armor_profile, &config.app_armor_profile),
            passed_files_count: process.preserved_fds,
            container_id: id.to_string(),
        }
    }
}

/// A process the container tracks as its init.
pub trait ParentProcess: Send + std::fmt::Debug {
    fn pid(&self) -> i32;

    /// Start time recorded when the process was first seen; 0 when unknown.
    fn start_time(&self) -> u64;

    /// Send `sig`, or only probe for existence when `None`.
    fn signal(&self, sig: Option<Signal>) -> nix::Result<()>;

    /// Kill the process and reap it when possible.
    fn terminate(&mut self) -> Result<()>;
}

fn sigkill(pid: i32) -> Result<()> {
    match kill(Pid::from_raw(pid), Signal::SIGKILL) {
        Ok(()) | Err(nix::Error::ESRCH) => Ok(()),
        Err(e) => Err(Error::nix(format!("killing init process {}", pid), e)),
    }
}

/// An init process spawned by this runtime instance.
#[derive(Debug)]
pub struct InitProcess {
    child: Child,
    start_time: u64,
}

impl InitProcess {
    /// Spawn the init process and drive it through the handshake up to the
    /// point where it waits on the exec FIFO.
    pub fn start(id: &str, state_dir: &Path, config: &Config, process: &Process) -> Result<Self> {
        if process.args.is_empty() {
            return Err(Error::Config("process args must not be empty".to_string()));
        }
        let bootstrap_data = bootstrap::encode(
            config.namespaces.clone_flags(),
            &config.namespaces.join_paths(),
        )?;
        let init_config = InitConfig::new(id, config, process);

        let (parent_sock, child_sock) =
            UnixStream::pair().map_err(|e| Error::io("creating init socket pair", e))?;
        let (log_read, log_write) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::nix("creating log pipe", e))?;
        let fifo_fd = fifo::open_path(state_dir)?;

        let base = 3 + process.preserved_fds as RawFd;
        let sources = [
            child_sock.as_raw_fd(),
            log_write.as_raw_fd(),
            fifo_fd.as_raw_fd(),
        ];
        let preserved = process.preserved_fds as RawFd;

        let mut cmd = Command::new(SELF_EXE);
        cmd.arg(INIT_ARG)
            .env(ENV_INIT_PIPE, base.to_string())
            .env(ENV_LOG_PIPE, (base + 1).to_string())
            .env(ENV_FIFO_FD, (base + 2).to_string())
            .env(ENV_INIT_TYPE, INIT_TYPE_STANDARD)
            .env(ENV_LOG_LEVEL, &process.log_level);
        // Safety: remap_fds only calls async-signal-safe libc functions.
        unsafe {
            cmd.pre_exec(move || remap_fds(&sources, base, preserved));
        }

        info!("starting init process for container {}", id);
        let child = cmd
            .spawn()
            .map_err(|e| Error::io("starting init process", e))?;
        drop(child_sock);
        drop(log_write);
        drop(fifo_fd);

        let forwarder = logs::forward_in_background(File::from(log_read));
        let pid = child.id() as i32;
        let mut init = InitProcess {
            child,
            start_time: 0,
        };

        let started = system::stat(pid)
            .map(|stat| stat.start_time)
            .and_then(|start_time| {
                init.start_time = start_time;
                handshake(&parent_sock, &bootstrap_data, &init_config, pid)
            });
        drop(parent_sock);

        if let Err(e) = started {
            if let Err(kill_err) = init.terminate() {
                warn!("failed to terminate init process {}: {}", pid, kill_err);
            }
            let _ = forwarder.join();
            return Err(e);
        }

        match forwarder.join() {
            Ok(lines) => debug!("forwarded {} log lines from init process {}", lines, pid),
            Err(_) => warn!("init log forwarder panicked"),
        }
        info!("init process {} is waiting on the exec fifo", pid);
        Ok(init)
    }
}

impl ParentProcess for InitProcess {
    fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    fn start_time(&self) -> u64 {
        self.start_time
    }

    fn signal(&self, sig: Option<Signal>) -> nix::Result<()> {
        kill(Pid::from_raw(self.pid()), sig)
    }

    fn terminate(&mut self) -> Result<()> {
        sigkill(self.pid())?;
        self.child
            .wait()
            .map_err(|e| Error::io("waiting for init process", e))?;
        Ok(())
    }
}

/// An init process started by another runtime invocation, known only by its
/// pid and recorded start time.
#[derive(Debug, Clone)]
pub struct NonChildProcess {
    pub pid: i32,
    pub start_time: u64,
}

impl ParentProcess for NonChildProcess {
    fn pid(&self) -> i32 {
        self.pid
    }

    fn start_time(&self) -> u64 {
        self.start_time
    }

    fn signal(&self, sig: Option<Signal>) -> nix::Result<()> {
        kill(Pid::from_raw(self.pid), sig)
    }

    fn terminate(&mut self) -> Result<()> {
        sigkill(self.pid)
    }
}

fn handshake(
    sock: &UnixStream,
    bootstrap_data: &[u8],
    init_config: &InitConfig,
    pid: i32,
) -> Result<()> {
    let mut writer = sock;
    writer
        .write_all(bootstrap_data)
        .map_err(|e| Error::io("sending bootstrap data", e))?;
    sync::write_json(sock, init_config)?;

    let mut reader = BufReader::new(
        sock.try_clone()
            .map_err(|e| Error::io("cloning init socket", e))?,
    );
    loop {
        match sync::read_sync(&mut reader)? {
            Some(SyncMsg::ProcHooks) => {
                let config = &init_config.config;
                let state = config.hook_state(&init_config.container_id, "creating", Some(pid));
                for name in [
                    HookName::Prestart,
                    HookName::CreateRuntime,
                    HookName::CreateContainer,
                ] {
                    config.hooks.run(name, &state)?;
                }
                sync::write_sync(sock, &SyncMsg::ProcResume)?;
            }
            Some(SyncMsg::ProcReady) => {
                return sync::write_sync(sock, &SyncMsg::ProcRun);
            }
            Some(SyncMsg::ProcError { message }) => return Err(Error::Init(message)),
            Some(other) => {
                return Err(Error::Sync(format!("unexpected {} from init", other)));
            }
            None => {
                return Err(Error::Init(
                    "init process exited before it was ready".to_string(),
                ))
            }
        }
    }
}

/// Move `sources` onto `base`, `base + 1`, `base + 2` and let the preserved
/// descriptors `3..3+preserved` survive exec. Runs between fork and exec.
fn remap_fds(sources: &[RawFd; 3], base: RawFd, preserved: RawFd) -> io::Result<()> {
    use nix::libc;

    // Park every source above the targets first so no dup2 clobbers a
    // source that has not been moved yet.
    let mut parked = [0; 3];
    for (slot, fd) in parked.iter_mut().zip(sources) {
        let dup = unsafe { libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, base + 3) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }
        *slot = dup;
    }
    for (offset, fd) in parked.iter().enumerate() {
        if unsafe { libc::dup2(*fd, base + offset as RawFd) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    for fd in 3..3 + preserved {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            continue;
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
