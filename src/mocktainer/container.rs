//! The container state machine.
//!
//! Status is never stored: every query re-derives it from the tracked init
//! process, `/proc` and the presence of the exec FIFO.

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use super::configs::Config;
use super::error::{Error, Result};
use super::fifo;
use super::hooks::HookName;
use super::process::{InitProcess, ParentProcess, Process};
use super::state::{self, ContainerState, State};
use super::system;
use crate::spec;

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The init process is waiting on the exec FIFO.
    Created,
    /// The workload is executing.
    Running,
    /// No live init process.
    Stopped,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Created => "created",
            Status::Running => "running",
            Status::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Inner {
    init_process: Option<Box<dyn ParentProcess>>,
    created: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Container {
    id: String,
    root: PathBuf,
    config: Config,
    inner: Mutex<Inner>,
}

impl Container {
    pub(crate) fn new(
        id: String,
        root: PathBuf,
        config: Config,
        init_process: Option<Box<dyn ParentProcess>>,
        created: DateTime<Utc>,
    ) -> Self {
        Container {
            id,
            root,
            config,
            inner: Mutex::new(Inner {
                init_process,
                created,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The per-container state directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_status(&self, inner: &Inner) -> Status {
        let Some(init) = inner.init_process.as_ref() else {
            return Status::Stopped;
        };
        let stat = match system::stat(init.pid()) {
            Ok(stat) => stat,
            Err(_) => return Status::Stopped,
        };
        if init.start_time() != 0 && stat.start_time != init.start_time() {
            debug!(
                "pid {} was recycled: start time {} != {}",
                init.pid(),
                stat.start_time,
                init.start_time()
            );
            return Status::Stopped;
        }
        if stat.state.is_exited() {
            return Status::Stopped;
        }
        if fifo::exists(&self.root) {
            Status::Created
        } else {
            Status::Running
        }
    }

    fn current_state(&self, inner: &Inner) -> State {
        let (pid, start_time) = inner
            .init_process
            .as_ref()
            .map(|p| (p.pid(), p.start_time()))
            .unwrap_or((0, 0));
        let namespace_paths = if pid != 0 {
            self.config
                .namespaces
                .0.iter()
                .map(|ns| (ns.typ, ns.get_path(pid).to_string_lossy().into_owned()))
                .collect()
        } else {
            BTreeMap::new()
        };
        State {
            id: self.id.clone(),
            config: self.config.clone(),
            init_process_pid: pid,
            init_process_start_time: start_time,
            created: inner.created,
            namespace_paths,
        }
    }

    fn hook_state(&self, status: &str, pid: Option<i32>) -> spec::State {
        self.config.hook_state(&self.id, status, pid)
    }

    pub fn status(&self) -> Status {
        let inner = self.lock();
        self.current_status(&inner)
    }

    /// The persisted form of the container.
    pub fn state(&self) -> State {
        let inner = self.lock();
        self.current_state(&inner)
    }

    /// The OCI state document.
    pub fn oci_state(&self) -> ContainerState {
        let inner = self.lock();
        let status = self.current_status(&inner);
        let pid = match (&inner.init_process, status) {
            (Some(init), Status::Created | Status::Running) => init.pid(),
            _ => 0,
        };
        let (bundle, annotations) = self.config.annotations();
        ContainerState {
            oci_version: spec::OCI_VERSION.to_string(),
            id: self.id.clone(),
            pid,
            status: status.to_string(),
            bundle,
            rootfs: self.config.rootfs.clone(),
            created: inner.created,
            annotations,
            owner: String::new(),
        }
    }

    /// PIDs of the container's processes: the init process unless stopped.
    pub fn processes(&self) -> Vec<i32> {
        let inner = self.lock();
        match (&inner.init_process, self.current_status(&inner)) {
            (Some(init), Status::Created | Status::Running) => vec![init.pid()],
            _ => Vec::new(),
        }
    }

    /// Spawn the init process and leave it waiting on the exec FIFO.
    pub fn start(&self, process: &Process) -> Result<()> {
        self.start_with(|| {
            InitProcess::start(&self.id, &self.root, &self.config, process)
                .map(|init| Box::new(init) as Box<dyn ParentProcess>)
        })
    }

    /// Create the exec FIFO, spawn through `spawn` and persist the result.
    /// The FIFO is removed again on every error past its creation.
    fn start_with<F>(&self, spawn: F) -> Result<()>
    where
        F: FnOnce() -> Result<Box<dyn ParentProcess>>,
    {
        let mut inner = self.lock();
        let status = self.current_status(&inner);
        if status != Status::Stopped {
            return Err(Error::InvalidState(format!(
                "cannot start a container that is {}",
                status
            )));
        }

        fifo::create(&self.root)?;
        let result = spawn().and_then(|init| self.commit_start(&mut inner, init));
        if let Err(e) = result {
            if let Err(cleanup) = fifo::delete(&self.root) {
                warn!("failed to remove exec fifo: {}", cleanup);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Track a freshly spawned init process, save the state and run the
    /// poststart hooks. Any failure kills the init process.
    fn commit_start(&self, inner: &mut Inner, init: Box<dyn ParentProcess>) -> Result<()> {
        let pid = init.pid();
        inner.init_process = Some(init);
        inner.created = Utc::now();

        let state = self.current_state(inner);
        let persisted = state::save(&self.root, &state).and_then(|_| {
            self.config
                .hooks
                .run(HookName::Poststart, &self.hook_state("created", Some(pid)))
        });
        if let Err(e) = persisted {
            if let Some(mut init) = inner.init_process.take() {
                if let Err(kill_err) = init.terminate() {
                    warn!("failed to terminate init process {}: {}", pid, kill_err);
                }
            }
            return Err(e);
        }
        info!("container {} created with init pid {}", self.id, pid);
        Ok(())
    }

    /// Release the exec FIFO so the init process executes the workload.
    pub fn exec(&self) -> Result<()> {
        let inner = self.lock();
        match self.current_status(&inner) {
            Status::Created => {}
            Status::Running => {
                return Err(Error::InvalidState(
                    "cannot start a running machine".to_string(),
                ))
            }
            Status::Stopped => {
                return Err(Error::InvalidState(
                    "cannot start a stopped machine".to_string(),
                ))
            }
        }
        let pid = inner
            .init_process
            .as_ref()
            .map(|p| p.pid())
            .ok_or(Error::NotRunning)?;
        fifo::release(&self.root, pid)?;
        info!("container {} started", self.id);
        Ok(())
    }

    /// Send `sig` to the init process; `None` only probes for existence.
    pub fn signal<S: Into<Option<Signal>>>(&self, sig: S) -> Result<()> {
        let sig = sig.into();
        let inner = self.lock();
        if self.current_status(&inner) == Status::Stopped {
            return Err(Error::NotRunning);
        }
        let init = inner.init_process.as_ref().ok_or(Error::NotRunning)?;
        debug!("sending {:?} to init process {}", sig, init.pid());
        init.signal(sig).map_err(Error::Signal)
    }

    /// Remove all state of a stopped container and run the poststop hooks.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.lock();
        let status = self.current_status(&inner);
        if status != Status::Stopped {
            return Err(Error::InvalidState(format!(
                "cannot destroy a container that is {}",
                status
            )));
        }
        state::remove_dir(&self.root)?;
        inner.init_process = None;
        self.config
            .hooks
            .run(HookName::Poststop, &self.hook_state("stopped", None))?;
        info!("container {} destroyed", self.id);
        Ok(())
    }
}
