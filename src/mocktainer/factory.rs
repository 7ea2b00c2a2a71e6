//! Creating and loading containers under a root directory.

use chrono::Utc;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::configs::Config;
use super::container::Container;
use super::error::{Error, Result};
use super::process::{NonChildProcess, ParentProcess};
use super::state;

/// Owns the root directory holding one state directory per container.
#[derive(Debug, Clone)]
pub struct Factory {
    root: PathBuf,
}

impl Factory {
    /// Use `root`, creating it with mode 0700 when missing. The path is
    /// made absolute so later changes of the working directory do not move
    /// the state.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&root)
            .map_err(|e| Error::io(format!("creating root directory {}", root.display()), e))?;
        let root = fs::canonicalize(&root)
            .map_err(|e| Error::io(format!("resolving root directory {}", root.display()), e))?;
        Ok(Factory { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Allocate the state directory of a new container. Nothing is persisted
    /// until [`Container::start`] succeeds.
    pub fn create(&self, id: &str, config: Config) -> Result<Container> {
        state::validate_id(id)?;
        let dir = self.container_dir(id);
        state::create_dir(&dir, id)?;
        debug!("allocated state directory {}", dir.display());
        Ok(Container::new(id.to_string(), dir, config, None, Utc::now()))
    }

    /// Rebuild a container from its `state.json`.
    pub fn load(&self, id: &str) -> Result<Container> {
        state::validate_id(id)?;
        let dir = self.container_dir(id);
        let saved = match state::load(&dir) {
            Ok(saved) => saved,
            Err(e) if e.is_not_found() => return Err(Error::NotExist(id.to_string())),
            Err(e) => return Err(e),
        };
        let init = (saved.init_process_pid != 0).then(|| {
            Box::new(NonChildProcess {
                pid: saved.init_process_pid,
                start_time: saved.init_process_start_time,
            }) as Box<dyn ParentProcess>
        });
        Ok(Container::new(
            saved.id,
            dir,
            saved.config,
            init,
            saved.created,
        ))
    }
}
