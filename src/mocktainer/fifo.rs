//! The exec FIFO: a named rendezvous between `create` and `start`.
//!
//! `create` makes `<state dir>/exec.fifo` and hands an `O_PATH` descriptor to
//! the init process, which blocks opening it for writing right before it
//! executes the workload. `start` opens the FIFO for reading, which lets the
//! init process through; once the sentinel byte is read the FIFO is removed.
//! Its presence on disk is what distinguishes `created` from `running`.

use nix::sys::stat::{umask, Mode};
use nix::unistd::{chown, getegid, geteuid};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::debug;

use super::error::{Error, Result};
use super::system;

pub const EXEC_FIFO_FILENAME: &str = "exec.fifo";

/// How often `release` checks whether the init process died.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const FIFO_MODE: u32 = 0o620;

pub fn fifo_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EXEC_FIFO_FILENAME)
}

pub fn exists(state_dir: &Path) -> bool {
    fifo_path(state_dir).exists()
}

/// Create the FIFO. Fails if one is already there.
pub fn create(state_dir: &Path) -> Result<()> {
    let path = fifo_path(state_dir);
    if fs::symlink_metadata(&path).is_ok() {
        return Err(Error::InvalidState(format!(
            "exec fifo {} already exists",
            path.display()
        )));
    }

    let old_mask = umask(Mode::empty());
    let made = nix::unistd::mkfifo(&path, Mode::from_bits_truncate(FIFO_MODE));
    umask(old_mask);
    made.map_err(|e| Error::nix(format!("creating exec fifo {}", path.display()), e))?;

    chown(&path, Some(geteuid()), Some(getegid()))
        .map_err(|e| Error::nix(format!("chown exec fifo {}", path.display()), e))?;
    Ok(())
}

/// Open the FIFO without reading it, for handing to the init process.
pub fn open_path(state_dir: &Path) -> Result<File> {
    let path = fifo_path(state_dir);
    OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_PATH)
        .open(&path)
        .map_err(|e| Error::io(format!("opening exec fifo {}", path.display()), e))
}

/// Remove the FIFO if it is there.
pub fn delete(state_dir: &Path) -> Result<()> {
    let path = fifo_path(state_dir);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(format!("removing exec fifo {}", path.display()), e)),
    }
}

fn fifo_open(path: &Path, block: bool) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(true);
    if !block {
        opts.custom_flags(nix::libc::O_NONBLOCK);
    }
    opts.open(path)
}

fn await_fifo_open(path: PathBuf) -> mpsc::Receiver<io::Result<File>> {
    let (tx, rx) = mpsc::channel();
    // Blocks until the init process opens its end. If the init process dies
    // first this thread stays parked; it is never joined.
    thread::spawn(move || {
        let _ = tx.send(fifo_open(&path, true));
    });
    rx
}

fn read_from_exec_fifo(fifo: &mut File) -> Result<()> {
    let mut data = Vec::new();
    fifo.read_to_end(&mut data)
        .map_err(|e| Error::io("reading exec fifo", e))?;
    if data.is_empty() {
        return Err(Error::InvalidState(
            "cannot start an already running container".to_string(),
        ));
    }
    Ok(())
}

fn handle_fifo_result(path: &Path, result: io::Result<File>) -> Result<()> {
    let mut fifo = result.map_err(|e| Error::io("opening exec fifo", e))?;
    read_from_exec_fifo(&mut fifo)?;
    fs::remove_file(path).map_err(|e| Error::io("removing exec fifo", e))
}

/// Let the init process `pid` proceed to its workload.
///
/// Two paths race: a blocking open of the FIFO, and a 100 ms poll of the init
/// process. If the process is seen dead, a non-blocking open decides whether
/// it got through the gate before dying. A process exiting between the poll
/// and the open is not distinguished from a successful start.
pub fn release(state_dir: &Path, pid: i32) -> Result<()> {
    let path = fifo_path(state_dir);
    let opened = await_fifo_open(path.clone());
    loop {
        match opened.recv_timeout(POLL_INTERVAL) {
            Ok(result) => return handle_fifo_result(&path, result),
            Err(RecvTimeoutError::Timeout) => {
                let dead = match system::stat(pid) {
                    Ok(stat) => stat.state.is_exited(),
                    Err(_) => true,
                };
                if dead {
                    debug!("init process {} exited before the exec fifo was opened", pid);
                    return handle_fifo_result(&path, fifo_open(&path, false)).map_err(|_| {
                        Error::InvalidState("container process is already dead".to_string())
                    });
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(Error::InvalidState(
                    "exec fifo waiter exited unexpectedly".to_string(),
                ))
            }
        }
    }
}
