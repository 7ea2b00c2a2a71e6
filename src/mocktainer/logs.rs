//! Log plumbing between the init process and the runtime.
//!
//! The init process logs JSON lines into a pipe; the runtime re-emits every
//! line through its own subscriber so init diagnostics end up wherever the
//! runtime logs go.

use serde::Deserialize;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, trace, warn};

/// A line as written by the `tracing_subscriber` JSON formatter.
#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(default)]
    level: String,
    #[serde(default)]
    fields: LogFields,
}

#[derive(Debug, Default, Deserialize)]
struct LogFields {
    #[serde(default)]
    message: String,
}

fn emit(line: &str) {
    let entry: LogLine = match serde_json::from_str(line) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(target: "runu::init", "failed to decode {:?} to json: {}", line, e);
            return;
        }
    };
    let msg = entry.fields.message;
    match entry.level.as_str() {
        "ERROR" => error!(target: "runu::init", "{}", msg),
        "WARN" => warn!(target: "runu::init", "{}", msg),
        "DEBUG" => debug!(target: "runu::init", "{}", msg),
        "TRACE" => trace!(target: "runu::init", "{}", msg),
        _ => info!(target: "runu::init", "{}", msg),
    }
}

/// Re-emit every line read from `source` until EOF; returns the line count.
pub fn forward<R: Read>(source: R) -> usize {
    let mut count = 0;
    for line in BufReader::new(source).lines() {
        match line {
            Ok(line) if line.trim().is_empty() => {}
            Ok(line) => {
                emit(&line);
                count += 1;
            }
            Err(e) => {
                warn!("reading init log pipe: {}", e);
                break;
            }
        }
    }
    count
}

/// Forward the init log pipe on a background thread. Join the handle to
/// know every line written before the init process closed the pipe was seen.
pub fn forward_in_background(source: File) -> JoinHandle<usize> {
    thread::spawn(move || forward(source))
}

/// Write side of the log pipe, owned by the init process.
///
/// The pipe must be closed before the workload is executed, while the
/// subscriber holding this writer lives on; writes after [`LogPipe::close`]
/// are dropped.
#[derive(Clone)]
pub struct LogPipe(Arc<Mutex<Option<File>>>);

impl LogPipe {
    pub fn new(file: File) -> Self {
        LogPipe(Arc::new(Mutex::new(Some(file))))
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.0.lock() {
            guard.take();
        }
    }
}

impl Write for LogPipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.write_all(buf).map(|_| buf.len()),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.flush(),
                None => Ok(()),
            },
            Err(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::os::fd::OwnedFd;

    #[test]
    fn test_forward_counts_lines() {
        let input = concat!(
            "{\"level\":\"INFO\",\"fields\":{\"message\":\"joining namespaces\"}}\n",
            "\n",
            "{\"level\":\"ERROR\",\"fields\":{\"message\":\"boom\"}}\n",
            "not json\n",
        );
        assert_eq!(forward(Cursor::new(input)), 3);
    }

    #[test]
    fn test_log_pipe_close_drops_writes() {
        let (read, write): (OwnedFd, OwnedFd) =
            nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).unwrap();
        let mut pipe = LogPipe::new(File::from(write));
        let reader = forward_in_background(File::from(read));

        pipe.write_all(b"{\"level\":\"DEBUG\",\"fields\":{\"message\":\"one\"}}\n")
            .unwrap();
        pipe.close();
        // Closed: accepted and discarded.
        pipe.write_all(b"{\"level\":\"DEBUG\",\"fields\":{\"message\":\"two\"}}\n")
            .unwrap();

        assert_eq!(reader.join().unwrap(), 1);
    }
}
