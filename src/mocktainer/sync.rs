//! Messages exchanged between the runtime and the init process.
//!
//! Each message is one JSON object per line. The handshake is strictly
//! ordered:
//!
//! ```text
//! init                         runtime
//!  | ---- procHooks -------->  |  run prestart/createRuntime/createContainer
//!  | <--- procResume --------  |
//!  | ---- procReady -------->  |
//!  | <--- procRun -----------  |
//!  |  (closes socket, waits on exec fifo)
//! ```
//!
//! Any failure on the init side is reported as `procError` instead.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

use super::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncMsg {
    ProcError { message: String },
    ProcReady,
    ProcRun,
    ProcHooks,
    ProcResume,
}

impl std::fmt::Display for SyncMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SyncMsg::ProcError { .. } => "procError",
            SyncMsg::ProcReady => "procReady",
            SyncMsg::ProcRun => "procRun",
            SyncMsg::ProcHooks => "procHooks",
            SyncMsg::ProcResume => "procResume",
        };
        f.write_str(name)
    }
}

/// Write any serializable value as a single JSON line.
pub fn write_json<W: Write, T: Serialize>(mut w: W, value: &T) -> Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    w.write_all(&line)
        .and_then(|_| w.flush())
        .map_err(|e| Error::io("writing to init pipe", e))
}

/// Read one JSON line. `Ok(None)` means the peer closed the pipe.
pub fn read_json<R: BufRead, T: for<'de> Deserialize<'de>>(r: &mut R) -> Result<Option<T>> {
    let mut line = String::new();
    let n = r
        .read_line(&mut line)
        .map_err(|e| Error::io("reading from init pipe", e))?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line.trim_end())?))
}

pub fn write_sync<W: Write>(w: W, msg: &SyncMsg) -> Result<()> {
    write_json(w, msg)
}

pub fn read_sync<R: BufRead>(r: &mut R) -> Result<Option<SyncMsg>> {
    read_json(r)
}

/// Block until the peer sends `expected`; a `procError` becomes an error.
pub fn expect_sync<R: BufRead>(r: &mut R, expected: &SyncMsg) -> Result<()> {
    match read_sync(r)? {
        Some(msg) if &msg == expected => Ok(()),
        Some(SyncMsg::ProcError { message }) => Err(Error::Init(message)),
        Some(other) => Err(Error::Sync(format!(
            "expected {} but got {}",
            expected, other
        ))),
        None => Err(Error::Sync(format!(
            "pipe closed while waiting for {}",
            expected
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufReader, Cursor};

    #[test]
    fn test_wire_format() {
        let mut buf = Vec::new();
        write_sync(&mut buf, &SyncMsg::ProcReady).unwrap();
        assert_eq!(buf, b"{\"type\":\"procReady\"}\n");

        let mut buf = Vec::new();
        write_sync(
            &mut buf,
            &SyncMsg::ProcError {
                message: "boom".to_string(),
            },
        )
        .unwrap();
        assert_eq!(buf, b"{\"type\":\"procError\",\"message\":\"boom\"}\n");
    }

    #[test]
    fn test_read_sequence_then_eof() {
        let mut buf = Vec::new();
        write_sync(&mut buf, &SyncMsg::ProcHooks).unwrap();
        write_sync(&mut buf, &SyncMsg::ProcReady).unwrap();

        let mut r = BufReader::new(Cursor::new(buf));
        assert_eq!(read_sync(&mut r).unwrap(), Some(SyncMsg::ProcHooks));
        assert_eq!(read_sync(&mut r).unwrap(), Some(SyncMsg::ProcReady));
        assert_eq!(read_sync(&mut r).unwrap(), None);
    }

    #[test]
    fn test_expect_sync() {
        let mut buf = Vec::new();
        write_sync(&mut buf, &SyncMsg::ProcResume).unwrap();
        write_sync(&mut buf, &SyncMsg::ProcReady).unwrap();
        write_sync(
            &mut buf,
            &SyncMsg::ProcError {
                message: "setns failed".to_string(),
            },
        )
        .unwrap();

        let mut r = BufReader::new(Cursor::new(buf));
        expect_sync(&mut r, &SyncMsg::ProcResume).unwrap();

        let err = expect_sync(&mut r, &SyncMsg::ProcRun).unwrap_err();
        assert!(err.to_string().contains("expected procRun but got procReady"));

        let err = expect_sync(&mut r, &SyncMsg::ProcRun).unwrap_err();
        assert_eq!(err.to_string(), "unable to start container process: setns failed");

        let err = expect_sync(&mut r, &SyncMsg::ProcRun).unwrap_err();
        assert!(err.to_string().contains("pipe closed"));
    }
}
