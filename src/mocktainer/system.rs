//! Process probing through `/proc/<pid>/stat`.

use std::fs;

use super::error::{Error, Result};

/// Scheduler state of a process, as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Stopped,
    TracingStop,
    Zombie,
    Dead,
    Idle,
    Parked,
    Other(char),
}

impl From<char> for ProcessState {
    fn from(c: char) -> Self {
        match c {
            'R' => ProcessState::Running,
            'S' => ProcessState::Sleeping,
            'D' => ProcessState::DiskSleep,
            'T' => ProcessState::Stopped,
            't' => ProcessState::TracingStop,
            'Z' => ProcessState::Zombie,
            'X' | 'x' => ProcessState::Dead,
            'I' => ProcessState::Idle,
            'P' => ProcessState::Parked,
            other => ProcessState::Other(other),
        }
    }
}

impl ProcessState {
    /// Whether the process has exited (zombie or already reaped).
    pub fn is_exited(self) -> bool {
        matches!(self, ProcessState::Zombie | ProcessState::Dead)
    }
}

/// The fields of `/proc/<pid>/stat` the runtime cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub pid: i32,
    pub state: ProcessState,
    /// Start time in clock ticks after boot; stable for the process lifetime.
    pub start_time: u64,
}

/// Read `/proc/<pid>/stat`.
pub fn stat(pid: i32) -> Result<Stat> {
    let path = format!("/proc/{}/stat", pid);
    let data = fs::read_to_string(&path).map_err(|e| Error::io(format!("reading {}", path), e))?;
    parse_stat(&data)
}

/// Parse the contents of a stat file.
///
/// The command name may itself contain spaces and parentheses, so the fields
/// are located relative to the last `)`.
pub fn parse_stat(data: &str) -> Result<Stat> {
    let malformed = || Error::Config(format!("malformed stat data: {:?}", data.trim()));

    let open = data.find('(').ok_or_else(malformed)?;
    let close = data.rfind(')').ok_or_else(malformed)?;
    if close < open {
        return Err(malformed());
    }
    let pid = data[..open].trim().parse().map_err(|_| malformed())?;

    let fields: Vec<&str> = data[close + 1..].split_whitespace().collect();
    // fields[0] is field 3 (state); starttime is field 22.
    let state = fields
        .first()
        .and_then(|s| s.chars().next())
        .map(ProcessState::from)
        .ok_or_else(malformed)?;
    let start_time = fields
        .get(19)
        .and_then(|s| s.parse().ok())
        .ok_or_else(malformed)?;

    Ok(Stat {
        pid,
        state,
        start_time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "4242 (qemu-system-x86) S 1 4242 4242 0 -1 4194560 1449 0 0 0 \
                          12 5 0 0 20 0 3 0 98765 1234567 890 18446744073709551615 1 1 0 0 0 \
                          0 0 4096 0 0 0 0 17 2 0 0 0 0 0\n";

    #[test]
    fn test_parse_stat() {
        let stat = parse_stat(SAMPLE).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.state, ProcessState::Sleeping);
        assert_eq!(stat.start_time, 98765);
    }

    #[test]
    fn test_parse_stat_name_with_parens() {
        let data = SAMPLE.replace("(qemu-system-x86)", "(a) Z (b)");
        let stat = parse_stat(&data).unwrap();
        assert_eq!(stat.pid, 4242);
        assert_eq!(stat.state, ProcessState::Sleeping);
        assert_eq!(stat.start_time, 98765);
    }

    #[test]
    fn test_parse_stat_zombie() {
        let data = SAMPLE.replace(") S ", ") Z ");
        let stat = parse_stat(&data).unwrap();
        assert!(stat.state.is_exited());
    }

    #[test]
    fn test_parse_stat_truncated() {
        assert!(parse_stat("12 (sh) S 1 2").is_err());
        assert!(parse_stat("garbage").is_err());
    }

    #[test]
    fn test_stat_self() {
        let pid = std::process::id() as i32;
        let first = stat(pid).unwrap();
        assert_eq!(first.pid, pid);
        assert!(!first.state.is_exited());
        // The start time is a fingerprint: it does not change.
        assert_eq!(stat(pid).unwrap().start_time, first.start_time);
    }

    #[test]
    fn test_stat_missing_process() {
        let err = stat(i32::MAX).unwrap_err();
        assert!(err.is_not_found());
    }
}
