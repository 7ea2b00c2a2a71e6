use anyhow::{anyhow, Result};
use nix::sys::signal::Signal;
use std::str::FromStr;

/// Parse a signal given as a number (`9`) or a name with or without the
/// `SIG` prefix, in any case (`kill`, `SIGKILL`).
///
/// `0` yields `None`: the null signal, which only checks that the init
/// process exists.
pub fn parse_signal(raw: &str) -> Result<Option<Signal>> {
    let unknown = || anyhow!("unknown signal {:?}", raw);
    let raw_trimmed = raw.trim();
    if let Ok(number) = raw_trimmed.parse::<i32>() {
        if number == 0 {
            return Ok(None);
        }
        return Signal::try_from(number).map(Some).map_err(|_| unknown());
    }
    let mut name = raw_trimmed.to_ascii_uppercase();
    if !name.starts_with("SIG") {
        name.insert_str(0, "SIG");
    }
    Signal::from_str(&name).map(Some).map_err(|_| unknown())
}
