use anyhow::{bail, Result};

/// Index of the `PID` column in a `ps` header line.
pub fn pid_column(header: &str) -> Result<usize> {
    match header.split_whitespace().position(|field| field == "PID") {
        Some(index) => Ok(index),
        None => bail!("couldn't find PID field in ps output"),
    }
}

/// Keep the header and the lines whose PID column is one of `pids`.
pub fn filter(output: &str, pids: &[i32]) -> Result<Vec<String>> {
    let mut lines = output.lines();
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let column = pid_column(header)?;

    let mut kept = vec![header.to_string()];
    for line in lines {
        let pid = line
            .split_whitespace()
            .nth(column)
            .and_then(|field| field.parse::<i32>().ok());
        if matches!(pid, Some(pid) if pids.contains(&pid)) {
            kept.push(line.to_string());
        }
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS_EF: &str = "\
UID          PID    PPID  C STIME TTY          TIME CMD
root           1       0  0 09:00 ?        00:00:01 /sbin/init
root        4242       1  2 09:01 ?        00:00:09 qemu-system-x86_64 -kernel k
user        4300    4100  0 09:02 pts/0    00:00:00 bash
";

    #[test]
    fn test_pid_column() {
        assert_eq!(pid_column("UID PID PPID C STIME TTY TIME CMD").unwrap(), 1);
        assert_eq!(pid_column("  PID TTY          TIME CMD").unwrap(), 0);
        assert!(pid_column("USER COMMAND").is_err());
    }

    #[test]
    fn test_filter_keeps_header_and_matches() {
        let lines = filter(PS_EF, &[4242]).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("UID"));
        assert!(lines[1].contains("qemu-system-x86_64"));
    }

    #[test]
    fn test_filter_without_pids() {
        assert_eq!(filter(PS_EF, &[]).unwrap().len(), 1);
        assert!(filter("", &[1]).unwrap().is_empty());
    }
}
