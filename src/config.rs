//! Shared configuration file loader for runu.
//!
//! Reads `/etc/runu/runu.conf` (or path from `RUNU_CONFIG` env var)
//! and sets environment variables for any keys not already present.
//!
//! File format: simple `KEY=VALUE` lines. Comments (`#`) and blank lines
//! are ignored. Environment variables always take precedence over file values,
//! and command line flags take precedence over both.

use std::path::PathBuf;

/// Default config file path.
const DEFAULT_CONFIG_PATH: &str = "/etc/runu/runu.conf";

/// Path of the config file that [`load_config`] reads.
pub fn config_path() -> PathBuf {
    std::env::var("RUNU_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Parse `KEY=VALUE` lines, skipping comments, blank lines and empty keys.
pub fn parse_config(contents: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in contents.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        // Split on first '=' only (values may contain '=')
        if let Some((key, value)) = trimmed.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            pairs.push((key.to_string(), value.trim().to_string()));
        }
    }
    pairs
}

/// Load configuration from the runu config file.
///
/// Search order:
/// 1. `RUNU_CONFIG` env var (explicit path override)
/// 2. `/etc/runu/runu.conf`
///
/// For each `KEY=VALUE` line, sets the environment variable only if it
/// is not already set. Returns the number of variables applied.
///
/// Silently returns if the config file doesn't exist (not an error).
pub fn load_config() -> usize {
    let contents = match std::fs::read_to_string(config_path()) {
        Ok(c) => c,
        Err(_) => return 0,
    };

    let mut applied = 0;
    for (key, value) in parse_config(&contents) {
        if std::env::var_os(&key).is_none() {
            std::env::set_var(key, value);
            applied += 1;
        }
    }
    applied
}
