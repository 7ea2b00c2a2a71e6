//! OCI lifecycle hooks.
//!
//! Reference: <https://github.com/opencontainers/runtime-spec/blob/main/config.md#posix-platform-hooks>

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::error::{Error, Result};
use crate::spec;

/// Points in the container lifecycle at which hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HookName {
    /// Deprecated; runs together with `createRuntime`.
    Prestart,
    /// Runtime namespace, after the container environment exists.
    CreateRuntime,
    /// Before the container's root is finalised.
    CreateContainer,
    /// In the init process, right before the workload is executed.
    StartContainer,
    /// After the init process has been started.
    Poststart,
    /// After the container has been deleted.
    Poststop,
}

impl std::fmt::Display for HookName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookName::Prestart => "prestart",
            HookName::CreateRuntime => "createRuntime",
            HookName::CreateContainer => "createContainer",
            HookName::StartContainer => "startContainer",
            HookName::Poststart => "poststart",
            HookName::Poststop => "poststop",
        };
        f.write_str(name)
    }
}

/// An external command run with the OCI state on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHook {
    pub path: PathBuf,
    /// Full argv, including argv[0].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// `KEY=VALUE` pairs; when empty the hook inherits the runtime environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Seconds after which the hook is killed; zero means no timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl From<&spec::Hook> for CommandHook {
    fn from(hook: &spec::Hook) -> Self {
        CommandHook {
            path: hook.path.clone(),
            args: hook.args.clone(),
            env: hook.env.clone(),
            dir: None,
            timeout: hook.timeout,
        }
    }
}

impl CommandHook {
    /// Run the hook to completion, killing it if it outlives its timeout.
    pub fn run(&self, state: &spec::State) -> std::result::Result<(), String> {
        let data = serde_json::to_vec(state).map_err(|e| e.to_string())?;

        let mut cmd = Command::new(&self.path);
        if let Some((argv0, rest)) = self.args.split_first() {
            cmd.arg0(argv0).args(rest);
        }
        if !self.env.is_empty() {
            cmd.env_clear();
            for kv in &self.env {
                if let Some((k, v)) = kv.split_once('=') {
                    cmd.env(k, v);
                }
            }
        }
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| e.to_string())?;
        let pid = Pid::from_raw(child.id() as i32);

        // The hook may never read its stdin.
        if let Some(mut stdin) = child.stdin.take() {
            thread::spawn(move || {
                let _ = stdin.write_all(&data);
            });
        }

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });

        let output = match self.timeout.filter(|secs| *secs > 0) {
            None => rx.recv().map_err(|e| e.to_string())?,
            Some(secs) => match rx.recv_timeout(Duration::from_secs(secs)) {
                Ok(output) => output,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("hook {} timed out after {}s, killing", self.path.display(), secs);
                    let _ = kill(pid, Signal::SIGKILL);
                    // Reap it so neither the process nor the waiter leaks.
                    let _ = rx.recv();
                    return Err(format!(
                        "hook ran past specified timeout of {:.1}s",
                        secs as f64
                    ));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err("hook waiter exited unexpectedly".to_string())
                }
            },
        };

        let output = output.map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(format!(
                "{}, stdout: {}, stderr: {}",
                output.status,
                String::from_utf8_lossy(&output.stdout).trim(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Hooks keyed by lifecycle point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hooks(pub BTreeMap<HookName, Vec<CommandHook>>);

impl Hooks {
    pub fn get(&self, name: HookName) -> &[CommandHook] {
        self.0.get(&name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn push(&mut self, name: HookName, hook: CommandHook) {
        self.0.entry(name).or_default().push(hook);
    }

    /// Run every hook registered for `name`, stopping at the first failure.
    pub fn run(&self, name: HookName, state: &spec::State) -> Result<()> {
        for (index, hook) in self.get(name).iter().enumerate() {
            debug!("running {} hook #{}: {}", name, index, hook.path.display());
            hook.run(state).map_err(|reason| Error::Hook {
                name: name.to_string(),
                index,
                reason,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;
    use tempfile::TempDir;

    fn state() -> spec::State {
        spec::State {
            oci_version: spec::OCI_VERSION.to_string(),
            id: "hooked".to_string(),
            status: "creating".to_string(),
            pid: Some(1234),
            bundle: PathBuf::from("/bundle"),
            annotations: HashMap::new(),
        }
    }

    fn sh(script: &str) -> CommandHook {
        CommandHook {
            path: PathBuf::from("/bin/sh"),
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            env: Vec::new(),
            dir: None,
            timeout: None,
        }
    }

    #[test]
    fn test_hook_receives_state_on_stdin() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("state.json");
        let hook = sh(&format!("cat > {}", out.display()));

        hook.run(&state()).unwrap();

        let written: spec::State =
            serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(written, state());
    }

    #[test]
    fn test_hook_failure_reports_output() {
        let hook = sh("echo out; echo err >&2; exit 3");
        let err = hook.run(&state()).unwrap_err();
        assert!(err.contains("stdout: out"), "got: {}", err);
        assert!(err.contains("stderr: err"), "got: {}", err);
    }

    #[test]
    fn test_hook_timeout_kills_process() {
        let mut hook = sh("exec sleep 30");
        hook.timeout = Some(1);

        let started = Instant::now();
        let err = hook.run(&state()).unwrap_err();
        assert!(err.contains("ran past specified timeout of 1.0s"), "got: {}", err);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_zero_timeout_waits_for_hook() {
        let mut hook = sh("sleep 0.2");
        hook.timeout = Some(0);
        hook.run(&state()).unwrap();
    }

    #[test]
    fn test_hook_env_replaces_environment() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("env");
        let mut hook = sh(&format!("echo \"$HOOK_VAR\" > {}", out.display()));
        hook.env = vec!["HOOK_VAR=present".to_string()];

        hook.run(&state()).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "present");
    }

    #[test]
    fn test_hooks_run_stops_at_first_failure() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("second-ran");

        let mut hooks = Hooks::default();
        hooks.push(HookName::Poststart, sh("exit 1"));
        hooks.push(HookName::Poststart, sh(&format!("touch {}", marker.display())));

        let err = hooks.run(HookName::Poststart, &state()).unwrap_err();
        assert!(err.to_string().starts_with("error running poststart hook #0"));
        assert!(!marker.exists());

        // Nothing registered is a no-op.
        hooks.run(HookName::Poststop, &state()).unwrap();
    }

    #[test]
    fn test_hooks_serialize_by_name() {
        let mut hooks = Hooks::default();
        hooks.push(HookName::CreateRuntime, sh("true"));
        let json = serde_json::to_value(&hooks).unwrap();
        assert!(json.get("createRuntime").is_some());

        let back: Hooks = serde_json::from_value(json).unwrap();
        assert_eq!(back, hooks);
    }
}
