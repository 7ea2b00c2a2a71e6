use std::fs;
use std::process::{Command, Output};
use tempfile::TempDir;

/// `delete --force` of an unknown container succeeds and only touches the
/// root directory, which makes it a cheap way to see where the root is.
fn force_delete(envs: &[(&str, &str)], remove: &[&str]) -> Output {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_runu"));
    for key in remove {
        cmd.env_remove(key);
    }
    for (key, value) in envs {
        cmd.env(key, value);
    }
    cmd.args(["delete", "--force", "ghost"])
        .output()
        .expect("Failed to run delete command")
}

/// The config file can provide RUNU_ROOT when the environment does not.
#[test]
fn test_config_file_sets_root() {
    let state_dir = TempDir::new().expect("Failed to create state dir");
    let state_root = state_dir.path().join("runu");

    let conf_dir = TempDir::new().expect("Failed to create conf dir");
    let conf_path = conf_dir.path().join("runu.conf");
    fs::write(
        &conf_path,
        format!("# Test config\nRUNU_ROOT={}\n", state_root.display()),
    )
    .expect("Failed to write runu.conf");

    let output = force_delete(
        &[("RUNU_CONFIG", conf_path.to_str().unwrap())],
        &["RUNU_ROOT"],
    );
    assert!(
        output.status.success(),
        "delete failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(
        state_root.is_dir(),
        "root should be created at the config-file location: {:?}",
        state_root
    );
}

/// Environment variables win over config file values.
#[test]
fn test_env_var_overrides_config_file() {
    let conf_state_dir = TempDir::new().expect("Failed to create conf state dir");
    let conf_root = conf_state_dir.path().join("from-conf");
    let env_state_dir = TempDir::new().expect("Failed to create env state dir");
    let env_root = env_state_dir.path().join("from-env");

    let conf_dir = TempDir::new().expect("Failed to create conf dir");
    let conf_path = conf_dir.path().join("runu.conf");
    fs::write(&conf_path, format!("RUNU_ROOT={}\n", conf_root.display()))
        .expect("Failed to write runu.conf");

    let output = force_delete(
        &[
            ("RUNU_CONFIG", conf_path.to_str().unwrap()),
            ("RUNU_ROOT", env_root.to_str().unwrap()),
        ],
        &[],
    );
    assert!(
        output.status.success(),
        "delete failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(env_root.is_dir(), "root should come from the environment");
    assert!(!conf_root.exists(), "config file root should be ignored");
}

/// A missing config file is not an error.
#[test]
fn test_missing_config_file_is_silent() {
    let state_dir = TempDir::new().expect("Failed to create state dir");
    let output = force_delete(
        &[
            ("RUNU_CONFIG", "/tmp/nonexistent-runu-config-12345.conf"),
            ("RUNU_ROOT", state_dir.path().to_str().unwrap()),
        ],
        &[],
    );
    assert!(
        output.status.success(),
        "delete should succeed even with missing config file: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Without a root from any source the command fails.
#[test]
fn test_missing_root_is_an_error() {
    let output = force_delete(
        &[("RUNU_CONFIG", "/tmp/nonexistent-runu-config-12345.conf")],
        &["RUNU_ROOT"],
    );
    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("root directory is required"),
        "got: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}
