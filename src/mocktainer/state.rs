use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::configs::{Config, NamespaceType};
use super::error::{Error, Result};

pub const STATE_FILENAME: &str = "state.json";

/// Validate that an ID is safe for use in filesystem paths.
/// Rejects empty strings, path traversal (`..`), and characters outside `[a-zA-Z0-9._-]`.
/// IDs longer than 256 characters are also rejected.
pub fn validate_id(id: &str) -> Result<()> {
    let invalid = |reason| {
        Err(Error::InvalidId {
            id: id.to_string(),
            reason,
        })
    };
    if id.is_empty() {
        return invalid("must not be empty");
    }
    if id.len() > 256 {
        return invalid("must not exceed 256 characters");
    }
    if id == "." || id == ".." {
        return invalid("must not be '.' or '..'");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return invalid("contains invalid characters (allowed: a-zA-Z0-9._-)");
    }
    Ok(())
}

/// Everything needed to reload a container, persisted as `state.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub id: String,
    pub config: Config,
    /// 0 when no init process is tracked.
    pub init_process_pid: i32,
    /// Start time fingerprint of `init_process_pid`; 0 when unknown.
    pub init_process_start_time: u64,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub namespace_paths: BTreeMap<NamespaceType, String>,
}

pub fn state_path(state_dir: &Path) -> PathBuf {
    state_dir.join(STATE_FILENAME)
}

/// Write `state.json` by renaming a fully written temp file over it.
pub fn save(state_dir: &Path, state: &State) -> Result<()> {
    let data = serde_json::to_vec(state)?;
    let mut tmp = tempfile::Builder::new()
        .prefix("state-")
        .tempfile_in(state_dir)
        .map_err(|e| Error::io("creating temporary state file", e))?;
    tmp.write_all(&data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| Error::io("writing temporary state file", e))?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(|e| Error::io("setting state file permissions", e))?;
    tmp.persist(state_path(state_dir))
        .map_err(|e| Error::io("renaming state file", e.error))?;
    Ok(())
}

pub fn load(state_dir: &Path) -> Result<State> {
    let path = state_path(state_dir);
    let data = fs::read(&path).map_err(|e| Error::io(format!("reading {}", path.display()), e))?;
    Ok(serde_json::from_slice(&data)?)
}

/// Create the per-container state directory; an existing one means the id is taken.
pub fn create_dir(state_dir: &Path, id: &str) -> Result<()> {
    match fs::create_dir(state_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(Error::AlreadyExists(id.to_string()))
        }
        Err(e) => {
            return Err(Error::io(
                format!("creating state directory {}", state_dir.display()),
                e,
            ))
        }
    }
    fs::set_permissions(state_dir, fs::Permissions::from_mode(0o700))
        .map_err(|e| Error::io("setting state directory permissions", e))
}

/// Remove the state directory; a missing directory is not an error.
pub fn remove_dir(state_dir: &Path) -> Result<()> {
    match fs::remove_dir_all(state_dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(
            format!("removing state directory {}", state_dir.display()),
            e,
        )),
    }
}

/// The OCI state document printed by `runu state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub oci_version: String,
    pub id: String,
    /// 0 when the container is stopped.
    pub pid: i32,
    pub status: String,
    pub bundle: PathBuf,
    pub rootfs: PathBuf,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub owner: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn sample(id: &str) -> State {
        let mut namespace_paths = BTreeMap::new();
        namespace_paths.insert(NamespaceType::Net, "/proc/42/ns/net".to_string());
        State {
            id: id.to_string(),
            config: Config {
                rootfs: PathBuf::from("/bundle/rootfs"),
                labels: vec!["bundle=/bundle".to_string()],
                version: "1.0.2".to_string(),
                ..Default::default()
            },
            init_process_pid: 42,
            init_process_start_time: 98765,
            created: Utc::now(),
            namespace_paths,
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("c1");
        create_dir(&dir, "c1").unwrap();

        let state = sample("c1");
        save(&dir, &state).unwrap();
        let loaded = load(&dir).unwrap();
        assert_eq!(loaded, state);

        let mode = fs::metadata(state_path(&dir)).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("c1");
        create_dir(&dir, "c1").unwrap();

        save(&dir, &sample("c1")).unwrap();
        save(&dir, &sample("c1")).unwrap();

        let entries: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from(STATE_FILENAME)]);
    }

    #[test]
    fn test_state_json_field_names() {
        let json = serde_json::to_value(sample("c1")).unwrap();
        for field in [
            "id",
            "config",
            "init_process_pid",
            "init_process_start_time",
            "created",
            "namespace_paths",
        ] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(json["namespace_paths"]["NEWNET"], "/proc/42/ns/net");
    }

    #[test]
    fn test_create_dir_rejects_existing() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("c1");
        create_dir(&dir, "c1").unwrap();
        let mode = fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        let err = create_dir(&dir, "c1").unwrap_err();
        assert_eq!(err.to_string(), "container with id c1 already exists");
    }

    #[test]
    fn test_remove_dir_is_idempotent() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("c1");
        create_dir(&dir, "c1").unwrap();
        remove_dir(&dir).unwrap();
        assert!(!dir.exists());
        remove_dir(&dir).unwrap();
    }

    #[test]
    fn test_load_missing_state() {
        let root = TempDir::new().unwrap();
        let err = load(&root.path().join("nope")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_validate_id_valid() {
        assert!(validate_id("my-container").is_ok());
        assert!(validate_id("abc123").is_ok());
        assert!(validate_id("a.b_c-d").is_ok());
    }

    #[test]
    fn test_validate_id_rejects_bad_ids() {
        assert!(validate_id("").is_err());
        assert!(validate_id(".").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("../etc/passwd").is_err());
        assert!(validate_id("foo/bar").is_err());
        assert!(validate_id("foo bar").is_err());
        assert!(validate_id(&"a".repeat(257)).is_err());
        assert!(validate_id(&"a".repeat(256)).is_ok());
    }
}
