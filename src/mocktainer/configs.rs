//! Immutable container configuration derived from an OCI spec.

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::hooks::Hooks;
use crate::spec;

/// Label carrying the bundle directory the container was created from.
pub const BUNDLE_LABEL: &str = "bundle";

/// Network type for a namespace that only has a loopback interface.
pub const LOOPBACK_NETWORK: &str = "loopback";

/// Kinds of Linux namespaces.
///
/// Every kind can be described in the persisted configuration and encoded for
/// the init process, but the spec converter only produces [`NamespaceType::Net`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum NamespaceType {
    #[serde(rename = "NEWUSER")]
    User,
    #[serde(rename = "NEWIPC")]
    Ipc,
    #[serde(rename = "NEWUTS")]
    Uts,
    #[serde(rename = "NEWNET")]
    Net,
    #[serde(rename = "NEWPID")]
    Pid,
    #[serde(rename = "NEWNS")]
    Mount,
    #[serde(rename = "NEWCGROUP")]
    Cgroup,
}

impl NamespaceType {
    /// All kinds, in the order the init process must join them.
    pub const ALL: [NamespaceType; 7] = [
        NamespaceType::User,
        NamespaceType::Ipc,
        NamespaceType::Uts,
        NamespaceType::Net,
        NamespaceType::Pid,
        NamespaceType::Mount,
        NamespaceType::Cgroup,
    ];

    /// Name of the namespace file under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        match self {
            NamespaceType::User => "user",
            NamespaceType::Ipc => "ipc",
            NamespaceType::Uts => "uts",
            NamespaceType::Net => "net",
            NamespaceType::Pid => "pid",
            NamespaceType::Mount => "mnt",
            NamespaceType::Cgroup => "cgroup",
        }
    }

    pub fn from_proc_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.proc_name() == name)
    }

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NamespaceType::User => CloneFlags::CLONE_NEWUSER,
            NamespaceType::Ipc => CloneFlags::CLONE_NEWIPC,
            NamespaceType::Uts => CloneFlags::CLONE_NEWUTS,
            NamespaceType::Net => CloneFlags::CLONE_NEWNET,
            NamespaceType::Pid => CloneFlags::CLONE_NEWPID,
            NamespaceType::Mount => CloneFlags::CLONE_NEWNS,
            NamespaceType::Cgroup => CloneFlags::CLONE_NEWCGROUP,
        }
    }
}

impl std::fmt::Display for NamespaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// A requested namespace: created fresh when `path` is empty, joined otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    #[serde(rename = "type")]
    pub typ: NamespaceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Namespace {
    /// The external path, or the namespace of `pid` when none was given.
    pub fn get_path(&self, pid: i32) -> PathBuf {
        match &self.path {
            Some(p) => p.clone(),
            None => PathBuf::from(format!("/proc/{}/ns/{}", pid, self.typ.proc_name())),
        }
    }
}

/// Ordered list of requested namespaces.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespaces(pub Vec<Namespace>);

impl Namespaces {
    pub fn contains(&self, typ: NamespaceType) -> bool {
        self.0.iter().any(|ns| ns.typ == typ)
    }

    pub fn path_of(&self, typ: NamespaceType) -> Option<&Path> {
        self.0
            .iter()
            .find(|ns| ns.typ == typ)
            .and_then(|ns| ns.path.as_deref())
    }

    pub fn add(&mut self, typ: NamespaceType, path: Option<PathBuf>) {
        self.0.push(Namespace { typ, path });
    }

    /// Flags for the namespaces that must be created rather than joined.
    pub fn clone_flags(&self) -> CloneFlags {
        self.0
            .iter()
            .filter(|ns| ns.path.is_none())
            .fold(CloneFlags::empty(), |flags, ns| flags | ns.typ.clone_flag())
    }

    /// Namespaces that must be joined, keyed by kind.
    pub fn join_paths(&self) -> HashMap<NamespaceType, PathBuf> {
        self.0
            .iter()
            .filter_map(|ns| ns.path.clone().map(|p| (ns.typ, p)))
            .collect()
    }
}

/// A network to configure inside the container's network namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    #[serde(rename = "type")]
    pub typ: String,
}

impl Network {
    pub fn loopback() -> Self {
        Network {
            typ: LOOPBACK_NETWORK.to_string(),
        }
    }
}

/// Container configuration, persisted inside `state.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Absolute path to the container's root filesystem.
    pub rootfs: PathBuf,
    #[serde(default)]
    pub readonlyfs: bool,
    #[serde(default)]
    pub namespaces: Namespaces,
    #[serde(default)]
    pub networks: Vec<Network>,
    #[serde(default)]
    pub hooks: Hooks,
    /// `key=value` labels, including `bundle=<dir>`.
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub process_label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_armor_profile: String,
    /// Signal delivered to init when the runtime that created it dies; 0 for none.
    #[serde(default)]
    pub parent_death_signal: i32,
    #[serde(default)]
    pub version: String,
}

impl Config {
    /// Recover the bundle directory and the spec annotations from the labels.
    pub fn annotations(&self) -> (PathBuf, HashMap<String, String>) {
        let mut bundle = PathBuf::new();
        let mut annotations = HashMap::new();
        for label in &self.labels {
            if let Some((key, value)) = label.split_once('=') {
                if key == BUNDLE_LABEL {
                    bundle = PathBuf::from(value);
                } else {
                    annotations.insert(key.to_string(), value.to_string());
                }
            }
        }
        (bundle, annotations)
    }

    /// The OCI state handed to lifecycle hooks.
    pub fn hook_state(&self, id: &str, status: &str, pid: Option<i32>) -> spec::State {
        let (bundle, annotations) = self.annotations();
        spec::State {
            oci_version: spec::OCI_VERSION.to_string(),
            id: id.to_string(),
            status: status.to_string(),
            pid,
            bundle,
            annotations,
        }
    }

    /// Whether init must bring up loopback in a fresh network namespace.
    pub fn wants_loopback(&self) -> bool {
        self.namespaces.contains(NamespaceType::Net)
            && self.namespaces.path_of(NamespaceType::Net).is_none()
            && self.networks.iter().any(|n| n.typ == LOOPBACK_NETWORK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_get_path() {
        let fresh = Namespace {
            typ: NamespaceType::Net,
            path: None,
        };
        assert_eq!(fresh.get_path(42), PathBuf::from("/proc/42/ns/net"));

        let joined = Namespace {
            typ: NamespaceType::Net,
            path: Some(PathBuf::from("/var/run/netns/blue")),
        };
        assert_eq!(joined.get_path(42), PathBuf::from("/var/run/netns/blue"));
    }

    #[test]
    fn test_clone_flags_only_for_fresh_namespaces() {
        let mut namespaces = Namespaces::default();
        namespaces.add(NamespaceType::Net, None);
        namespaces.add(NamespaceType::Uts, Some(PathBuf::from("/proc/1/ns/uts")));

        assert_eq!(namespaces.clone_flags(), CloneFlags::CLONE_NEWNET);
        let paths = namespaces.join_paths();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[&NamespaceType::Uts], PathBuf::from("/proc/1/ns/uts"));
    }

    #[test]
    fn test_namespace_type_serializes_as_clone_name() {
        let json = serde_json::to_string(&NamespaceType::Net).unwrap();
        assert_eq!(json, "\"NEWNET\"");
        assert_eq!(NamespaceType::from_proc_name("mnt"), Some(NamespaceType::Mount));
        assert_eq!(NamespaceType::from_proc_name("bogus"), None);
    }

    #[test]
    fn test_annotations_from_labels() {
        let config = Config {
            labels: vec![
                "bundle=/run/bundles/c1".to_string(),
                "org.unikraft.kernel=unikraft/bin/kernel".to_string(),
                "no-equals".to_string(),
            ],
            ..Default::default()
        };
        let (bundle, annotations) = config.annotations();
        assert_eq!(bundle, PathBuf::from("/run/bundles/c1"));
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations["org.unikraft.kernel"], "unikraft/bin/kernel");

        let state = config.hook_state("c1", "creating", Some(7));
        assert_eq!(state.bundle, PathBuf::from("/run/bundles/c1"));
        assert_eq!(state.status, "creating");
        assert_eq!(state.pid, Some(7));
        assert_eq!(state.annotations.len(), 1);
    }

    #[test]
    fn test_wants_loopback() {
        let mut config = Config::default();
        assert!(!config.wants_loopback());

        config.namespaces.add(NamespaceType::Net, None);
        config.networks.push(Network::loopback());
        assert!(config.wants_loopback());

        config.namespaces = Namespaces::default();
        config
            .namespaces
            .add(NamespaceType::Net, Some(PathBuf::from("/var/run/netns/x")));
        assert!(!config.wants_loopback());
    }
}
