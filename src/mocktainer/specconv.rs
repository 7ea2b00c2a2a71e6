//! Conversion of an OCI runtime spec into a container [`Config`].

use std::path::Path;

use super::configs::{Config, NamespaceType, Namespaces, Network, BUNDLE_LABEL};
use super::error::{Error, Result};
use super::hooks::{CommandHook, HookName, Hooks};
use crate::spec::{self, Spec};

/// Options for [`create_config`].
#[derive(Debug, Clone, Default)]
pub struct CreateOpts {
    pub spec: Spec,
}

/// Map an OCI namespace name onto a supported kind.
///
/// Only network namespaces are wired up by the runtime; every other name is
/// rejected.
fn namespace_mapping(name: &str) -> Option<NamespaceType> {
    match name {
        "network" => Some(NamespaceType::Net),
        _ => None,
    }
}

/// Build a [`Config`] from the spec, resolving paths against the current
/// working directory (the bundle).
pub fn create_config(opts: &CreateOpts) -> Result<Config> {
    let cwd = std::env::current_dir()
        .map_err(|e| Error::io("getting current working directory", e))?;
    create_config_in(opts, &cwd)
}

/// [`create_config`] with an explicit bundle directory.
pub fn create_config_in(opts: &CreateOpts, cwd: &Path) -> Result<Config> {
    let spec = &opts.spec;
    let root = spec
        .root
        .as_ref()
        .ok_or_else(|| Error::Config("root must be specified".to_string()))?;

    let rootfs = if root.path.is_absolute() {
        root.path.clone()
    } else {
        cwd.join(&root.path)
    };

    let mut labels = Vec::with_capacity(spec.annotations.len() + 1);
    labels.push(format!("{}={}", BUNDLE_LABEL, cwd.display()));
    let mut annotations: Vec<_> = spec.annotations.iter().collect();
    annotations.sort();
    for (key, value) in annotations {
        labels.push(format!("{}={}", key, value));
    }

    let mut config = Config {
        rootfs,
        readonlyfs: root.readonly,
        labels,
        version: spec.oci_version.clone(),
        ..Default::default()
    };

    if let Some(process) = &spec.process {
        config.process_label = process.selinux_label.clone().unwrap_or_default();
        config.app_armor_profile = process.apparmor_profile.clone().unwrap_or_default();
    }

    if let Some(linux) = &spec.linux {
        config.namespaces = convert_namespaces(&linux.namespaces)?;
        if config.namespaces.contains(NamespaceType::Net)
            && config.namespaces.path_of(NamespaceType::Net).is_none()
        {
            config.networks = vec![Network::loopback()];
        }
    }

    if let Some(hooks) = &spec.hooks {
        config.hooks = convert_hooks(hooks)?;
    }

    Ok(config)
}

fn convert_namespaces(requested: &[spec::LinuxNamespace]) -> Result<Namespaces> {
    let mut namespaces = Namespaces::default();
    for ns in requested {
        let typ = namespace_mapping(&ns.typ)
            .ok_or_else(|| Error::Config(format!("namespace {:?} does not exist", ns.typ)))?;
        if namespaces.contains(typ) {
            return Err(Error::Config(format!(
                "malformed spec file: duplicated ns {:?}",
                ns.typ
            )));
        }
        let path = ns
            .path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .cloned();
        namespaces.add(typ, path);
    }
    Ok(namespaces)
}

fn convert_hooks(hooks: &spec::Hooks) -> Result<Hooks> {
    let mut converted = Hooks::default();
    let lists = [
        (HookName::Prestart, &hooks.prestart),
        (HookName::CreateRuntime, &hooks.create_runtime),
        (HookName::CreateContainer, &hooks.create_container),
        (HookName::StartContainer, &hooks.start_container),
        (HookName::Poststart, &hooks.poststart),
        (HookName::Poststop, &hooks.poststop),
    ];
    for (name, list) in lists {
        for hook in list {
            if hook.timeout == Some(0) {
                return Err(Error::Config(format!(
                    "{} hook {}: timeout must be greater than zero",
                    name,
                    hook.path.display()
                )));
            }
            converted.push(name, CommandHook::from(hook));
        }
    }
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{Hook, Linux, LinuxNamespace, Root};
    use std::path::PathBuf;

    fn base_spec() -> Spec {
        Spec {
            oci_version: "1.0.2".to_string(),
            root: Some(Root {
                path: PathBuf::from("rootfs"),
                readonly: false,
            }),
            ..Default::default()
        }
    }

    fn network(path: Option<&str>) -> LinuxNamespace {
        LinuxNamespace {
            typ: "network".to_string(),
            path: path.map(PathBuf::from),
        }
    }

    #[test]
    fn test_missing_root_is_rejected() {
        let opts = CreateOpts {
            spec: Spec::default(),
        };
        let err = create_config_in(&opts, Path::new("/bundle")).unwrap_err();
        assert_eq!(err.to_string(), "root must be specified");
    }

    #[test]
    fn test_relative_rootfs_and_bundle_label() {
        let mut spec = base_spec();
        spec.annotations
            .insert("org.unikraft.kernel".to_string(), "kernel".to_string());
        let config = create_config_in(&CreateOpts { spec }, Path::new("/bundle")).unwrap();

        assert_eq!(config.rootfs, PathBuf::from("/bundle/rootfs"));
        assert_eq!(config.labels[0], "bundle=/bundle");
        assert_eq!(config.version, "1.0.2");
        let (bundle, annotations) = config.annotations();
        assert_eq!(bundle, PathBuf::from("/bundle"));
        assert_eq!(annotations["org.unikraft.kernel"], "kernel");
        assert_eq!(config.namespaces, Namespaces::default());
        assert!(config.networks.is_empty());
    }

    #[test]
    fn test_absolute_rootfs_kept() {
        let mut spec = base_spec();
        spec.root = Some(Root {
            path: PathBuf::from("/srv/rootfs"),
            readonly: true,
        });
        let config = create_config_in(&CreateOpts { spec }, Path::new("/bundle")).unwrap();
        assert_eq!(config.rootfs, PathBuf::from("/srv/rootfs"));
        assert!(config.readonlyfs);
    }

    #[test]
    fn test_fresh_network_namespace_gets_loopback() {
        let mut spec = base_spec();
        spec.linux = Some(Linux {
            namespaces: vec![network(None)],
        });
        let config = create_config_in(&CreateOpts { spec }, Path::new("/bundle")).unwrap();
        assert!(config.namespaces.contains(NamespaceType::Net));
        assert_eq!(config.networks, vec![Network::loopback()]);
        assert!(config.wants_loopback());
    }

    #[test]
    fn test_joined_network_namespace_has_no_networks() {
        let mut spec = base_spec();
        spec.linux = Some(Linux {
            namespaces: vec![network(Some("/var/run/netns/blue"))],
        });
        let config = create_config_in(&CreateOpts { spec }, Path::new("/bundle")).unwrap();
        assert_eq!(
            config.namespaces.path_of(NamespaceType::Net),
            Some(Path::new("/var/run/netns/blue"))
        );
        assert!(config.networks.is_empty());
    }

    #[test]
    fn test_duplicate_namespace_is_rejected() {
        let mut spec = base_spec();
        spec.linux = Some(Linux {
            namespaces: vec![network(None), network(Some("/var/run/netns/blue"))],
        });
        let err = create_config_in(&CreateOpts { spec }, Path::new("/bundle")).unwrap_err();
        assert!(err.to_string().contains("duplicated ns"), "got: {}", err);
    }

    #[test]
    fn test_unknown_namespace_is_rejected() {
        let mut spec = base_spec();
        spec.linux = Some(Linux {
            namespaces: vec![LinuxNamespace {
                typ: "pid".to_string(),
                path: None,
            }],
        });
        let err = create_config_in(&CreateOpts { spec }, Path::new("/bundle")).unwrap_err();
        assert_eq!(err.to_string(), "namespace \"pid\" does not exist");
    }

    #[test]
    fn test_hooks_and_labels_converted() {
        let mut spec = base_spec();
        spec.process = Some(spec::Process {
            selinux_label: Some("system_u:system_r:container_t:s0".to_string()),
            apparmor_profile: Some("runu-default".to_string()),
            ..Default::default()
        });
        spec.hooks = Some(spec::Hooks {
            create_runtime: vec![Hook {
                path: PathBuf::from("/usr/bin/setup-net"),
                args: vec!["setup-net".to_string(), "up".to_string()],
                env: vec![],
                timeout: Some(3),
            }],
            poststop: vec![Hook {
                path: PathBuf::from("/usr/bin/cleanup"),
                ..Default::default()
            }],
            ..Default::default()
        });

        let config = create_config_in(&CreateOpts { spec }, Path::new("/bundle")).unwrap();
        assert_eq!(config.process_label, "system_u:system_r:container_t:s0");
        assert_eq!(config.app_armor_profile, "runu-default");

        let create_runtime = config.hooks.get(HookName::CreateRuntime);
        assert_eq!(create_runtime.len(), 1);
        assert_eq!(create_runtime[0].timeout, Some(3));
        assert_eq!(create_runtime[0].args, vec!["setup-net", "up"]);
        assert_eq!(config.hooks.get(HookName::Poststop).len(), 1);
        assert!(config.hooks.get(HookName::Poststart).is_empty());
    }

    #[test]
    fn test_zero_hook_timeout_rejected() {
        let mut spec = base_spec();
        spec.hooks = Some(spec::Hooks {
            poststart: vec![Hook {
                path: PathBuf::from("/usr/bin/notify"),
                timeout: Some(0),
                ..Default::default()
            }],
            ..Default::default()
        });
        let err = create_config_in(&CreateOpts { spec }, Path::new("/bundle")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "poststart hook /usr/bin/notify: timeout must be greater than zero"
        );
    }
}
