//! The virtual machine a container runs.
//!
//! `create` describes the machine from the bundle, lets a [`MachineDriver`]
//! render the VMM command line for a frozen machine, and strips the flags
//! that only make sense when the VMM manages itself. The remaining argv is
//! what the container's init process finally executes.

pub mod elf;
pub mod qemu;

use std::path::{Path, PathBuf};

use crate::mocktainer::Config;

/// Annotation naming the kernel image, relative to the rootfs.
pub const KERNEL_ANNOTATION: &str = "org.unikraft.kernel";
pub const DEFAULT_KERNEL: &str = "unikraft/bin/kernel";
/// Annotation naming an optional initrd, relative to the rootfs.
pub const INITRD_ANNOTATION: &str = "org.unikraft.initrd";
/// Annotation with the guest memory size, in QEMU's notation.
pub const MEMORY_ANNOTATION: &str = "org.unikraft.memory";
pub const DEFAULT_MEMORY: &str = "64M";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unsupported kernel architecture (e_machine {0})")]
    UnsupportedArch(u16),

    #[error("kernel is not an ELF image")]
    NotElf,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Guest CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm,
    Arm64,
}

impl Arch {
    /// Suffix of the matching `qemu-system-*` binary.
    pub fn qemu_name(self) -> &'static str {
        match self {
            Arch::X86_64 => "x86_64",
            Arch::Arm => "arm",
            Arch::Arm64 => "aarch64",
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.qemu_name())
    }
}

/// Everything a driver needs to render a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    /// Container id, used as the guest name.
    pub id: String,
    pub arch: Arch,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    /// Kernel command line arguments: the OCI process args.
    pub kernel_args: Vec<String>,
    pub memory: String,
    /// Directory for the VMM's control sockets.
    pub state_dir: PathBuf,
}

/// Resolve an annotated path under the rootfs; absolute values stay inside it.
fn rootfs_path(rootfs: &Path, value: &str) -> PathBuf {
    rootfs.join(value.trim_start_matches('/'))
}

impl Machine {
    /// Describe the machine for a converted container config.
    pub fn from_config(
        id: &str,
        config: &Config,
        kernel_args: &[String],
        state_dir: &Path,
    ) -> Result<Self> {
        let (_, annotations) = config.annotations();
        let kernel = rootfs_path(
            &config.rootfs,
            annotations
                .get(KERNEL_ANNOTATION)
                .map(String::as_str)
                .unwrap_or(DEFAULT_KERNEL),
        );
        let arch = elf::detect_file(&kernel)?;
        Ok(Machine {
            id: id.to_string(),
            arch,
            kernel,
            initrd: annotations
                .get(INITRD_ANNOTATION)
                .map(|v| rootfs_path(&config.rootfs, v)),
            kernel_args: kernel_args.to_vec(),
            memory: annotations
                .get(MEMORY_ANNOTATION)
                .cloned()
                .unwrap_or_else(|| DEFAULT_MEMORY.to_string()),
            state_dir: state_dir.to_path_buf(),
        })
    }
}

/// A VMM backend.
pub trait MachineDriver {
    fn name(&self) -> &'static str;

    /// The full argv, binary first, for a machine that starts frozen and
    /// daemonizes.
    fn command_line(&self, machine: &Machine) -> Vec<String>;
}

/// Flags dropped outright.
const DROPPED_FLAGS: &[&str] = &["-daemonize", "-S"];
/// Flags dropped together with their value.
const DROPPED_OPTIONS: &[&str] = &["-qmp", "-monitor", "-pidfile", "-mon"];

/// Strip the arguments that make the VMM background itself, stay frozen or
/// expose control sockets; the container's init process is the VMM.
pub fn sanitize_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        let flag = arg.as_str();
        if DROPPED_FLAGS.contains(&flag) {
            continue;
        }
        if DROPPED_OPTIONS.contains(&flag) {
            iter.next();
            continue;
        }
        if flag == "-chardev" {
            if let Some(value) = iter.peek() {
                if value.starts_with("socket") {
                    iter.next();
                    continue;
                }
            }
        }
        out.push(arg.clone());
    }
    out
}
