//! QEMU command line synthesis.

use std::env;

use super::{Arch, Machine, MachineDriver};

/// Overrides the VMM binary; the default is `qemu-system-<arch>`.
pub const QEMU_BIN_ENV: &str = "RUNU_QEMU_BIN";

const QMP_SOCKET: &str = "qemu.sock";

#[derive(Debug, Clone, Default)]
pub struct Qemu {
    binary: Option<String>,
}

impl Qemu {
    pub fn new(binary: Option<String>) -> Self {
        Qemu { binary }
    }

    /// Honor `RUNU_QEMU_BIN` when set and non-empty.
    pub fn from_env() -> Self {
        Qemu::new(env::var(QEMU_BIN_ENV).ok().filter(|b| !b.is_empty()))
    }

    pub fn binary(&self, arch: Arch) -> String {
        self.binary
            .clone()
            .unwrap_or_else(|| format!("qemu-system-{}", arch.qemu_name()))
    }
}

impl MachineDriver for Qemu {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn command_line(&self, machine: &Machine) -> Vec<String> {
        let mut args = vec![self.binary(machine.arch)];
        match machine.arch {
            Arch::X86_64 => {}
            Arch::Arm => args.extend(["-machine".to_string(), "virt".to_string()]),
            Arch::Arm64 => args.extend([
                "-machine".to_string(),
                "virt".to_string(),
                "-cpu".to_string(),
                "max".to_string(),
            ]),
        }

        args.push("-name".to_string());
        args.push(machine.id.clone());
        args.push("-kernel".to_string());
        args.push(machine.kernel.display().to_string());
        if let Some(initrd) = &machine.initrd {
            args.push("-initrd".to_string());
            args.push(initrd.display().to_string());
        }
        if !machine.kernel_args.is_empty() {
            args.push("-append".to_string());
            args.push(machine.kernel_args.join(" "));
        }
        args.push("-m".to_string());
        args.push(machine.memory.clone());
        args.push("-nographic".to_string());
        args.push("-no-reboot".to_string());

        let qmp = machine.state_dir.join(QMP_SOCKET);
        args.push("-qmp".to_string());
        args.push(format!("unix:{},server,nowait", qmp.display()));
        args.push("-S".to_string());
        args.push("-daemonize".to_string());
        args
    }
}
