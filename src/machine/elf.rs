//! Kernel architecture detection from the ELF header.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::{Arch, Error, Result};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_DATA: usize = 5;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const E_MACHINE_OFFSET: usize = 18;

const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

/// Map the `e_machine` field onto a supported architecture.
pub fn arch_from_machine(machine: u16) -> Result<Arch> {
    match machine {
        EM_X86_64 => Ok(Arch::X86_64),
        EM_ARM => Ok(Arch::Arm),
        EM_AARCH64 => Ok(Arch::Arm64),
        other => Err(Error::UnsupportedArch(other)),
    }
}

/// Detect the architecture of an ELF image held in memory.
pub fn detect(header: &[u8]) -> Result<Arch> {
    if header.len() < E_MACHINE_OFFSET + 2 || header[..4] != ELF_MAGIC {
        return Err(Error::NotElf);
    }
    let raw = [header[E_MACHINE_OFFSET], header[E_MACHINE_OFFSET + 1]];
    let machine = match header[EI_DATA] {
        ELFDATA2LSB => u16::from_le_bytes(raw),
        ELFDATA2MSB => u16::from_be_bytes(raw),
        _ => return Err(Error::NotElf),
    };
    arch_from_machine(machine)
}

/// Detect the architecture of the kernel image at `path`.
pub fn detect_file(path: &Path) -> Result<Arch> {
    let mut header = Vec::with_capacity(E_MACHINE_OFFSET + 2);
    File::open(path)
        .and_then(|f| f.take((E_MACHINE_OFFSET + 2) as u64).read_to_end(&mut header))
        .map_err(|source| Error::Io {
            context: format!("reading kernel {}", path.display()),
            source,
        })?;
    detect(&header)
}

#[cfg(test)]
pub(crate) fn fake_header(machine: u16, big_endian: bool) -> Vec<u8> {
    let mut header = vec![0u8; 64];
    header[..4].copy_from_slice(&ELF_MAGIC);
    header[4] = 2; // ELFCLASS64
    header[EI_DATA] = if big_endian { ELFDATA2MSB } else { ELFDATA2LSB };
    let bytes = if big_endian {
        machine.to_be_bytes()
    } else {
        machine.to_le_bytes()
    };
    header[E_MACHINE_OFFSET..E_MACHINE_OFFSET + 2].copy_from_slice(&bytes);
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_detect_supported_machines() {
        assert_eq!(detect(&fake_header(62, false)).unwrap(), Arch::X86_64);
        assert_eq!(detect(&fake_header(40, false)).unwrap(), Arch::Arm);
        assert_eq!(detect(&fake_header(183, false)).unwrap(), Arch::Arm64);
        assert_eq!(detect(&fake_header(183, true)).unwrap(), Arch::Arm64);
    }

    #[test]
    fn test_detect_rejects_other_machines() {
        // EM_RISCV
        let err = detect(&fake_header(243, false)).unwrap_err();
        assert!(err.to_string().contains("unsupported kernel architecture"));
    }

    #[test]
    fn test_detect_rejects_non_elf() {
        assert!(matches!(detect(b"#!/bin/sh\necho hi\n"), Err(Error::NotElf)));
        assert!(matches!(detect(&[0x7f, b'E']), Err(Error::NotElf)));
    }

    #[test]
    fn test_detect_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("kernel");
        std::fs::write(&path, fake_header(62, false)).unwrap();
        assert_eq!(detect_file(&path).unwrap(), Arch::X86_64);

        let err = detect_file(&dir.path().join("missing")).unwrap_err();
        assert!(err.to_string().starts_with("reading kernel"));
    }
}
