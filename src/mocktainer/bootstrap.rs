//! Bootstrap data sent to the init process before its configuration.
//!
//! The message is framed like a netlink request: a `nlmsghdr` followed by
//! `rtattr`-style attributes, all in host byte order. It tells the init
//! process which namespaces to create (clone flags) and which to join
//! (`"<name>:<path>"` pairs).

use nix::sched::CloneFlags;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use super::configs::NamespaceType;
use super::error::{Error, Result};

pub const INIT_MSG: u16 = 62000;
pub const CLONE_FLAGS_ATTR: u16 = 27281;
pub const NS_PATHS_ATTR: u16 = 27282;

const NLMSG_HDRLEN: usize = 16;
const NLA_HDRLEN: usize = 4;
const NLA_ALIGNTO: usize = 4;
const NLM_F_REQUEST: u16 = 0x1;

fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Decoded bootstrap data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapData {
    pub clone_flags: CloneFlags,
    /// Namespaces to join, in join order.
    pub ns_paths: Vec<(NamespaceType, PathBuf)>,
}

/// Whether the running kernel supports a namespace kind.
///
/// Probes `/proc/self/ns/<name>` once per kind and caches the answer.
pub fn is_namespace_supported(ns: NamespaceType) -> bool {
    static SUPPORTED: OnceLock<Mutex<HashMap<NamespaceType, bool>>> = OnceLock::new();

    let cache = SUPPORTED.get_or_init(|| Mutex::new(HashMap::new()));
    let mut cache = match cache.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *cache.entry(ns).or_insert_with(|| {
        Path::new("/proc/self/ns").join(ns.proc_name()).exists()
    })
}

fn order_namespace_paths(ns_paths: &HashMap<NamespaceType, PathBuf>) -> Result<Vec<String>> {
    let mut paths = Vec::with_capacity(ns_paths.len());
    for ns in NamespaceType::ALL {
        let Some(path) = ns_paths.get(&ns) else {
            continue;
        };
        if !is_namespace_supported(ns) {
            return Err(Error::Bootstrap(format!("namespace {} is not supported", ns)));
        }
        let path_str = path.to_string_lossy();
        if path_str.contains(',') {
            return Err(Error::Bootstrap(format!(
                "invalid namespace path {}",
                path.display()
            )));
        }
        std::fs::symlink_metadata(path)
            .map_err(|e| Error::io(format!("namespace path {}", path.display()), e))?;
        paths.push(format!("{}:{}", ns.proc_name(), path_str));
    }
    Ok(paths)
}

fn push_attr(buf: &mut Vec<u8>, typ: u16, value: &[u8]) {
    let len = NLA_HDRLEN + value.len();
    buf.extend_from_slice(&(len as u16).to_ne_bytes());
    buf.extend_from_slice(&typ.to_ne_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + nla_align(len) - len, 0);
}

/// Encode clone flags and namespace join paths for the init process.
pub fn encode(
    clone_flags: CloneFlags,
    ns_paths: &HashMap<NamespaceType, PathBuf>,
) -> Result<Vec<u8>> {
    let mut attrs = Vec::new();
    push_attr(
        &mut attrs,
        CLONE_FLAGS_ATTR,
        &(clone_flags.bits() as u32).to_ne_bytes(),
    );
    if !ns_paths.is_empty() {
        let joined = order_namespace_paths(ns_paths)?.join(",");
        let mut value = joined.into_bytes();
        value.push(0);
        push_attr(&mut attrs, NS_PATHS_ATTR, &value);
    }

    let total = NLMSG_HDRLEN + attrs.len();
    let mut msg = Vec::with_capacity(total);
    msg.extend_from_slice(&(total as u32).to_ne_bytes());
    msg.extend_from_slice(&INIT_MSG.to_ne_bytes());
    msg.extend_from_slice(&NLM_F_REQUEST.to_ne_bytes());
    msg.extend_from_slice(&1u32.to_ne_bytes()); // seq
    msg.extend_from_slice(&0u32.to_ne_bytes()); // pid
    msg.extend_from_slice(&attrs);
    Ok(msg)
}

/// Decode a complete message produced by [`encode`].
pub fn decode(buf: &[u8]) -> Result<BootstrapData> {
    if buf.len() < NLMSG_HDRLEN {
        return Err(Error::Bootstrap("short header".to_string()));
    }
    let len = u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let typ = u16::from_ne_bytes([buf[4], buf[5]]);
    if typ != INIT_MSG {
        return Err(Error::Bootstrap(format!("unexpected message type {}", typ)));
    }
    if len != buf.len() {
        return Err(Error::Bootstrap(format!(
            "length mismatch: header says {}, got {}",
            len,
            buf.len()
        )));
    }

    let mut data = BootstrapData {
        clone_flags: CloneFlags::empty(),
        ns_paths: Vec::new(),
    };
    let mut offset = NLMSG_HDRLEN;
    while offset < len {
        if offset + NLA_HDRLEN > len {
            return Err(Error::Bootstrap("truncated attribute header".to_string()));
        }
        let attr_len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        let attr_type = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]]);
        if attr_len < NLA_HDRLEN || offset + attr_len > len {
            return Err(Error::Bootstrap("truncated attribute".to_string()));
        }
        let payload = &buf[offset + NLA_HDRLEN..offset + attr_len];
        match attr_type {
            CLONE_FLAGS_ATTR => {
                let raw: [u8; 4] = payload
                    .try_into()
                    .map_err(|_| Error::Bootstrap("bad clone flags".to_string()))?;
                data.clone_flags = CloneFlags::from_bits_truncate(u32::from_ne_bytes(raw) as i32);
            }
            NS_PATHS_ATTR => {
                let text = payload.strip_suffix(&[0]).unwrap_or(payload);
                let text = std::str::from_utf8(text)
                    .map_err(|_| Error::Bootstrap("namespace paths are not utf-8".to_string()))?;
                for entry in text.split(',').filter(|e| !e.is_empty()) {
                    let (name, path) = entry.split_once(':').ok_or_else(|| {
                        Error::Bootstrap(format!("malformed namespace path {:?}", entry))
                    })?;
                    let ns = NamespaceType::from_proc_name(name).ok_or_else(|| {
                        Error::Bootstrap(format!("unknown namespace {:?}", name))
                    })?;
                    data.ns_paths.push((ns, PathBuf::from(path)));
                }
            }
            other => {
                return Err(Error::Bootstrap(format!("unknown attribute type {}", other)));
            }
        }
        offset += nla_align(attr_len);
    }
    Ok(data)
}

/// Read one message from a stream, using the header length to frame it.
pub fn read_from<R: Read>(reader: &mut R) -> Result<BootstrapData> {
    let mut header = [0u8; NLMSG_HDRLEN];
    reader
        .read_exact(&mut header)
        .map_err(|e| Error::io("reading bootstrap header", e))?;
    let len = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len < NLMSG_HDRLEN {
        return Err(Error::Bootstrap(format!("invalid message length {}", len)));
    }
    let mut buf = header.to_vec();
    buf.resize(len, 0);
    reader
        .read_exact(&mut buf[NLMSG_HDRLEN..])
        .map_err(|e| Error::io("reading bootstrap payload", e))?;
    decode(&buf)
}
