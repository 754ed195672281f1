//! Kernel connection-tracking counters.
//!
//! Accounting needs, per conntrack entry: its mark and the byte/packet
//! counters of both directions. The [`ConntrackReader`] trait hides how
//! they are obtained; the real implementation dumps the kernel table over
//! an nfnetlink socket (both address families), and tests inject entries
//! through [`MemoryConntrack`].

use std::io;
use std::mem;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};

/// One conntrack entry, reduced to what accounting consumes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConntrackEntry {
    pub mark: u32,
    /// orig direction: client → world.
    pub orig_bytes: u64,
    pub orig_packets: u64,
    /// reply direction: world → client.
    pub reply_bytes: u64,
    pub reply_packets: u64,
}

pub trait ConntrackReader: Send {
    /// Dump the conntrack table across IPv4 and IPv6.
    fn dump(&mut self) -> Result<Vec<ConntrackEntry>>;
}

// ── Netfilter netlink implementation ────────────────────────────────

const NETLINK_NETFILTER: libc::c_int = 12;

const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_GET: u16 = 1;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_DUMP: u16 = 0x0300;

const NLMSG_DONE: u16 = 3;
const NLMSG_ERROR: u16 = 2;

const CTA_COUNTERS_ORIG: u16 = 9;
const CTA_COUNTERS_REPLY: u16 = 10;
const CTA_MARK: u16 = 8;
const CTA_COUNTERS_PACKETS: u16 = 1;
const CTA_COUNTERS_BYTES: u16 = 2;

/// Nested-attribute flag bit in nla_type.
const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = 0x3FFF;

#[repr(C)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
struct NfGenMsg {
    nfgen_family: u8,
    version: u8,
    res_id: u16,
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Walk netlink attributes within `data`, yielding (type, payload).
fn attrs<'a>(data: &'a [u8]) -> impl Iterator<Item = (u16, &'a [u8])> + 'a {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset + 4 > data.len() {
            return None;
        }
        let nla_len =
            u16::from_ne_bytes([data[offset], data[offset + 1]]) as usize;
        let nla_type = u16::from_ne_bytes([data[offset + 2], data[offset + 3]]);
        if nla_len < 4 || offset + nla_len > data.len() {
            return None;
        }
        let payload = &data[offset + 4..offset + nla_len];
        offset += align4(nla_len);
        Some((nla_type & NLA_TYPE_MASK, payload))
    })
}

fn be32(data: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(data.get(..4)?.try_into().ok()?))
}

fn be64(data: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(data.get(..8)?.try_into().ok()?))
}

/// Parse a nested CTA_COUNTERS_* block into (packets, bytes).
fn parse_counters(data: &[u8]) -> (u64, u64) {
    let mut packets = 0;
    let mut bytes = 0;
    for (attr_type, payload) in attrs(data) {
        match attr_type {
            CTA_COUNTERS_PACKETS => packets = be64(payload).unwrap_or(0),
            CTA_COUNTERS_BYTES => bytes = be64(payload).unwrap_or(0),
            _ => {}
        }
    }
    (packets, bytes)
}

/// Parse one conntrack message payload (after the nfgenmsg).
fn parse_entry(data: &[u8]) -> ConntrackEntry {
    let mut entry = ConntrackEntry::default();
    for (attr_type, payload) in attrs(data) {
        match attr_type {
            CTA_MARK => entry.mark = be32(payload).unwrap_or(0),
            CTA_COUNTERS_ORIG => {
                let (packets, bytes) = parse_counters(payload);
                entry.orig_packets = packets;
                entry.orig_bytes = bytes;
            }
            CTA_COUNTERS_REPLY => {
                let (packets, bytes) = parse_counters(payload);
                entry.reply_packets = packets;
                entry.reply_bytes = bytes;
            }
            _ => {}
        }
    }
    entry
}

/// Conntrack reader speaking nfnetlink directly.
#[derive(Default)]
pub struct NetfilterConntrack;

impl NetfilterConntrack {
    pub fn new() -> Self {
        NetfilterConntrack
    }

    fn dump_family(&self, family: u8, out: &mut Vec<ConntrackEntry>) -> Result<()> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_NETFILTER,
            )
        };
        if fd < 0 {
            bail!("nfnetlink socket: {}", io::Error::last_os_error());
        }
        // Ensure the fd is always reclaimed.
        struct Fd(i32);
        impl Drop for Fd {
            fn drop(&mut self) {
                unsafe { libc::close(self.0) };
            }
        }
        let fd = Fd(fd);

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        let rc = unsafe {
            libc::bind(
                fd.0,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if rc < 0 {
            bail!("nfnetlink bind: {}", io::Error::last_os_error());
        }

        // Request: dump the whole table for this family.
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        let gen = NfGenMsg {
            nfgen_family: family,
            version: 0,
            res_id: 0,
        };
        let gen_bytes = unsafe {
            std::slice::from_raw_parts(
                &gen as *const NfGenMsg as *const u8,
                mem::size_of::<NfGenMsg>(),
            )
        };
        buf.extend_from_slice(gen_bytes);
        let hdr = NlMsgHdr {
            nlmsg_len: buf.len() as u32,
            nlmsg_type: (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET,
            nlmsg_flags: NLM_F_REQUEST | NLM_F_DUMP,
            nlmsg_seq: 1,
            nlmsg_pid: 0,
        };
        let hdr_bytes = unsafe {
            std::slice::from_raw_parts(
                &hdr as *const NlMsgHdr as *const u8,
                mem::size_of::<NlMsgHdr>(),
            )
        };
        buf[..mem::size_of::<NlMsgHdr>()].copy_from_slice(hdr_bytes);

        let sent =
            unsafe { libc::send(fd.0, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if sent < 0 {
            bail!("nfnetlink send: {}", io::Error::last_os_error());
        }

        // Multi-part response ends with NLMSG_DONE.
        let mut recv_buf = vec![0u8; 64 * 1024];
        loop {
            let len = unsafe {
                libc::recv(
                    fd.0,
                    recv_buf.as_mut_ptr() as *mut libc::c_void,
                    recv_buf.len(),
                    0,
                )
            };
            if len < 0 {
                bail!("nfnetlink recv: {}", io::Error::last_os_error());
            }
            let mut offset = 0usize;
            let len = len as usize;
            while offset + mem::size_of::<NlMsgHdr>() <= len {
                let hdr = unsafe { &*(recv_buf.as_ptr().add(offset) as *const NlMsgHdr) };
                let msg_len = hdr.nlmsg_len as usize;
                if msg_len < mem::size_of::<NlMsgHdr>() || offset + msg_len > len {
                    break;
                }
                match hdr.nlmsg_type {
                    NLMSG_DONE => return Ok(()),
                    NLMSG_ERROR => {
                        let errno = if msg_len >= mem::size_of::<NlMsgHdr>() + 4 {
                            unsafe {
                                -*(recv_buf
                                    .as_ptr()
                                    .add(offset + mem::size_of::<NlMsgHdr>())
                                    as *const i32)
                            }
                        } else {
                            libc::EIO
                        };
                        bail!(
                            "conntrack dump rejected: {}",
                            io::Error::from_raw_os_error(errno)
                        );
                    }
                    _ => {
                        let payload_start =
                            offset + mem::size_of::<NlMsgHdr>() + mem::size_of::<NfGenMsg>();
                        if payload_start <= offset + msg_len {
                            out.push(parse_entry(&recv_buf[payload_start..offset + msg_len]));
                        }
                    }
                }
                offset += align4(msg_len);
            }
        }
    }
}

impl ConntrackReader for NetfilterConntrack {
    fn dump(&mut self) -> Result<Vec<ConntrackEntry>> {
        let mut entries = Vec::new();
        self.dump_family(libc::AF_INET as u8, &mut entries)
            .context("ipv4 conntrack dump")?;
        // A host without IPv6 conntrack is fine; the v4 pass already
        // succeeded, so only log-worthy.
        if let Err(e) = self.dump_family(libc::AF_INET6 as u8, &mut entries) {
            tracing::debug!(error = %e, "ipv6 conntrack dump skipped");
        }
        Ok(entries)
    }
}

// ── Test double ─────────────────────────────────────────────────────

/// Shared in-memory conntrack table for tests: inject entries, observe
/// what the engine reads.
#[derive(Clone, Default)]
pub struct MemoryConntrack {
    entries: Arc<Mutex<Vec<ConntrackEntry>>>,
    fail: Arc<Mutex<bool>>,
}

impl MemoryConntrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_entries(&self, entries: Vec<ConntrackEntry>) {
        *self.entries.lock().unwrap_or_else(|e| e.into_inner()) = entries;
    }

    pub fn push(&self, entry: ConntrackEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    pub fn clear(&self) {
        self.set_entries(Vec::new());
    }

    /// Make every subsequent dump fail until re-enabled.
    pub fn set_failing(&self, failing: bool) {
        *self.fail.lock().unwrap_or_else(|e| e.into_inner()) = failing;
    }
}

impl ConntrackReader for MemoryConntrack {
    fn dump(&mut self) -> Result<Vec<ConntrackEntry>> {
        if *self.fail.lock().unwrap_or_else(|e| e.into_inner()) {
            bail!("conntrack unavailable");
        }
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
