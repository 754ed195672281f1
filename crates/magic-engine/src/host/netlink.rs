//! Native host backend: routing via raw NETLINK_ROUTE sockets.
//!
//! Policy rules, routes, addresses, and link flags are programmed with
//! hand-built netlink messages — no subprocess in the routing path.
//! Classifier chains (mangle) still go through the `iptables` binary with
//! argv vectors; there is no stable netlink ABI worth hand-rolling for
//! them, and the arguments never embed untrusted strings.

use std::io;
use std::mem;
use std::net::IpAddr;

use magic_common::types::FlowTuple;
use tracing::debug;

use super::shell::{iptables, iptables_remove_for_ip};
use super::{HostBackend, HostError, HostResult};

// ── Netlink constants (linux/rtnetlink.h) ───────────────────────────

const NETLINK_ROUTE: libc::c_int = 0;

const RTM_NEWLINK: u16 = 16;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;
const RTM_NEWROUTE: u16 = 24;
const RTM_DELROUTE: u16 = 25;
const RTM_NEWRULE: u16 = 32;
const RTM_DELRULE: u16 = 33;

const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_REPLACE: u16 = 0x0100;
const NLM_F_CREATE: u16 = 0x0400;

const RTA_DST: u16 = 1;
const RTA_GATEWAY: u16 = 5;
const RTA_OIF: u16 = 4;
const RTA_TABLE: u16 = 15;

const FRA_PRIORITY: u16 = 6;
const FRA_FWMARK: u16 = 10;
const FRA_TABLE: u16 = 15;

const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;

const RTN_UNICAST: u8 = 1;
const RTN_BLACKHOLE: u8 = 6;
const RTPROT_STATIC: u8 = 4;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RT_SCOPE_LINK: u8 = 253;
const FR_ACT_TO_TBL: u8 = 1;

// ── Message scaffolding ─────────────────────────────────────────────

#[repr(C)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

#[repr(C)]
struct FibRuleHdr {
    family: u8,
    dst_len: u8,
    src_len: u8,
    tos: u8,
    table: u8,
    res1: u8,
    res2: u8,
    action: u8,
    flags: u32,
}

#[repr(C)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

#[repr(C)]
struct IfInfoMsg {
    ifi_family: u8,
    _pad: u8,
    ifi_type: u16,
    ifi_index: i32,
    ifi_flags: u32,
    ifi_change: u32,
}

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

fn push_bytes<T>(buf: &mut Vec<u8>, value: &T) {
    let bytes = unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>())
    };
    buf.extend_from_slice(bytes);
}

fn push_attr(buf: &mut Vec<u8>, attr_type: u16, data: &[u8]) {
    let attr_len = (4 + data.len()) as u16;
    buf.extend_from_slice(&attr_len.to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(data);
    for _ in 0..(align4(attr_len as usize) - attr_len as usize) {
        buf.push(0);
    }
}

fn push_attr_u32(buf: &mut Vec<u8>, attr_type: u16, value: u32) {
    push_attr(buf, attr_type, &value.to_ne_bytes());
}

fn push_attr_addr(buf: &mut Vec<u8>, attr_type: u16, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => push_attr(buf, attr_type, &v4.octets()),
        IpAddr::V6(v6) => push_attr(buf, attr_type, &v6.octets()),
    }
}

fn family_of(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => libc::AF_INET as u8,
        IpAddr::V6(_) => libc::AF_INET6 as u8,
    }
}

fn finish(buf: &mut [u8], msg_type: u16, flags: u16, seq: u32) {
    let hdr = NlMsgHdr {
        nlmsg_len: buf.len() as u32,
        nlmsg_type: msg_type,
        nlmsg_flags: flags,
        nlmsg_seq: seq,
        nlmsg_pid: 0,
    };
    let bytes = unsafe {
        std::slice::from_raw_parts(&hdr as *const NlMsgHdr as *const u8, mem::size_of::<NlMsgHdr>())
    };
    buf[..mem::size_of::<NlMsgHdr>()].copy_from_slice(bytes);
}

// ── Socket ──────────────────────────────────────────────────────────

struct NetlinkSocket {
    fd: i32,
    seq: u32,
}

impl NetlinkSocket {
    fn open(op: &'static str) -> Result<Self, HostError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EPERM) {
                return Err(HostError::Permission { op });
            }
            return Err(HostError::Failed {
                op,
                stderr: format!("netlink socket: {err}"),
            });
        }

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(HostError::Failed {
                op,
                stderr: format!("netlink bind: {err}"),
            });
        }

        Ok(NetlinkSocket { fd, seq: 1 })
    }

    fn next_seq(&mut self) -> u32 {
        let s = self.seq;
        self.seq += 1;
        s
    }

    /// Send one message and read its ACK. Returns the (positive) kernel
    /// errno on NLMSG_ERROR, 0 on success.
    fn send_and_ack(&mut self, buf: &[u8], op: &'static str) -> Result<i32, HostError> {
        let sent =
            unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), 0) };
        if sent < 0 {
            return Err(HostError::Failed {
                op,
                stderr: format!("netlink send: {}", io::Error::last_os_error()),
            });
        }

        let mut recv_buf = [0u8; 4096];
        let len = unsafe {
            libc::recv(
                self.fd,
                recv_buf.as_mut_ptr() as *mut libc::c_void,
                recv_buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(HostError::Failed {
                op,
                stderr: format!("netlink recv: {}", io::Error::last_os_error()),
            });
        }

        let hdr_len = mem::size_of::<NlMsgHdr>() as isize;
        if len >= hdr_len {
            let hdr = unsafe { &*(recv_buf.as_ptr() as *const NlMsgHdr) };
            if hdr.nlmsg_type == libc::NLMSG_ERROR as u16 && len >= hdr_len + 4 {
                let err =
                    unsafe { *(recv_buf.as_ptr().add(hdr_len as usize) as *const i32) };
                return Ok(-err);
            }
        }
        Ok(0)
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn if_index(op: &'static str, name: &str) -> Result<u32, HostError> {
    let c_name = std::ffi::CString::new(name).map_err(|_| HostError::NoSuchInterface {
        op,
        iface: name.to_string(),
    })?;
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        Err(HostError::NoSuchInterface {
            op,
            iface: name.to_string(),
        })
    } else {
        Ok(idx)
    }
}

/// Parse "10.0.0.0/24", a bare address, or "default".
fn parse_prefix(op: &'static str, prefix: &str) -> Result<(IpAddr, u8), HostError> {
    if prefix == "default" || prefix == "0.0.0.0/0" {
        return Ok((IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0));
    }
    let (addr_str, len_str) = match prefix.split_once('/') {
        Some((a, l)) => (a, Some(l)),
        None => (prefix, None),
    };
    let addr: IpAddr = addr_str.parse().map_err(|_| HostError::Failed {
        op,
        stderr: format!("bad prefix {prefix}"),
    })?;
    let full = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    let len = match len_str {
        Some(l) => l.parse::<u8>().map_err(|_| HostError::Failed {
            op,
            stderr: format!("bad prefix length in {prefix}"),
        })?,
        None => full,
    };
    if len > full {
        return Err(HostError::Failed {
            op,
            stderr: format!("prefix length {len} too large in {prefix}"),
        });
    }
    Ok((addr, len))
}

/// Map an rtnetlink errno to an idempotent result: adds tolerate EEXIST,
/// deletes tolerate ENOENT/ESRCH/EADDRNOTAVAIL.
fn map_errno(op: &'static str, errno: i32, deleting: bool) -> HostResult {
    match errno {
        0 => Ok(()),
        libc::EEXIST if !deleting => Ok(()),
        libc::ENOENT | libc::ESRCH | libc::EADDRNOTAVAIL if deleting => Ok(()),
        libc::EPERM | libc::EACCES => Err(HostError::Permission { op }),
        libc::ENODEV => Err(HostError::Failed {
            op,
            stderr: "no such device".into(),
        }),
        e => Err(HostError::Failed {
            op,
            stderr: io::Error::from_raw_os_error(e).to_string(),
        }),
    }
}

// ── Backend ─────────────────────────────────────────────────────────

/// Host backend speaking rtnetlink directly.
#[derive(Default)]
pub struct NativeHost;

impl NativeHost {
    pub fn new() -> Self {
        NativeHost
    }

    fn set_link_flags(&self, op: &'static str, iface: &str, up: bool) -> HostResult {
        let index = if_index(op, iface)?;
        let mut sock = NetlinkSocket::open(op)?;
        let seq = sock.next_seq();

        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        push_bytes(
            &mut buf,
            &IfInfoMsg {
                ifi_family: libc::AF_UNSPEC as u8,
                _pad: 0,
                ifi_type: 0,
                ifi_index: index as i32,
                ifi_flags: if up { libc::IFF_UP as u32 } else { 0 },
                ifi_change: libc::IFF_UP as u32,
            },
        );
        finish(&mut buf, RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        let errno = sock.send_and_ack(&buf, op)?;
        map_errno(op, errno, false)
    }

    fn modify_rule(
        &self,
        op: &'static str,
        deleting: bool,
        mark: u32,
        table: u32,
        priority: Option<u32>,
    ) -> HostResult {
        let mut sock = NetlinkSocket::open(op)?;
        let seq = sock.next_seq();

        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        push_bytes(
            &mut buf,
            &FibRuleHdr {
                family: libc::AF_INET as u8,
                dst_len: 0,
                src_len: 0,
                tos: 0,
                table: if table <= 255 { table as u8 } else { 0 },
                res1: 0,
                res2: 0,
                action: FR_ACT_TO_TBL,
                flags: 0,
            },
        );
        push_attr_u32(&mut buf, FRA_FWMARK, mark);
        if table > 255 {
            push_attr_u32(&mut buf, FRA_TABLE, table);
        }
        if let Some(prio) = priority {
            push_attr_u32(&mut buf, FRA_PRIORITY, prio);
        }

        let (msg_type, flags) = if deleting {
            (RTM_DELRULE, NLM_F_REQUEST | NLM_F_ACK)
        } else {
            (RTM_NEWRULE, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE)
        };
        finish(&mut buf, msg_type, flags, seq);
        let errno = sock.send_and_ack(&buf, op)?;
        map_errno(op, errno, deleting)
    }

    fn modify_route(
        &self,
        op: &'static str,
        deleting: bool,
        table: u32,
        prefix: &str,
        via: Option<IpAddr>,
        dev: Option<&str>,
        route_type: u8,
    ) -> HostResult {
        let (dst, dst_len) = parse_prefix(op, prefix)?;
        let mut sock = NetlinkSocket::open(op)?;
        let seq = sock.next_seq();

        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        push_bytes(
            &mut buf,
            &RtMsg {
                rtm_family: family_of(dst),
                rtm_dst_len: dst_len,
                rtm_src_len: 0,
                rtm_tos: 0,
                rtm_table: if table <= 255 { table as u8 } else { 0 },
                rtm_protocol: RTPROT_STATIC,
                rtm_scope: if via.is_some() || dst_len == 0 {
                    RT_SCOPE_UNIVERSE
                } else {
                    RT_SCOPE_LINK
                },
                rtm_type: route_type,
                rtm_flags: 0,
            },
        );
        if dst_len > 0 {
            push_attr_addr(&mut buf, RTA_DST, dst);
        }
        if let Some(gw) = via {
            push_attr_addr(&mut buf, RTA_GATEWAY, gw);
        }
        if let Some(dev) = dev {
            push_attr_u32(&mut buf, RTA_OIF, if_index(op, dev)?);
        }
        if table > 255 {
            push_attr_u32(&mut buf, RTA_TABLE, table);
        }

        let (msg_type, flags) = if deleting {
            (RTM_DELROUTE, NLM_F_REQUEST | NLM_F_ACK)
        } else {
            (
                RTM_NEWROUTE,
                NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
            )
        };
        finish(&mut buf, msg_type, flags, seq);
        let errno = sock.send_and_ack(&buf, op)?;
        map_errno(op, errno, deleting)
    }

    fn modify_addr(
        &self,
        op: &'static str,
        deleting: bool,
        iface: &str,
        addr: IpAddr,
        prefix_len: u8,
    ) -> HostResult {
        let index = if_index(op, iface)?;
        let mut sock = NetlinkSocket::open(op)?;
        let seq = sock.next_seq();

        let mut buf = Vec::with_capacity(96);
        buf.extend_from_slice(&[0u8; mem::size_of::<NlMsgHdr>()]);
        push_bytes(
            &mut buf,
            &IfAddrMsg {
                ifa_family: family_of(addr),
                ifa_prefixlen: prefix_len,
                ifa_flags: 0,
                ifa_scope: RT_SCOPE_UNIVERSE,
                ifa_index: index,
            },
        );
        push_attr_addr(&mut buf, IFA_LOCAL, addr);
        push_attr_addr(&mut buf, IFA_ADDRESS, addr);

        let (msg_type, flags) = if deleting {
            (RTM_DELADDR, NLM_F_REQUEST | NLM_F_ACK)
        } else {
            (RTM_NEWADDR, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE)
        };
        finish(&mut buf, msg_type, flags, seq);
        let errno = sock.send_and_ack(&buf, op)?;
        map_errno(op, errno, deleting)
    }

    /// Enumerate IPv4 addresses assigned to `iface` via getifaddrs.
    fn addrs_of(iface: &str) -> Vec<(IpAddr, u8)> {
        let mut found = Vec::new();
        unsafe {
            let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
            if libc::getifaddrs(&mut ifaddrs) != 0 {
                return found;
            }
            let mut current = ifaddrs;
            while !current.is_null() {
                let ifa = &*current;
                if !ifa.ifa_addr.is_null() {
                    let name = std::ffi::CStr::from_ptr(ifa.ifa_name).to_string_lossy();
                    if name == iface && (*ifa.ifa_addr).sa_family == libc::AF_INET as u16 {
                        let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                        let ip = IpAddr::V4(std::net::Ipv4Addr::from(u32::from_be(
                            addr.sin_addr.s_addr,
                        )));
                        let prefix = if ifa.ifa_netmask.is_null() {
                            32
                        } else {
                            let mask = &*(ifa.ifa_netmask as *const libc::sockaddr_in);
                            u32::from_be(mask.sin_addr.s_addr).count_ones() as u8
                        };
                        found.push((ip, prefix));
                    }
                }
                current = ifa.ifa_next;
            }
            libc::freeifaddrs(ifaddrs);
        }
        found
    }
}

impl HostBackend for NativeHost {
    fn ensure_interface_up(&mut self, iface: &str) -> HostResult {
        self.set_link_flags("ensure_interface_up", iface, true)
    }

    fn ensure_interface_down(&mut self, iface: &str) -> HostResult {
        self.set_link_flags("ensure_interface_down", iface, false)
    }

    fn assign_addr(&mut self, iface: &str, cidr: &str) -> HostResult {
        const OP: &str = "assign_addr";
        let (addr, prefix_len) = parse_prefix(OP, cidr)?;
        self.modify_addr(OP, false, iface, addr, prefix_len)
    }

    fn flush_addrs(&mut self, iface: &str) -> HostResult {
        const OP: &str = "flush_addrs";
        for (addr, prefix_len) in Self::addrs_of(iface) {
            self.modify_addr(OP, true, iface, addr, prefix_len)?;
        }
        Ok(())
    }

    fn set_default_via(&mut self, table: u32, gateway: Option<IpAddr>, dev: &str) -> HostResult {
        self.modify_route(
            "set_default_via",
            false,
            table,
            "default",
            gateway,
            Some(dev),
            RTN_UNICAST,
        )
    }

    fn add_route(
        &mut self,
        table: u32,
        prefix: &str,
        via: Option<IpAddr>,
        dev: &str,
    ) -> HostResult {
        self.modify_route("add_route", false, table, prefix, via, Some(dev), RTN_UNICAST)
    }

    fn del_route(&mut self, table: u32, prefix: &str) -> HostResult {
        self.modify_route("del_route", true, table, prefix, None, None, RTN_UNICAST)
    }

    fn add_fwmark_rule(&mut self, mark: u32, table: u32, priority: u32) -> HostResult {
        debug!(mark, table, priority, "installing fwmark rule");
        self.modify_rule("add_fwmark_rule", false, mark, table, Some(priority))
    }

    fn del_fwmark_rule(&mut self, mark: u32) -> HostResult {
        self.modify_rule("del_fwmark_rule", true, mark, 0, None)
    }

    fn create_blackhole_table(&mut self, table: u32) -> HostResult {
        self.modify_route(
            "create_blackhole_table",
            false,
            table,
            "default",
            None,
            None,
            RTN_BLACKHOLE,
        )
    }

    fn mark_src(&mut self, ip: IpAddr, fwmark: u32, dest_prefix: Option<&str>) -> HostResult {
        let mark = fwmark.to_string();
        let src = ip.to_string();
        let mut args: Vec<&str> = vec!["-s", &src];
        if let Some(dest) = dest_prefix {
            args.extend_from_slice(&["-d", dest]);
        }
        args.extend_from_slice(&["-j", "MARK", "--set-mark", &mark]);
        iptables("mark_src", "-A", &args)
    }

    fn unmark_src(&mut self, ip: IpAddr, fwmark: u32, dest_prefix: Option<&str>) -> HostResult {
        let mark = fwmark.to_string();
        let src = ip.to_string();
        let mut args: Vec<&str> = vec!["-s", &src];
        if let Some(dest) = dest_prefix {
            args.extend_from_slice(&["-d", dest]);
        }
        args.extend_from_slice(&["-j", "MARK", "--set-mark", &mark]);
        iptables("unmark_src", "-D", &args)
    }

    fn mark_flow(&mut self, flow: &FlowTuple, fwmark: u32) -> HostResult {
        iptables_flow_rule("mark_flow", "-A", flow, fwmark)
    }

    fn unmark_flow(&mut self, flow: &FlowTuple, fwmark: u32) -> HostResult {
        iptables_flow_rule("unmark_flow", "-D", flow, fwmark)
    }

    fn connmark_pair_add(&mut self, ip: IpAddr, mark: u32) -> HostResult {
        let hex = format!("{mark:#x}");
        let addr = ip.to_string();
        iptables(
            "connmark_pair_add",
            "-A",
            &["-s", &addr, "-j", "CONNMARK", "--set-mark", &hex],
        )?;
        iptables(
            "connmark_pair_add",
            "-A",
            &["-d", &addr, "-j", "CONNMARK", "--set-mark", &hex],
        )
    }

    fn connmark_pair_del(&mut self, ip: IpAddr, mark: u32) -> HostResult {
        let hex = format!("{mark:#x}");
        let addr = ip.to_string();
        iptables(
            "connmark_pair_del",
            "-D",
            &["-s", &addr, "-j", "CONNMARK", "--set-mark", &hex],
        )?;
        iptables(
            "connmark_pair_del",
            "-D",
            &["-d", &addr, "-j", "CONNMARK", "--set-mark", &hex],
        )
    }

    fn restore_conn_mark_on_ingress(&mut self) -> HostResult {
        iptables(
            "restore_conn_mark_on_ingress",
            "-A",
            &["-j", "CONNMARK", "--restore-mark"],
        )
    }

    fn remove_classifiers_for(&mut self, ip: IpAddr) -> HostResult {
        iptables_remove_for_ip("remove_classifiers_for", ip)
    }

    fn enable_conntrack_accounting(&mut self) -> HostResult {
        const OP: &str = "enable_conntrack_accounting";
        std::fs::write("/proc/sys/net/netfilter/nf_conntrack_acct", "1").map_err(|e| {
            if e.kind() == io::ErrorKind::PermissionDenied {
                HostError::Permission { op: OP }
            } else {
                HostError::Failed {
                    op: OP,
                    stderr: e.to_string(),
                }
            }
        })
    }
}

/// Build the iptables match arguments for a 5-tuple and apply a MARK rule.
pub(super) fn iptables_flow_rule(
    op: &'static str,
    verb: &str,
    flow: &FlowTuple,
    fwmark: u32,
) -> HostResult {
    let src = flow.src_ip.to_string();
    let dst = flow.dst_ip.to_string();
    let sport = flow.src_port.to_string();
    let dport = flow.dst_port.to_string();
    let proto = flow.protocol.to_string();
    let mark = fwmark.to_string();

    let mut args: Vec<&str> = vec!["-s", &src, "-d", &dst];
    if flow.protocol != 0 {
        args.extend_from_slice(&["-p", &proto]);
        if flow.src_port != 0 {
            args.extend_from_slice(&["--sport", &sport]);
        }
        if flow.dst_port != 0 {
            args.extend_from_slice(&["--dport", &dport]);
        }
    }
    args.extend_from_slice(&["-j", "MARK", "--set-mark", &mark]);
    iptables(op, verb, &args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefix_forms() {
        assert_eq!(
            parse_prefix("t", "default").unwrap(),
            ("0.0.0.0".parse().unwrap(), 0)
        );
        assert_eq!(
            parse_prefix("t", "10.1.0.0/16").unwrap(),
            ("10.1.0.0".parse().unwrap(), 16)
        );
        assert_eq!(
            parse_prefix("t", "192.168.1.5").unwrap(),
            ("192.168.1.5".parse().unwrap(), 32)
        );
        assert_eq!(
            parse_prefix("t", "fd00::/8").unwrap(),
            ("fd00::".parse().unwrap(), 8)
        );
        assert!(parse_prefix("t", "not-an-ip").is_err());
        assert!(parse_prefix("t", "10.0.0.0/40").is_err());
    }

    #[test]
    fn errno_mapping_is_idempotent() {
        assert!(map_errno("t", 0, false).is_ok());
        assert!(map_errno("t", libc::EEXIST, false).is_ok());
        assert!(map_errno("t", libc::ENOENT, true).is_ok());
        assert!(map_errno("t", libc::ESRCH, true).is_ok());
        assert!(map_errno("t", libc::ENOENT, false).is_err());
        assert!(matches!(
            map_errno("t", libc::EPERM, false),
            Err(HostError::Permission { .. })
        ));
    }

    #[test]
    fn attr_alignment() {
        let mut buf = Vec::new();
        push_attr(&mut buf, FRA_FWMARK, &[1, 2, 3]);
        assert_eq!(buf.len(), 8, "3-byte payload pads to 4");
        let declared = u16::from_ne_bytes([buf[0], buf[1]]);
        assert_eq!(declared, 7);
    }
}
