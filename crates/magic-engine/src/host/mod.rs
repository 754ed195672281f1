//! Host configuration layer.
//!
//! Every mutation of kernel routing/firewall state goes through the
//! [`HostBackend`] capability trait so the engine can run against the native
//! netlink backend, the subprocess fallback, or the in-memory model used by
//! tests. All operations are idempotent: re-running one converges to the
//! same host state (adding an existing rule and deleting a missing one both
//! succeed).
//!
//! The [`HostConfigurator`] serializes all host mutations behind one lock —
//! kernel state changes must be sequential — and is shared as `Arc` between
//! the data plane and the accounting module. The lock is independent of
//! every engine lock; callers must not hold engine locks while blocking on
//! host operations.

pub mod memory;
pub mod netlink;
pub mod shell;

use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use magic_common::types::FlowTuple;
use magic_common::Error;
use thiserror::Error;

pub use memory::MemoryHost;
pub use netlink::NativeHost;
pub use shell::ShellHost;

pub type HostResult = Result<(), HostError>;

/// A failed host mutation. Carries the operation name so a transaction can
/// log which shell of the configuration failed and compensate.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("{op}: no such interface {iface}")]
    NoSuchInterface { op: &'static str, iface: String },

    #[error("{op}: permission denied")]
    Permission { op: &'static str },

    #[error("{op} failed: {stderr}")]
    Failed { op: &'static str, stderr: String },
}

impl HostError {
    pub fn op(&self) -> &'static str {
        match self {
            HostError::NoSuchInterface { op, .. } => op,
            HostError::Permission { op } => op,
            HostError::Failed { op, .. } => op,
        }
    }

    /// Lift into the engine error taxonomy.
    pub fn into_engine(self) -> Error {
        Error::HostConfig {
            op: self.op(),
            detail: self.to_string(),
        }
    }
}

/// The set of host mutations the engine performs.
///
/// Routing classifiers tag packets with an nf-mark for policy routing;
/// connmark classifiers persist a conntrack mark for per-session
/// accounting. The two kinds live in the same `MAGIC_MARK` mangle chain
/// but are managed by different engine modules.
pub trait HostBackend: Send {
    // ── Interfaces & addresses ──────────────────────────────────────
    fn ensure_interface_up(&mut self, iface: &str) -> HostResult;
    fn ensure_interface_down(&mut self, iface: &str) -> HostResult;
    fn assign_addr(&mut self, iface: &str, cidr: &str) -> HostResult;
    fn flush_addrs(&mut self, iface: &str) -> HostResult;

    // ── Routes & policy rules ───────────────────────────────────────
    fn set_default_via(&mut self, table: u32, gateway: Option<IpAddr>, dev: &str) -> HostResult;
    fn add_route(&mut self, table: u32, prefix: &str, via: Option<IpAddr>, dev: &str)
        -> HostResult;
    fn del_route(&mut self, table: u32, prefix: &str) -> HostResult;
    fn add_fwmark_rule(&mut self, mark: u32, table: u32, priority: u32) -> HostResult;
    fn del_fwmark_rule(&mut self, mark: u32) -> HostResult;
    /// Install a routing table whose only entry blackholes everything.
    fn create_blackhole_table(&mut self, table: u32) -> HostResult;

    // ── Routing classifiers (nf-mark) ───────────────────────────────
    fn mark_src(&mut self, ip: IpAddr, fwmark: u32, dest_prefix: Option<&str>) -> HostResult;
    fn unmark_src(&mut self, ip: IpAddr, fwmark: u32, dest_prefix: Option<&str>) -> HostResult;
    fn mark_flow(&mut self, flow: &FlowTuple, fwmark: u32) -> HostResult;
    fn unmark_flow(&mut self, flow: &FlowTuple, fwmark: u32) -> HostResult;

    // ── Accounting classifiers (conntrack mark) ─────────────────────
    /// Install the src/dst pair tagging both directions of the client's
    /// connections with `mark`.
    fn connmark_pair_add(&mut self, ip: IpAddr, mark: u32) -> HostResult;
    fn connmark_pair_del(&mut self, ip: IpAddr, mark: u32) -> HostResult;
    /// Restore each connection's conntrack mark onto its packets at the
    /// PREROUTING hook. Installed once.
    fn restore_conn_mark_on_ingress(&mut self) -> HostResult;
    /// Drop every classifier (routing and accounting) keyed on `ip`.
    fn remove_classifiers_for(&mut self, ip: IpAddr) -> HostResult;

    // ── Sysctls ─────────────────────────────────────────────────────
    fn enable_conntrack_accounting(&mut self) -> HostResult;
}

/// Shared, globally serialized access to a [`HostBackend`].
pub struct HostConfigurator {
    inner: Mutex<Box<dyn HostBackend>>,
}

impl HostConfigurator {
    pub fn new(backend: Box<dyn HostBackend>) -> Self {
        HostConfigurator {
            inner: Mutex::new(backend),
        }
    }

    /// Acquire the backend for a sequence of operations. Host mutations are
    /// sequential process-wide; keep engine locks released while holding
    /// this guard.
    pub fn ops(&self) -> MutexGuard<'_, Box<dyn HostBackend>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Canonical textual form of a flow tuple used by backends for rule
/// bookkeeping ("src:port->dst:port/proto", 0 meaning any).
pub fn flow_key(flow: &FlowTuple) -> String {
    format!(
        "{}:{}->{}:{}/{}",
        flow.src_ip, flow.src_port, flow.dst_ip, flow.dst_port, flow.protocol
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_error_reports_op() {
        let err = HostError::Failed {
            op: "add_route",
            stderr: "RTNETLINK answers: network unreachable".into(),
        };
        assert_eq!(err.op(), "add_route");
        let engine = err.into_engine();
        assert!(matches!(engine, Error::HostConfig { op: "add_route", .. }));
    }

    #[test]
    fn flow_key_format() {
        let flow = FlowTuple {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "8.8.8.8".parse().unwrap(),
            src_port: 0,
            dst_port: 443,
            protocol: 6,
        };
        assert_eq!(flow_key(&flow), "10.0.0.1:0->8.8.8.8:443/6");
    }
}
