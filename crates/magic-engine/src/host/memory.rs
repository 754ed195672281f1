//! In-memory host model for tests.
//!
//! Models the host as plain sets of addresses, routes, policy rules, and
//! classifiers so tests can assert that an allocate→release round trip
//! returns the host to a bit-identical state, and can inject a failure into
//! any single operation to exercise transaction rollback.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use magic_common::types::FlowTuple;

use super::{flow_key, HostBackend, HostError, HostResult};

/// One installed classifier rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Classifier {
    /// Routing mark on packets sourced from the ip (optional dest prefix).
    MarkSrc {
        ip: IpAddr,
        fwmark: u32,
        dest: Option<String>,
    },
    /// Routing mark on packets matching a 5-tuple.
    MarkFlow { flow: String, fwmark: u32 },
    /// Conntrack mark on traffic from the client ip.
    ConnmarkSrc { ip: IpAddr, mark: u32 },
    /// Conntrack mark on traffic to the client ip.
    ConnmarkDst { ip: IpAddr, mark: u32 },
}

/// Complete observable host state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostRuleSet {
    pub interfaces_up: BTreeSet<String>,
    /// (iface, cidr)
    pub addrs: BTreeSet<(String, String)>,
    /// (table, route text)
    pub routes: BTreeSet<(u32, String)>,
    /// (mark, table, priority)
    pub fwmark_rules: BTreeSet<(u32, u32, u32)>,
    pub blackhole_tables: BTreeSet<u32>,
    pub classifiers: BTreeSet<Classifier>,
    pub restore_rule_installed: bool,
    pub conntrack_acct: bool,
}

#[derive(Debug, Default)]
struct MemoryHostState {
    rules: HostRuleSet,
    /// Operation names to fail, consumed one at a time.
    fail_ops: Vec<&'static str>,
    /// Every successful mutation, in order, as `"op detail"`.
    op_log: Vec<String>,
}

/// Cloneable handle to a shared in-memory host. The engine owns one clone
/// through its `HostConfigurator`; the test keeps another for inspection.
#[derive(Clone, Default)]
pub struct MemoryHost {
    state: Arc<Mutex<MemoryHostState>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current host rule set.
    pub fn rules(&self) -> HostRuleSet {
        self.lock().rules.clone()
    }

    /// Ordered log of successful mutations.
    pub fn op_log(&self) -> Vec<String> {
        self.lock().op_log.clone()
    }

    /// Make the next invocation of `op` fail with a synthetic error.
    pub fn fail_next(&self, op: &'static str) {
        self.lock().fail_ops.push(op);
    }

    /// Number of routing classifiers currently covering `ip`.
    pub fn src_mark_count(&self, ip: IpAddr) -> usize {
        self.lock()
            .rules
            .classifiers
            .iter()
            .filter(|c| matches!(c, Classifier::MarkSrc { ip: i, .. } if *i == ip))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryHostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, op: &'static str, detail: String) -> Result<MutexGuard<'_, MemoryHostState>, HostError> {
        let mut state = self.lock();
        if let Some(idx) = state.fail_ops.iter().position(|o| *o == op) {
            state.fail_ops.remove(idx);
            return Err(HostError::Failed {
                op,
                stderr: "injected failure".into(),
            });
        }
        state.op_log.push(format!("{op} {detail}"));
        Ok(state)
    }
}

impl HostBackend for MemoryHost {
    fn ensure_interface_up(&mut self, iface: &str) -> HostResult {
        let mut s = self.begin("ensure_interface_up", iface.into())?;
        s.rules.interfaces_up.insert(iface.to_string());
        Ok(())
    }

    fn ensure_interface_down(&mut self, iface: &str) -> HostResult {
        let mut s = self.begin("ensure_interface_down", iface.into())?;
        s.rules.interfaces_up.remove(iface);
        Ok(())
    }

    fn assign_addr(&mut self, iface: &str, cidr: &str) -> HostResult {
        let mut s = self.begin("assign_addr", format!("{iface} {cidr}"))?;
        s.rules.addrs.insert((iface.to_string(), cidr.to_string()));
        Ok(())
    }

    fn flush_addrs(&mut self, iface: &str) -> HostResult {
        let mut s = self.begin("flush_addrs", iface.into())?;
        s.rules.addrs.retain(|(i, _)| i != iface);
        Ok(())
    }

    fn set_default_via(&mut self, table: u32, gateway: Option<IpAddr>, dev: &str) -> HostResult {
        let route = match gateway {
            Some(gw) => format!("default via {gw} dev {dev}"),
            None => format!("default dev {dev}"),
        };
        let mut s = self.begin("set_default_via", format!("table {table} {route}"))?;
        s.rules.routes.retain(|(t, r)| *t != table || !r.starts_with("default"));
        s.rules.routes.insert((table, route));
        Ok(())
    }

    fn add_route(&mut self, table: u32, prefix: &str, via: Option<IpAddr>, dev: &str) -> HostResult {
        let route = match via {
            Some(gw) => format!("{prefix} via {gw} dev {dev}"),
            None => format!("{prefix} dev {dev}"),
        };
        let mut s = self.begin("add_route", format!("table {table} {route}"))?;
        s.rules.routes.insert((table, route));
        Ok(())
    }

    fn del_route(&mut self, table: u32, prefix: &str) -> HostResult {
        let mut s = self.begin("del_route", format!("table {table} {prefix}"))?;
        s.rules
            .routes
            .retain(|(t, r)| *t != table || !r.starts_with(prefix));
        Ok(())
    }

    fn add_fwmark_rule(&mut self, mark: u32, table: u32, priority: u32) -> HostResult {
        let mut s = self.begin("add_fwmark_rule", format!("mark {mark} table {table} prio {priority}"))?;
        s.rules.fwmark_rules.insert((mark, table, priority));
        Ok(())
    }

    fn del_fwmark_rule(&mut self, mark: u32) -> HostResult {
        let mut s = self.begin("del_fwmark_rule", format!("mark {mark}"))?;
        s.rules.fwmark_rules.retain(|(m, _, _)| *m != mark);
        Ok(())
    }

    fn create_blackhole_table(&mut self, table: u32) -> HostResult {
        let mut s = self.begin("create_blackhole_table", format!("table {table}"))?;
        s.rules.blackhole_tables.insert(table);
        Ok(())
    }

    fn mark_src(&mut self, ip: IpAddr, fwmark: u32, dest_prefix: Option<&str>) -> HostResult {
        let mut s = self.begin("mark_src", format!("{ip} fwmark {fwmark}"))?;
        s.rules.classifiers.insert(Classifier::MarkSrc {
            ip,
            fwmark,
            dest: dest_prefix.map(str::to_string),
        });
        Ok(())
    }

    fn unmark_src(&mut self, ip: IpAddr, fwmark: u32, dest_prefix: Option<&str>) -> HostResult {
        let mut s = self.begin("unmark_src", format!("{ip} fwmark {fwmark}"))?;
        let rule = Classifier::MarkSrc {
            ip,
            fwmark,
            dest: dest_prefix.map(str::to_string),
        };
        s.rules.classifiers.remove(&rule);
        Ok(())
    }

    fn mark_flow(&mut self, flow: &FlowTuple, fwmark: u32) -> HostResult {
        let key = flow_key(flow);
        let mut s = self.begin("mark_flow", format!("{key} fwmark {fwmark}"))?;
        s.rules.classifiers.insert(Classifier::MarkFlow {
            flow: key,
            fwmark,
        });
        Ok(())
    }

    fn unmark_flow(&mut self, flow: &FlowTuple, fwmark: u32) -> HostResult {
        let key = flow_key(flow);
        let mut s = self.begin("unmark_flow", format!("{key} fwmark {fwmark}"))?;
        let rule = Classifier::MarkFlow {
            flow: key,
            fwmark,
        };
        s.rules.classifiers.remove(&rule);
        Ok(())
    }

    fn connmark_pair_add(&mut self, ip: IpAddr, mark: u32) -> HostResult {
        let mut s = self.begin("connmark_pair_add", format!("{ip} mark {mark:#x}"))?;
        s.rules.classifiers.insert(Classifier::ConnmarkSrc { ip, mark });
        s.rules.classifiers.insert(Classifier::ConnmarkDst { ip, mark });
        Ok(())
    }

    fn connmark_pair_del(&mut self, ip: IpAddr, mark: u32) -> HostResult {
        let mut s = self.begin("connmark_pair_del", format!("{ip} mark {mark:#x}"))?;
        s.rules
            .classifiers
            .remove(&Classifier::ConnmarkSrc { ip, mark });
        s.rules
            .classifiers
            .remove(&Classifier::ConnmarkDst { ip, mark });
        Ok(())
    }

    fn restore_conn_mark_on_ingress(&mut self) -> HostResult {
        let mut s = self.begin("restore_conn_mark_on_ingress", String::new())?;
        s.rules.restore_rule_installed = true;
        Ok(())
    }

    fn remove_classifiers_for(&mut self, ip: IpAddr) -> HostResult {
        let mut s = self.begin("remove_classifiers_for", ip.to_string())?;
        s.rules.classifiers.retain(|c| match c {
            Classifier::MarkSrc { ip: i, .. }
            | Classifier::ConnmarkSrc { ip: i, .. }
            | Classifier::ConnmarkDst { ip: i, .. } => *i != ip,
            Classifier::MarkFlow { .. } => true,
        });
        Ok(())
    }

    fn enable_conntrack_accounting(&mut self) -> HostResult {
        let mut s = self.begin("enable_conntrack_accounting", String::new())?;
        s.rules.conntrack_acct = true;
        Ok(())
    }
}
