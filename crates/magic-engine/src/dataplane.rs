//! Data plane programming.
//!
//! Maintains the deterministic mapping from (session, flow) to an egress
//! link by owning the policy-routing layout:
//!
//! - one routing table per bound link, tables 100–199, fwmark == table id;
//! - a static fwmark→table rule per table at priority 100, pre-provisioned
//!   for the whole process lifetime at init;
//! - a blackhole table behind mark 99 at priority 50;
//! - per-session classifier rules marking the client's packets with the
//!   serving link's fwmark, plus optional 5-tuple flow refinements.
//!
//! Hot switching is lossless: the classifier with the new mark is inserted
//! *before* the old one is removed, so the client's traffic is marked at
//! every instant of the swap.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use magic_common::types::FlowTuple;
use magic_common::{Error, LinkId, Result, SessionId};
use tracing::{debug, info, warn};

use crate::host::HostConfigurator;

/// First routing table / fwmark value handed to a bound link.
pub const TABLE_BASE: u32 = 100;
/// Last routing table in the pre-provisioned range.
pub const TABLE_MAX: u32 = 199;
/// Reserved mark steering unauthorized traffic into the blackhole table.
pub const FWMARK_BLACKHOLE: u32 = 99;
/// Priority of the static fwmark→table rules.
pub const FWMARK_RULE_PRIORITY: u32 = 100;
/// Priority of the blackhole rule. Lower value wins first.
pub const BLACKHOLE_PRIORITY: u32 = 50;

#[derive(Debug, Clone)]
struct LinkBinding {
    table_id: u32,
    fwmark: u32,
    iface: String,
    gateway: Option<IpAddr>,
}

#[derive(Debug, Clone)]
struct SessionRoute {
    client_ip: IpAddr,
    link_id: LinkId,
    fwmark: u32,
    dest_prefix: Option<String>,
}

#[derive(Debug, Clone)]
struct FlowRecord {
    tuple: FlowTuple,
    link_id: LinkId,
    fwmark: u32,
    created: SystemTime,
}

#[derive(Default)]
struct DataPlaneInner {
    initialized: bool,
    ingress_iface: String,
    ingress_ip: Option<IpAddr>,
    bindings: BTreeMap<LinkId, LinkBinding>,
    next_slot: u32,
    session_routes: BTreeMap<SessionId, SessionRoute>,
    flow_rules: BTreeMap<SessionId, Vec<FlowRecord>>,
}

/// The data plane programmer.
pub struct DataPlane {
    host: Arc<HostConfigurator>,
    inner: Mutex<DataPlaneInner>,
}

impl DataPlane {
    pub fn new(host: Arc<HostConfigurator>) -> Self {
        DataPlane {
            host,
            inner: Mutex::new(DataPlaneInner::default()),
        }
    }

    /// Install the static routing skeleton. Idempotent.
    pub fn init(&self, ingress_iface: &str, ingress_ip: Option<IpAddr>) -> Result<()> {
        let mut inner = self.lock();
        if inner.initialized {
            return Ok(());
        }
        {
            let mut host = self.host.ops();
            host.create_blackhole_table(FWMARK_BLACKHOLE)
                .map_err(|e| e.into_engine())?;
            host.add_fwmark_rule(FWMARK_BLACKHOLE, FWMARK_BLACKHOLE, BLACKHOLE_PRIORITY)
                .map_err(|e| e.into_engine())?;
            for table in TABLE_BASE..=TABLE_MAX {
                host.add_fwmark_rule(table, table, FWMARK_RULE_PRIORITY)
                    .map_err(|e| e.into_engine())?;
            }
        }
        inner.ingress_iface = ingress_iface.to_string();
        inner.ingress_ip = ingress_ip;
        inner.initialized = true;
        info!(ingress = ingress_iface, "data plane initialized");
        Ok(())
    }

    /// The ingress interface and address the data plane was initialized
    /// with.
    pub fn ingress(&self) -> (String, Option<IpAddr>) {
        let inner = self.lock();
        (inner.ingress_iface.clone(), inner.ingress_ip)
    }

    /// Bind a link to a routing table slot and install its default route.
    /// Idempotent per link: rebinding returns the existing assignment.
    pub fn bind_link(
        &self,
        link_id: LinkId,
        iface: &str,
        gateway: Option<IpAddr>,
    ) -> Result<(u32, u32)> {
        let mut inner = self.lock();
        if let Some(existing) = inner.bindings.get(&link_id) {
            return Ok((existing.table_id, existing.fwmark));
        }
        if TABLE_BASE + inner.next_slot > TABLE_MAX {
            return Err(Error::CapacityExceeded);
        }
        let table_id = TABLE_BASE + inner.next_slot;
        // fwmark tracks the table id for the link's whole lifetime.
        let fwmark = table_id;

        self.host
            .ops()
            .set_default_via(table_id, gateway, iface)
            .map_err(|e| e.into_engine())?;

        inner.next_slot += 1;
        inner.bindings.insert(
            link_id,
            LinkBinding {
                table_id,
                fwmark,
                iface: iface.to_string(),
                gateway,
            },
        );
        info!(link_id = %link_id, table_id, fwmark, iface, "link bound to route table");
        Ok((table_id, fwmark))
    }

    /// Remove a link's routes. The static fwmark rule stays — tables are
    /// provisioned for the process lifetime.
    pub fn unbind_link(&self, link_id: LinkId) -> Result<()> {
        let mut inner = self.lock();
        let Some(binding) = inner.bindings.get(&link_id) else {
            return Ok(());
        };
        let table_id = binding.table_id;
        self.host
            .ops()
            .del_route(table_id, "default")
            .map_err(|e| e.into_engine())?;
        inner.bindings.remove(&link_id);
        info!(link_id = %link_id, table_id, "link unbound");
        Ok(())
    }

    /// Route table id of a bound link.
    pub fn table_id(&self, link_id: LinkId) -> Option<u32> {
        self.lock().bindings.get(&link_id).map(|b| b.table_id)
    }

    /// fwmark of a bound link.
    pub fn fwmark(&self, link_id: LinkId) -> Option<u32> {
        self.lock().bindings.get(&link_id).map(|b| b.fwmark)
    }

    /// Gateway configured for a bound link.
    pub fn link_gateway(&self, link_id: LinkId) -> Option<IpAddr> {
        self.lock().bindings.get(&link_id).and_then(|b| b.gateway)
    }

    /// Update a bound link's gateway and reprogram its default route.
    pub fn update_link_gateway(&self, link_id: LinkId, gateway: Option<IpAddr>) -> Result<()> {
        let mut inner = self.lock();
        let binding = inner.bindings.get_mut(&link_id).ok_or(Error::LinkNotFound)?;
        let (table_id, iface) = (binding.table_id, binding.iface.clone());
        self.host
            .ops()
            .set_default_via(table_id, gateway, &iface)
            .map_err(|e| e.into_engine())?;
        inner
            .bindings
            .get_mut(&link_id)
            .expect("binding checked above")
            .gateway = gateway;
        Ok(())
    }

    /// Install the session's classifier: packets from `client_ip` (to
    /// `dest_prefix`, when given) carry the link's fwmark.
    pub fn install_session_route(
        &self,
        session: SessionId,
        client_ip: IpAddr,
        link_id: LinkId,
        dest_prefix: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.session_routes.contains_key(&session) {
            return Err(Error::InvalidArgument(format!(
                "session {session} already routed"
            )));
        }
        let fwmark = inner
            .bindings
            .get(&link_id)
            .ok_or(Error::LinkNotFound)?
            .fwmark;

        self.host
            .ops()
            .mark_src(client_ip, fwmark, dest_prefix)
            .map_err(|e| e.into_engine())?;

        inner.session_routes.insert(
            session,
            SessionRoute {
                client_ip,
                link_id,
                fwmark,
                dest_prefix: dest_prefix.map(str::to_string),
            },
        );
        debug!(session = %session, %client_ip, fwmark, "session route installed");
        Ok(())
    }

    /// Remove the session's classifier and any flow rules. Idempotent.
    pub fn remove_session_route(&self, session: SessionId) -> Result<()> {
        let mut inner = self.lock();
        let Some(route) = inner.session_routes.remove(&session) else {
            return Ok(());
        };
        let flows = inner.flow_rules.remove(&session).unwrap_or_default();
        let result = {
            let mut host = self.host.ops();
            let mut result = host
                .unmark_src(route.client_ip, route.fwmark, route.dest_prefix.as_deref())
                .map_err(|e| e.into_engine());
            for flow in &flows {
                if let Err(e) = host.unmark_flow(&flow.tuple, flow.fwmark) {
                    result = result.and(Err(e.into_engine()));
                }
            }
            result
        };
        if let Err(e) = &result {
            // Reinstate bookkeeping so a retry can remove the leftovers.
            warn!(session = %session, error = %e, "session route removal incomplete");
            inner.session_routes.insert(session, route);
            inner.flow_rules.insert(session, flows);
        }
        result
    }

    /// Hot-switch a session to another bound link.
    ///
    /// The new classifier goes in before the old one comes out, so the
    /// client's packets always match a rule. If inserting the new rule
    /// fails, nothing is removed and the session stays on its link.
    pub fn switch_session(&self, session: SessionId, new_link: LinkId) -> Result<()> {
        let mut inner = self.lock();
        let route = inner
            .session_routes
            .get(&session)
            .cloned()
            .ok_or(Error::SessionNotFound)?;
        if route.link_id == new_link {
            return Ok(());
        }
        let new_fwmark = inner
            .bindings
            .get(&new_link)
            .ok_or_else(|| Error::SwitchFailed {
                reason: "target link not bound".into(),
            })?
            .fwmark;
        let flows = inner.flow_rules.get(&session).cloned().unwrap_or_default();
        let dest = route.dest_prefix.as_deref();

        {
            let mut host = self.host.ops();

            // Phase 1: add every new-mark rule. A failure here aborts the
            // switch with the old rules untouched.
            if let Err(e) = host.mark_src(route.client_ip, new_fwmark, dest) {
                return Err(Error::SwitchFailed {
                    reason: e.to_string(),
                });
            }
            for (idx, flow) in flows.iter().enumerate() {
                if let Err(e) = host.mark_flow(&flow.tuple, new_fwmark) {
                    // Back out the new rules added so far; the old set is intact.
                    for added in &flows[..idx] {
                        let _ = host.unmark_flow(&added.tuple, new_fwmark);
                    }
                    let _ = host.unmark_src(route.client_ip, new_fwmark, dest);
                    return Err(Error::SwitchFailed {
                        reason: e.to_string(),
                    });
                }
            }

            // Phase 2: retire the old marks. Failures are logged, not fatal —
            // the new rules already own the traffic.
            if let Err(e) = host.unmark_src(route.client_ip, route.fwmark, dest) {
                warn!(session = %session, error = %e, "stale session classifier left behind");
            }
            for flow in &flows {
                if let Err(e) = host.unmark_flow(&flow.tuple, flow.fwmark) {
                    warn!(session = %session, error = %e, "stale flow classifier left behind");
                }
            }
        }

        let route = inner.session_routes.get_mut(&session).expect("checked");
        route.link_id = new_link;
        route.fwmark = new_fwmark;
        if let Some(flows) = inner.flow_rules.get_mut(&session) {
            for flow in flows.iter_mut() {
                flow.link_id = new_link;
                flow.fwmark = new_fwmark;
            }
        }
        info!(session = %session, new_link = %new_link, new_fwmark, "session switched");
        Ok(())
    }

    /// Add a 5-tuple refinement steering one flow of the session over
    /// `link_id` (which may differ from the session's default link).
    pub fn add_flow_rule(
        &self,
        session: SessionId,
        tuple: FlowTuple,
        link_id: LinkId,
    ) -> Result<()> {
        let mut inner = self.lock();
        if !inner.session_routes.contains_key(&session) {
            return Err(Error::SessionNotFound);
        }
        let fwmark = inner
            .bindings
            .get(&link_id)
            .ok_or(Error::LinkNotFound)?
            .fwmark;

        self.host
            .ops()
            .mark_flow(&tuple, fwmark)
            .map_err(|e| e.into_engine())?;

        inner.flow_rules.entry(session).or_default().push(FlowRecord {
            tuple,
            link_id,
            fwmark,
            created: SystemTime::now(),
        });
        debug!(session = %session, link_id = %link_id, fwmark, "flow rule added");
        Ok(())
    }

    /// Remove every flow rule of the session. Returns how many were removed.
    pub fn remove_flow_rules(&self, session: SessionId) -> Result<usize> {
        let mut inner = self.lock();
        let flows = inner.flow_rules.remove(&session).unwrap_or_default();
        let count = flows.len();
        let mut host = self.host.ops();
        for flow in &flows {
            if let Err(e) = host.unmark_flow(&flow.tuple, flow.fwmark) {
                warn!(session = %session, error = %e, "flow rule removal failed");
            }
        }
        Ok(count)
    }

    /// Flow rules currently installed for a session.
    pub fn flow_rules(&self, session: SessionId) -> Vec<(FlowTuple, LinkId, SystemTime)> {
        self.lock()
            .flow_rules
            .get(&session)
            .map(|flows| {
                flows
                    .iter()
                    .map(|f| (f.tuple, f.link_id, f.created))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sessions currently routed over `link_id`.
    pub fn sessions_on_link(&self, link_id: LinkId) -> Vec<SessionId> {
        self.lock()
            .session_routes
            .iter()
            .filter(|(_, r)| r.link_id == link_id)
            .map(|(s, _)| *s)
            .collect()
    }

    /// Count of installed session routes.
    pub fn session_route_count(&self) -> usize {
        self.lock().session_routes.len()
    }

    fn lock(&self) -> MutexGuard<'_, DataPlaneInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
