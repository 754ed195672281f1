//! Session lifecycle orchestration.
//!
//! A session's lifetime spans three subsystems: a bearer in the registry, a
//! classifier route in the data plane, and a conntrack mark in accounting.
//! Allocate, switch, and release are transactional — any intermediate
//! failure unwinds the earlier steps so the engine is left in its pre-state.
//!
//! Operations on one session serialize on that session's record lock;
//! different sessions progress in parallel. The cross-module call order is
//! always registry → data plane → accounting, with the host lock strictly
//! innermost, so no lock cycle exists.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use magic_common::types::{
    FlightPhase, FlowTuple, ResourceGrant, ResourceRequest, TrafficCounters, MAX_CLIENT_ID_LEN,
};
use magic_common::{BearerId, Error, LinkId, Result, SessionId};
use tracing::{info, warn};

use crate::accounting::Accounting;
use crate::dataplane::DataPlane;
use crate::driver::DriverRequest;
use crate::events::{LinkEvent, LinkEventPayload};
use crate::policy;
use crate::registry::Registry;

/// Lifecycle of an established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Active,
    Switching,
    Releasing,
}

/// One active session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: SessionId,
    pub request: ResourceRequest,
    pub link: LinkId,
    pub bearer: BearerId,
    pub grant: ResourceGrant,
    pub mark: u32,
    pub lifecycle: SessionLifecycle,
    pub created: SystemTime,
}

/// Orchestrates allocate / release / switch / stats across the registry,
/// data plane, and accounting.
pub struct SessionManager {
    registry: Arc<Registry>,
    dataplane: Arc<DataPlane>,
    accounting: Arc<Accounting>,
    flight_phase: Arc<AtomicU8>,
    sessions: Mutex<BTreeMap<SessionId, Arc<Mutex<SessionRecord>>>>,
    next_id: AtomicU32,
}

impl SessionManager {
    pub fn new(
        registry: Arc<Registry>,
        dataplane: Arc<DataPlane>,
        accounting: Arc<Accounting>,
        flight_phase: Arc<AtomicU8>,
    ) -> Arc<Self> {
        Arc::new(SessionManager {
            registry,
            dataplane,
            accounting,
            flight_phase,
            sessions: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(1),
        })
    }

    fn phase(&self) -> FlightPhase {
        FlightPhase::from_u8(self.flight_phase.load(Ordering::Relaxed))
    }

    /// Session ids are unique and never zero.
    fn next_session_id(&self) -> SessionId {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return SessionId(id);
            }
        }
    }

    fn validate(request: &ResourceRequest) -> Result<()> {
        if request.client_id.is_empty() {
            return Err(Error::InvalidArgument("empty client id".into()));
        }
        if request.client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(Error::InvalidArgument(format!(
                "client id longer than {MAX_CLIENT_ID_LEN} bytes"
            )));
        }
        if request.client_ip.is_unspecified() {
            return Err(Error::InvalidArgument("unspecified client ip".into()));
        }
        if request.min_fwd_kbps > request.req_fwd_kbps
            || request.min_rev_kbps > request.req_rev_kbps
        {
            return Err(Error::InvalidArgument(
                "minimum rate exceeds requested rate".into(),
            ));
        }
        Ok(())
    }

    /// Allocate a session: pick a link, reserve a bearer, register
    /// accounting, and program the route — or unwind everything.
    pub fn allocate(&self, request: ResourceRequest) -> Result<ResourceGrant> {
        Self::validate(&request)?;
        let id = self.next_session_id();
        let key = id.to_string();

        let link = policy::select(&request, &self.registry.snapshot(), self.phase())
            .ok_or(Error::NoLinkAvailable)?;

        let (bearer, granted_fwd, granted_rev) = self.registry.allocate_bearer_bounded(
            link,
            request.min_fwd_kbps,
            request.req_fwd_kbps,
            request.min_rev_kbps,
            request.req_rev_kbps,
            request.qos,
        )?;

        let driver = self.registry.driver(link)?;
        let driver_grant = match driver.allocate_resource(&DriverRequest {
            session_id: id,
            client_id: request.client_id.clone(),
            fwd_kbps: granted_fwd,
            rev_kbps: granted_rev,
            qos: request.qos,
            timeout_sec: request.timeout_sec,
        }) {
            Ok(grant) => grant,
            Err(e) => {
                let _ = self.registry.release_bearer(link, bearer);
                return Err(Error::DriverCallFailed(e.to_string()));
            }
        };

        let mark = match self
            .accounting
            .register(&key, &request.client_id, request.client_ip)
        {
            Ok(mark) => mark,
            Err(e) => {
                let _ = driver.release_resource(id, bearer);
                let _ = self.registry.release_bearer(link, bearer);
                return Err(e);
            }
        };

        if let Err(e) = self
            .dataplane
            .install_session_route(id, request.client_ip, link, None)
        {
            let _ = self.accounting.unregister(&key);
            let _ = driver.release_resource(id, bearer);
            let _ = self.registry.release_bearer(link, bearer);
            return Err(e);
        }

        let grant = ResourceGrant {
            session_id: id,
            granted_fwd_kbps: granted_fwd,
            granted_rev_kbps: granted_rev,
            local_ip: driver_grant.local_ip,
            gateway: driver_grant.gateway,
            dns_primary: driver_grant.dns_primary,
            dns_secondary: driver_grant.dns_secondary,
        };
        let record = SessionRecord {
            id,
            request,
            link,
            bearer,
            grant: grant.clone(),
            mark,
            lifecycle: SessionLifecycle::Active,
            created: SystemTime::now(),
        };

        let mut sessions = self.lock_table();
        if sessions
            .insert(id, Arc::new(Mutex::new(record)))
            .is_some()
        {
            // Session ids are monotonic; a collision means the table is
            // corrupted. Never quietly recover.
            panic!("duplicate session id {id}");
        }
        drop(sessions);

        info!(
            session = %id,
            link = %link,
            granted_fwd,
            granted_rev,
            mark = %format_args!("{mark:#x}"),
            "session allocated"
        );
        Ok(grant)
    }

    /// Release a session in reverse order of allocation. Idempotent; an
    /// absent session yields `Ok`.
    pub fn release(&self, id: SessionId) -> Result<()> {
        let Some(slot) = self.lock_table().get(&id).cloned() else {
            return Ok(());
        };
        let mut record = slot.lock().unwrap_or_else(|e| e.into_inner());
        if record.lifecycle == SessionLifecycle::Releasing {
            return Ok(());
        }
        record.lifecycle = SessionLifecycle::Releasing;
        let key = id.to_string();

        if let Err(e) = self.dataplane.remove_session_route(id) {
            record.lifecycle = SessionLifecycle::Active;
            return Err(e);
        }

        if let Err(e) = self.accounting.unregister(&key) {
            // Reinstate the route so the session stays consistent.
            let _ = self.dataplane.install_session_route(
                id,
                record.request.client_ip,
                record.link,
                None,
            );
            record.lifecycle = SessionLifecycle::Active;
            return Err(e);
        }

        // Link-side teardown is best effort: the link may already be gone.
        match self.registry.driver(record.link) {
            Ok(driver) => {
                if let Err(e) = driver.release_resource(id, record.bearer) {
                    warn!(session = %id, error = %e, "driver release failed");
                }
            }
            Err(_) => warn!(session = %id, "link vanished before session release"),
        }
        if let Err(e) = self.registry.release_bearer(record.link, record.bearer) {
            warn!(session = %id, error = %e, "bearer release failed");
        }

        drop(record);
        self.lock_table().remove(&id);
        info!(session = %id, "session released");
        Ok(())
    }

    /// Hot-switch a session to `target`. On failure the session remains on
    /// its original link with no residual state on the target.
    pub fn switch(&self, id: SessionId, target: LinkId) -> Result<()> {
        let slot = self
            .lock_table()
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotFound)?;
        let mut record = slot.lock().unwrap_or_else(|e| e.into_inner());
        if record.link == target {
            return Ok(());
        }
        record.lifecycle = SessionLifecycle::Switching;

        let result = self.switch_locked(&mut record, target);
        record.lifecycle = SessionLifecycle::Active;
        result
    }

    fn switch_locked(
        &self,
        record: &mut MutexGuard<'_, SessionRecord>,
        target: LinkId,
    ) -> Result<()> {
        let id = record.id;
        let (new_bearer, granted_fwd, granted_rev) = self.registry.allocate_bearer_bounded(
            target,
            record.request.min_fwd_kbps,
            record.grant.granted_fwd_kbps,
            record.request.min_rev_kbps,
            record.grant.granted_rev_kbps,
            record.request.qos,
        )?;

        let new_driver = self.registry.driver(target)?;
        if let Err(e) = new_driver.allocate_resource(&DriverRequest {
            session_id: id,
            client_id: record.request.client_id.clone(),
            fwd_kbps: granted_fwd,
            rev_kbps: granted_rev,
            qos: record.request.qos,
            timeout_sec: record.request.timeout_sec,
        }) {
            let _ = self.registry.release_bearer(target, new_bearer);
            return Err(Error::DriverCallFailed(e.to_string()));
        }

        if let Err(e) = self.dataplane.switch_session(id, target) {
            let _ = new_driver.release_resource(id, new_bearer);
            let _ = self.registry.release_bearer(target, new_bearer);
            return Err(e);
        }

        // The new link owns the traffic; retire the old reservation.
        let old_link = record.link;
        let old_bearer = record.bearer;
        match self.registry.driver(old_link) {
            Ok(old_driver) => {
                if let Err(e) = old_driver.release_resource(id, old_bearer) {
                    warn!(session = %id, error = %e, "old driver release failed");
                }
            }
            Err(_) => warn!(session = %id, "old link vanished during switch"),
        }
        if let Err(e) = self.registry.release_bearer(old_link, old_bearer) {
            warn!(session = %id, error = %e, "old bearer release failed");
        }

        record.link = target;
        record.bearer = new_bearer;
        record.grant.granted_fwd_kbps = granted_fwd;
        record.grant.granted_rev_kbps = granted_rev;
        info!(session = %id, from = %old_link, to = %target, "session switched");
        Ok(())
    }

    /// Counters for one session.
    pub fn stats(&self, id: SessionId) -> Result<TrafficCounters> {
        if !self.lock_table().contains_key(&id) {
            return Err(Error::SessionNotFound);
        }
        self.accounting.stats(&id.to_string())
    }

    /// Aggregated counters across all sessions of a client.
    pub fn stats_client(&self, client_id: &str) -> Result<TrafficCounters> {
        self.accounting.aggregate_client(client_id)
    }

    /// Aggregated counters across every session.
    pub fn stats_all(&self) -> TrafficCounters {
        self.accounting.aggregate_all()
    }

    /// Add a 5-tuple refinement to an active session.
    pub fn add_flow_rule(&self, id: SessionId, tuple: FlowTuple, link: LinkId) -> Result<()> {
        let slot = self
            .lock_table()
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotFound)?;
        let _record = slot.lock().unwrap_or_else(|e| e.into_inner());
        self.dataplane.add_flow_rule(id, tuple, link)
    }

    /// Remove every flow rule of a session.
    pub fn remove_flow_rules(&self, id: SessionId) -> Result<usize> {
        let slot = self
            .lock_table()
            .get(&id)
            .cloned()
            .ok_or(Error::SessionNotFound)?;
        let _record = slot.lock().unwrap_or_else(|e| e.into_inner());
        self.dataplane.remove_flow_rules(id)
    }

    /// Snapshot of one session record.
    pub fn session(&self, id: SessionId) -> Option<SessionRecord> {
        let slot = self.lock_table().get(&id).cloned()?;
        let record = slot.lock().unwrap_or_else(|e| e.into_inner());
        Some(record.clone())
    }

    /// Ids of all sessions, ascending.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.lock_table().keys().copied().collect()
    }

    /// Sessions currently served by `link`.
    pub fn sessions_on_link(&self, link: LinkId) -> Vec<SessionId> {
        let slots: Vec<(SessionId, Arc<Mutex<SessionRecord>>)> = self
            .lock_table()
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();
        slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.lock().unwrap_or_else(|e| e.into_inner()).link == link
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// React to a link event: evacuate sessions from dying links, follow
    /// handover recommendations.
    pub fn handle_event(&self, event: &LinkEvent) {
        match &event.payload {
            LinkEventPayload::LinkDown | LinkEventPayload::LinkGoingDown => {
                self.evacuate(event.link_id);
            }
            LinkEventPayload::HandoverRecommend { target } => {
                self.consider_handover(event.link_id, *target);
            }
            _ => {}
        }
    }

    /// Try to move every session off `link`, in ascending session order.
    fn evacuate(&self, link: LinkId) {
        let sessions = self.sessions_on_link(link);
        if sessions.is_empty() {
            return;
        }
        info!(link = %link, count = sessions.len(), "evacuating sessions from failing link");
        for id in sessions {
            let Some(record) = self.session(id) else {
                continue;
            };
            // The failing link is no longer Available, so selection
            // naturally excludes it.
            let target =
                policy::select(&record.request, &self.registry.snapshot(), self.phase());
            match target {
                Some(target) if target != link => {
                    if let Err(e) = self.switch(id, target) {
                        warn!(session = %id, target = %target, error = %e, "evacuation switch failed");
                    }
                }
                _ => warn!(session = %id, "no alternative link for session"),
            }
        }
    }

    /// Re-run policy for sessions on `link`; follow the recommendation when
    /// it agrees, or whatever policy now prefers.
    fn consider_handover(&self, link: LinkId, recommended: Option<LinkId>) {
        for id in self.sessions_on_link(link) {
            let Some(record) = self.session(id) else {
                continue;
            };
            let choice = match recommended {
                Some(target)
                    if policy::select(&record.request, &self.registry.snapshot(), self.phase())
                        == Some(target) =>
                {
                    Some(target)
                }
                _ => policy::select(&record.request, &self.registry.snapshot(), self.phase()),
            };
            if let Some(target) = choice {
                if target != record.link {
                    if let Err(e) = self.switch(id, target) {
                        warn!(session = %id, target = %target, error = %e, "handover switch failed");
                    }
                }
            }
        }
    }

    /// Re-run link selection for every session after a routing-hint change
    /// (ground/air boundary) and switch the ones whose best link moved.
    /// Sessions whose current link became ineligible with no replacement
    /// stay where they are; the driver will report the outage.
    pub fn reevaluate_all(&self) {
        for id in self.session_ids() {
            let Some(record) = self.session(id) else {
                continue;
            };
            match policy::select(&record.request, &self.registry.snapshot(), self.phase()) {
                Some(target) if target != record.link => {
                    if let Err(e) = self.switch(id, target) {
                        warn!(session = %id, target = %target, error = %e, "reevaluation switch failed");
                    }
                }
                Some(_) => {}
                None => warn!(session = %id, "no eligible link after flight-phase change"),
            }
        }
    }

    /// Release every session in ascending id order (shutdown path).
    pub fn release_all(&self) {
        for id in self.session_ids() {
            if let Err(e) = self.release(id) {
                warn!(session = %id, error = %e, "release during shutdown failed");
            }
        }
    }

    fn lock_table(
        &self,
    ) -> MutexGuard<'_, BTreeMap<SessionId, Arc<Mutex<SessionRecord>>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}
