//! The engine root object.
//!
//! `Engine` wires the host configurator, registry, event dispatcher, data
//! plane, accounting, and session manager together, owns the event-reaction
//! thread, and provides the deterministic shutdown path. It is constructed
//! and owned by the embedding process; dropping it shuts everything down.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use magic_common::adif;
use magic_common::types::{
    FlightPhase, FlowTuple, LinkCapability, LinkState, LinkStats, ResourceGrant, ResourceRequest,
    TrafficCounters,
};
use magic_common::{LinkId, Result, SessionId};
use tracing::{info, warn};

use crate::accounting::Accounting;
use crate::conntrack::ConntrackReader;
use crate::dataplane::DataPlane;
use crate::driver::{DriverHandle, LinkDriver};
use crate::events::{EventDispatcher, EventKind, EventMask, Subscription};
use crate::host::{HostBackend, HostConfigurator};
use crate::registry::{Registry, RegistrySnapshot};
use crate::session::{SessionManager, SessionRecord};

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Southbound interface client traffic enters on.
    pub ingress_iface: String,
    /// Local address of the ingress interface, when known.
    pub ingress_ip: Option<IpAddr>,
    /// TTL of cached traffic counters.
    pub stats_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            ingress_iface: "eth0".to_string(),
            ingress_ip: None,
            stats_cache_ttl: crate::accounting::CACHE_TTL,
        }
    }
}

/// The link management and session routing engine.
pub struct Engine {
    registry: Arc<Registry>,
    dataplane: Arc<DataPlane>,
    accounting: Arc<Accounting>,
    sessions: Arc<SessionManager>,
    dispatcher: EventDispatcher,
    flight_phase: Arc<AtomicU8>,
    stop: Arc<AtomicBool>,
    reaction: Option<thread::JoinHandle<()>>,
}

impl Engine {
    /// Build the engine over the given host backend and conntrack reader
    /// and install the static data plane layout.
    pub fn new(
        backend: Box<dyn HostBackend>,
        conntrack: Box<dyn ConntrackReader>,
        config: EngineConfig,
    ) -> Result<Engine> {
        let host = Arc::new(HostConfigurator::new(backend));
        let dispatcher = EventDispatcher::new();
        let registry = Registry::new(dispatcher.sender());
        let dataplane = Arc::new(DataPlane::new(host.clone()));
        dataplane.init(&config.ingress_iface, config.ingress_ip)?;
        let accounting = Arc::new(Accounting::with_ttl(
            host,
            conntrack,
            config.stats_cache_ttl,
        ));
        let flight_phase = Arc::new(AtomicU8::new(FlightPhase::Unknown.to_u8()));
        let sessions = SessionManager::new(
            registry.clone(),
            dataplane.clone(),
            accounting.clone(),
            flight_phase.clone(),
        );

        let stop = Arc::new(AtomicBool::new(false));
        let reaction = {
            let subscription = dispatcher.subscribe(EventMask::of(&[
                EventKind::LinkDown,
                EventKind::LinkGoingDown,
                EventKind::HandoverRecommend,
            ]));
            let sessions = sessions.clone();
            let stop = stop.clone();
            thread::Builder::new()
                .name("magic-reaction".into())
                .spawn(move || reaction_loop(subscription, sessions, stop))
                .expect("failed to spawn reaction thread")
        };

        Ok(Engine {
            registry,
            dataplane,
            accounting,
            sessions,
            dispatcher,
            flight_phase,
            stop,
            reaction: Some(reaction),
        })
    }

    // ── Links ───────────────────────────────────────────────────────

    /// Register a driver, bind its link into the data plane, then start it.
    pub fn register_link(&self, driver: Arc<dyn LinkDriver>) -> Result<LinkId> {
        let capability = driver.capability();
        let gateway = driver.gateway();
        let id = self.registry.register(driver.clone())?;
        if let Err(e) = self
            .dataplane
            .bind_link(id, &capability.interface_name, gateway)
        {
            // Registration is atomic from the caller's view.
            let _ = self.registry.unregister(id);
            return Err(e);
        }
        driver.start(DriverHandle {
            link_id: id,
            registry: Arc::downgrade(&self.registry),
        });
        Ok(id)
    }

    /// Unregister a link. Fails with `LinkBusy` while sessions remain.
    pub fn unregister_link(&self, id: LinkId) -> Result<()> {
        self.registry.unregister(id)?;
        self.dataplane.unbind_link(id)
    }

    pub fn link_capability(&self, id: LinkId) -> Result<LinkCapability> {
        self.registry.capability(id)
    }

    pub fn link_state(&self, id: LinkId) -> Result<LinkState> {
        self.registry.state(id)
    }

    pub fn link_stats(&self, id: LinkId) -> Result<LinkStats> {
        self.registry.stats(id)
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ── Sessions ────────────────────────────────────────────────────

    pub fn allocate(&self, request: ResourceRequest) -> Result<ResourceGrant> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(magic_common::Error::Shutdown);
        }
        self.sessions.allocate(request)
    }

    pub fn release(&self, id: SessionId) -> Result<()> {
        self.sessions.release(id)
    }

    pub fn switch(&self, id: SessionId, target: LinkId) -> Result<()> {
        self.sessions.switch(id, target)
    }

    pub fn session(&self, id: SessionId) -> Option<SessionRecord> {
        self.sessions.session(id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.session_ids()
    }

    pub fn stats(&self, id: SessionId) -> Result<TrafficCounters> {
        self.sessions.stats(id)
    }

    pub fn stats_client(&self, client_id: &str) -> Result<TrafficCounters> {
        self.sessions.stats_client(client_id)
    }

    pub fn stats_all(&self) -> TrafficCounters {
        self.sessions.stats_all()
    }

    pub fn add_flow_rule(&self, id: SessionId, tuple: FlowTuple, link: LinkId) -> Result<()> {
        self.sessions.add_flow_rule(id, tuple, link)
    }

    pub fn remove_flow_rules(&self, id: SessionId) -> Result<usize> {
        self.sessions.remove_flow_rules(id)
    }

    /// Force-refresh all traffic counters from the kernel.
    pub fn refresh_stats(&self) {
        self.accounting.refresh_all();
    }

    // ── Hints & events ──────────────────────────────────────────────

    /// Update the flight-phase routing hint. Crossing the ground/air
    /// boundary changes which links are eligible, so active sessions are
    /// re-run through policy and switched where a better link emerged.
    pub fn set_flight_phase(&self, phase: FlightPhase) {
        let old = FlightPhase::from_u8(
            self.flight_phase.swap(phase.to_u8(), Ordering::Relaxed),
        );
        if old == phase {
            return;
        }
        info!(from = %old.as_str(), to = %phase.as_str(), "flight phase updated");
        if adif::should_reevaluate_routing(old, phase) {
            self.sessions.reevaluate_all();
        }
    }

    pub fn flight_phase(&self) -> FlightPhase {
        FlightPhase::from_u8(self.flight_phase.load(Ordering::Relaxed))
    }

    /// Attach an external event subscriber.
    pub fn subscribe(&self, mask: EventMask) -> Subscription {
        self.dispatcher.subscribe(mask)
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Stop the engine: refuse new allocations, release every session in
    /// ascending id order, stop drivers and the dispatcher, join threads.
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutting down");
        self.sessions.release_all();
        self.registry.shutdown_drivers();
        self.dispatcher.shutdown();
        if let Some(handle) = self.reaction.take() {
            if handle.join().is_err() {
                warn!("reaction thread panicked during shutdown");
            }
        }
        info!("engine stopped");
    }

    /// Gateway currently programmed for a link's route table.
    pub fn link_gateway(&self, id: LinkId) -> Option<IpAddr> {
        self.dataplane.link_gateway(id)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reaction_loop(
    subscription: Subscription,
    sessions: Arc<SessionManager>,
    stop: Arc<AtomicBool>,
) {
    while !stop.load(Ordering::Relaxed) {
        match subscription.recv_timeout(Duration::from_millis(200)) {
            Some(event) => sessions.handle_event(&event),
            None => {
                // Timeout or dispatcher gone; the stop flag decides.
            }
        }
    }
}
