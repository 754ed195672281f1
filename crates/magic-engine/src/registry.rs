//! Link driver registry.
//!
//! Owns every registered link: its static capability, dynamic state, and
//! bearer pool. Life-state transitions are driven exclusively by driver
//! events; the registry validates each transition and drops illegal ones
//! with a logged warning.
//!
//! After every mutation the registry publishes an immutable snapshot through
//! an `ArcSwap`, which the pure policy selector reads without taking the
//! registry lock.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use magic_common::types::{
    signal_quality, LinkCapability, LinkLifeState, LinkState, LinkStats, QosClass,
    BEARERS_PER_LINK, MAX_LINKS,
};
use magic_common::{BearerId, Error, LinkId, Result};
use tracing::{debug, info, warn};

use crate::driver::{DriverEvent, LinkDriver};
use crate::events::{EventSender, LinkEvent, LinkEventPayload};

/// A bandwidth reservation inside a link.
#[derive(Debug, Clone)]
pub struct Bearer {
    pub id: BearerId,
    pub fwd_kbps: u32,
    pub rev_kbps: u32,
    pub cos: QosClass,
    pub created: SystemTime,
}

struct LinkEntry {
    capability: LinkCapability,
    driver: Arc<dyn LinkDriver>,
    state: LinkState,
    bearers: [Option<Bearer>; BEARERS_PER_LINK],
    next_bearer_id: u8,
}

impl LinkEntry {
    fn active_bearers(&self) -> impl Iterator<Item = &Bearer> {
        self.bearers.iter().flatten()
    }

    fn check_usage_invariant(&self) {
        let fwd: u32 = self.active_bearers().map(|b| b.fwd_kbps).sum();
        let rev: u32 = self.active_bearers().map(|b| b.rev_kbps).sum();
        assert_eq!(
            (fwd, rev),
            (self.state.fwd_usage_kbps, self.state.rev_usage_kbps),
            "bearer sum diverged from link usage"
        );
    }
}

/// Immutable per-link view for the policy selector and introspection.
#[derive(Debug, Clone)]
pub struct LinkSnapshot {
    pub id: LinkId,
    pub capability: LinkCapability,
    pub state: LinkState,
}

/// Snapshot of every registered link, ordered by id.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub links: Vec<LinkSnapshot>,
}

impl RegistrySnapshot {
    pub fn get(&self, id: LinkId) -> Option<&LinkSnapshot> {
        self.links.iter().find(|l| l.id == id)
    }
}

struct RegistryInner {
    links: std::collections::BTreeMap<LinkId, LinkEntry>,
}

/// The central link table.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    snapshot: ArcSwap<RegistrySnapshot>,
    events: EventSender,
}

impl Registry {
    pub fn new(events: EventSender) -> Arc<Self> {
        Arc::new(Registry {
            inner: Mutex::new(RegistryInner {
                links: std::collections::BTreeMap::new(),
            }),
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            events,
        })
    }

    /// Register a driver. Rejects a duplicate interface name. The caller
    /// starts the driver once registration (and data-plane binding) is
    /// final — see [`crate::engine::Engine::register_link`].
    pub fn register(&self, driver: Arc<dyn LinkDriver>) -> Result<LinkId> {
        let capability = driver.capability();
        let id = LinkId::generate();
        let mut inner = self.lock();
        if inner.links.len() >= MAX_LINKS {
            return Err(Error::CapacityExceeded);
        }
        if inner
            .links
            .values()
            .any(|l| l.capability.interface_name == capability.interface_name)
        {
            return Err(Error::DuplicateInterface(capability.interface_name));
        }
        info!(
            link_id = %id,
            iface = %capability.interface_name,
            link_type = %capability.link_type,
            "link registered"
        );
        inner.links.insert(
            id,
            LinkEntry {
                capability,
                driver,
                state: LinkState::default(),
                bearers: Default::default(),
                next_bearer_id: 1,
            },
        );
        self.publish(&inner);
        Ok(id)
    }

    /// Remove a link. Fails with `LinkBusy` while any bearer is active.
    pub fn unregister(&self, id: LinkId) -> Result<()> {
        let driver = {
            let mut inner = self.lock();
            let entry = inner.links.get(&id).ok_or(Error::LinkNotFound)?;
            if entry.state.active_bearers > 0 {
                return Err(Error::LinkBusy);
            }
            let entry = inner.links.remove(&id).expect("checked above");
            self.publish(&inner);
            entry.driver
        };
        driver.shutdown();
        info!(link_id = %id, "link unregistered");
        Ok(())
    }

    pub fn capability(&self, id: LinkId) -> Result<LinkCapability> {
        let inner = self.lock();
        Ok(inner
            .links
            .get(&id)
            .ok_or(Error::LinkNotFound)?
            .capability
            .clone())
    }

    pub fn state(&self, id: LinkId) -> Result<LinkState> {
        let inner = self.lock();
        Ok(inner.links.get(&id).ok_or(Error::LinkNotFound)?.state.clone())
    }

    /// Interface counters, straight from the driver.
    pub fn stats(&self, id: LinkId) -> Result<LinkStats> {
        let driver = self.driver(id)?;
        Ok(driver.statistics())
    }

    pub fn driver(&self, id: LinkId) -> Result<Arc<dyn LinkDriver>> {
        let inner = self.lock();
        Ok(inner.links.get(&id).ok_or(Error::LinkNotFound)?.driver.clone())
    }

    /// Current snapshot for the policy selector.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Reserve exactly the requested rates on a link.
    pub fn allocate_bearer(
        &self,
        id: LinkId,
        fwd_kbps: u32,
        rev_kbps: u32,
        cos: QosClass,
    ) -> Result<BearerId> {
        self.allocate_bearer_bounded(id, fwd_kbps, fwd_kbps, rev_kbps, rev_kbps, cos)
            .map(|(bearer, _, _)| bearer)
    }

    /// Reserve as much of `req` as fits, failing below `min`. Returns the
    /// bearer id and the granted forward/reverse rates.
    pub fn allocate_bearer_bounded(
        &self,
        id: LinkId,
        min_fwd_kbps: u32,
        req_fwd_kbps: u32,
        min_rev_kbps: u32,
        req_rev_kbps: u32,
        cos: QosClass,
    ) -> Result<(BearerId, u32, u32)> {
        let mut inner = self.lock();
        let entry = inner.links.get_mut(&id).ok_or(Error::LinkNotFound)?;
        if entry.state.life_state != LinkLifeState::Available {
            return Err(Error::LinkNotAvailable);
        }

        let fwd_headroom = entry.capability.max_fwd_kbps - entry.state.fwd_usage_kbps;
        let rev_headroom = entry.capability.max_rev_kbps - entry.state.rev_usage_kbps;
        let granted_fwd = req_fwd_kbps.min(fwd_headroom);
        let granted_rev = req_rev_kbps.min(rev_headroom);
        if granted_fwd < min_fwd_kbps || granted_rev < min_rev_kbps {
            return Err(Error::CapacityExceeded);
        }

        // Linear first-fit over the fixed slot array.
        let slot = entry
            .bearers
            .iter()
            .position(Option::is_none)
            .ok_or(Error::CapacityExceeded)?;
        // Bearer ids are monotonic per link; wrap is forbidden.
        if entry.next_bearer_id == u8::MAX {
            return Err(Error::BearerIdExhausted);
        }
        let bearer_id = BearerId(entry.next_bearer_id);
        entry.next_bearer_id += 1;

        entry.bearers[slot] = Some(Bearer {
            id: bearer_id,
            fwd_kbps: granted_fwd,
            rev_kbps: granted_rev,
            cos,
            created: SystemTime::now(),
        });
        entry.state.fwd_usage_kbps += granted_fwd;
        entry.state.rev_usage_kbps += granted_rev;
        entry.state.active_bearers += 1;
        entry.check_usage_invariant();
        debug!(
            link_id = %id,
            bearer = %bearer_id,
            granted_fwd,
            granted_rev,
            "bearer allocated"
        );
        self.publish(&inner);
        Ok((bearer_id, granted_fwd, granted_rev))
    }

    /// Release a bearer. Releasing an unknown bearer is a no-op with a
    /// warning so teardown paths stay idempotent.
    pub fn release_bearer(&self, id: LinkId, bearer: BearerId) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner.links.get_mut(&id).ok_or(Error::LinkNotFound)?;
        let Some(slot) = entry
            .bearers
            .iter()
            .position(|b| b.as_ref().is_some_and(|b| b.id == bearer))
        else {
            warn!(link_id = %id, bearer = %bearer, "release of unknown bearer ignored");
            return Ok(());
        };
        let released = entry.bearers[slot].take().expect("slot checked");
        entry.state.fwd_usage_kbps -= released.fwd_kbps;
        entry.state.rev_usage_kbps -= released.rev_kbps;
        entry.state.active_bearers -= 1;
        entry.check_usage_invariant();
        debug!(link_id = %id, bearer = %bearer, "bearer released");
        self.publish(&inner);
        Ok(())
    }

    /// Entry point for driver events. Validates the transition, updates the
    /// link, and forwards the event to the dispatcher.
    pub fn inject(&self, id: LinkId, event: DriverEvent) {
        let mut inner = self.lock();
        let Some(entry) = inner.links.get_mut(&id) else {
            warn!(link_id = %id, "event for unknown link dropped");
            return;
        };
        let old_state = entry.state.life_state;

        let outcome = match &event {
            DriverEvent::Detected => transition(
                old_state,
                &[LinkLifeState::Unknown, LinkLifeState::Down],
                LinkLifeState::Detected,
                LinkEventPayload::LinkDetected,
            ),
            DriverEvent::Up => transition(
                old_state,
                &[LinkLifeState::Detected],
                LinkLifeState::Available,
                LinkEventPayload::LinkUp,
            ),
            DriverEvent::GoingDown => transition(
                old_state,
                &[LinkLifeState::Available],
                LinkLifeState::GoingDown,
                LinkEventPayload::LinkGoingDown,
            ),
            DriverEvent::Down => transition(
                old_state,
                &[
                    LinkLifeState::Detected,
                    LinkLifeState::Available,
                    LinkLifeState::GoingDown,
                ],
                LinkLifeState::Down,
                LinkEventPayload::LinkDown,
            ),
            DriverEvent::Quality { rssi_dbm } => {
                let quality = signal_quality(
                    *rssi_dbm,
                    entry.capability.rssi_min_dbm,
                    entry.capability.rssi_max_dbm,
                );
                entry.state.rssi_dbm = *rssi_dbm;
                entry.state.signal_quality = quality;
                Some((
                    old_state,
                    LinkEventPayload::QualityChanged {
                        rssi_dbm: *rssi_dbm,
                        quality,
                    },
                ))
            }
            DriverEvent::Report { stats } => Some((
                old_state,
                LinkEventPayload::ParameterReport {
                    fwd_usage_kbps: entry.state.fwd_usage_kbps,
                    rev_usage_kbps: entry.state.rev_usage_kbps,
                    stats: *stats,
                },
            )),
            DriverEvent::HandoverRecommend { target } => Some((
                old_state,
                LinkEventPayload::HandoverRecommend { target: *target },
            )),
        };

        let Some((new_state, payload)) = outcome else {
            warn!(
                link_id = %id,
                state = %old_state,
                ?event,
                "illegal life-state transition dropped"
            );
            return;
        };

        if new_state != old_state {
            entry.state.life_state = new_state;
            match new_state {
                LinkLifeState::Available => entry.state.last_up = Some(SystemTime::now()),
                LinkLifeState::Down => entry.state.last_down = Some(SystemTime::now()),
                _ => {}
            }
            info!(link_id = %id, from = %old_state, to = %new_state, "link state changed");
        }

        let message = format!(
            "link {} {} -> {}",
            entry.capability.link_name, old_state, new_state
        );
        self.publish(&inner);
        drop(inner);

        self.events
            .send(LinkEvent::new(id, payload, old_state, new_state, &message));
    }

    /// Total bearers currently active across all links.
    pub fn total_active_bearers(&self) -> usize {
        let inner = self.lock();
        inner
            .links
            .values()
            .map(|l| l.state.active_bearers as usize)
            .sum()
    }

    /// Shut down every driver. Used during engine teardown.
    pub fn shutdown_drivers(&self) {
        let drivers: Vec<Arc<dyn LinkDriver>> = {
            let inner = self.lock();
            inner.links.values().map(|l| l.driver.clone()).collect()
        };
        for driver in drivers {
            driver.shutdown();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, inner: &RegistryInner) {
        let links = inner
            .links
            .iter()
            .map(|(id, entry)| LinkSnapshot {
                id: *id,
                capability: entry.capability.clone(),
                state: entry.state.clone(),
            })
            .collect();
        self.snapshot.store(Arc::new(RegistrySnapshot { links }));
    }
}

fn transition(
    current: LinkLifeState,
    allowed_from: &[LinkLifeState],
    to: LinkLifeState,
    payload: LinkEventPayload,
) -> Option<(LinkLifeState, LinkEventPayload)> {
    allowed_from.contains(&current).then_some((to, payload))
}
