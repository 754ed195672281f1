//! End-to-end engine scenarios against the in-memory host and conntrack
//! backends: allocation round trips, policy tie-breaks, capacity pressure,
//! lossless evacuation, mark uniqueness, and accounting caching.

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use magic_common::types::{
    LinkCapability, LinkStats, LinkType, QosClass, ResourceRequest,
};
use magic_common::{BearerId, Error, LinkId, SessionId};
use magic_engine::conntrack::{ConntrackEntry, MemoryConntrack};
use magic_engine::driver::{DriverGrant, DriverHandle, DriverRequest, LinkDriver};
use magic_engine::host::MemoryHost;
use magic_engine::{Engine, EngineConfig};

// ── Test driver ─────────────────────────────────────────────────────

struct SimLink {
    capability: LinkCapability,
    handle: Mutex<Option<DriverHandle>>,
}

impl SimLink {
    fn new(capability: LinkCapability) -> Arc<Self> {
        Arc::new(SimLink {
            capability,
            handle: Mutex::new(None),
        })
    }

    /// Drive the link to Available through the legal path.
    fn go_up(&self) {
        let guard = self.handle.lock().unwrap();
        let handle = guard.as_ref().expect("driver started");
        handle.raise(magic_engine::driver::DriverEvent::Detected);
        handle.raise(magic_engine::driver::DriverEvent::Up);
    }

    fn going_down(&self) {
        let guard = self.handle.lock().unwrap();
        guard
            .as_ref()
            .expect("driver started")
            .raise(magic_engine::driver::DriverEvent::GoingDown);
    }
}

impl LinkDriver for SimLink {
    fn capability(&self) -> LinkCapability {
        self.capability.clone()
    }

    fn gateway(&self) -> Option<IpAddr> {
        Some("192.168.1.1".parse().unwrap())
    }

    fn statistics(&self) -> LinkStats {
        LinkStats::default()
    }

    fn allocate_resource(&self, _request: &DriverRequest) -> magic_common::Result<DriverGrant> {
        Ok(DriverGrant {
            local_ip: "192.168.1.2".parse().unwrap(),
            gateway: "192.168.1.1".parse().unwrap(),
            dns_primary: "8.8.8.8".parse().unwrap(),
            dns_secondary: "1.1.1.1".parse().unwrap(),
        })
    }

    fn release_resource(&self, _session: SessionId, _bearer: BearerId) -> magic_common::Result<()> {
        Ok(())
    }

    fn start(&self, handle: DriverHandle) {
        *self.handle.lock().unwrap() = Some(handle);
    }
}

fn capability(iface: &str, link_type: LinkType) -> LinkCapability {
    LinkCapability {
        link_name: iface.to_uppercase(),
        interface_name: iface.to_string(),
        link_type,
        max_fwd_kbps: 10_000,
        max_rev_kbps: 10_000,
        typical_latency_ms: 50,
        mtu: 1500,
        security_level: 2,
        cost_per_mb_cents: 1,
        priority: 5,
        rssi_min_dbm: -90,
        rssi_max_dbm: -30,
        ground_only: false,
    }
}

fn request(client: &str, ip: &str) -> ResourceRequest {
    let mut req = ResourceRequest::new(client, ip.parse::<IpAddr>().unwrap());
    req.min_fwd_kbps = 512;
    req.req_fwd_kbps = 2048;
    req.min_rev_kbps = 512;
    req.req_rev_kbps = 2048;
    req.qos = QosClass::new(2).unwrap();
    req.max_delay_ms = 500;
    req
}

struct Rig {
    host: MemoryHost,
    conntrack: MemoryConntrack,
    engine: Engine,
}

fn rig() -> Rig {
    rig_with_ttl(Duration::from_secs(2))
}

fn rig_with_ttl(ttl: Duration) -> Rig {
    let host = MemoryHost::new();
    let conntrack = MemoryConntrack::new();
    let engine = Engine::new(
        Box::new(host.clone()),
        Box::new(conntrack.clone()),
        EngineConfig {
            ingress_iface: "ens39".into(),
            ingress_ip: Some("10.20.0.1".parse().unwrap()),
            stats_cache_ttl: ttl,
        },
    )
    .unwrap();
    Rig {
        host,
        conntrack,
        engine,
    }
}

fn add_link(rig: &Rig, cap: LinkCapability) -> (Arc<SimLink>, LinkId) {
    let driver = SimLink::new(cap);
    let id = rig.engine.register_link(driver.clone()).unwrap();
    driver.go_up();
    (driver, id)
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

// ── Scenario: single-session allocate + release ─────────────────────

#[test]
fn allocate_then_release_round_trips_host_state() {
    let rig = rig();
    let (_driver, link) = add_link(&rig, capability("wlan0", LinkType::WiFi));
    let baseline = rig.host.rules();

    let grant = rig.engine.allocate(request("C1", "10.20.0.5")).unwrap();
    assert_ne!(grant.session_id.value(), 0);
    assert!(grant.granted_fwd_kbps <= 2048);
    assert!(grant.granted_rev_kbps <= 2048);
    assert!(grant.granted_fwd_kbps >= 512);
    assert_eq!(grant.local_ip.to_string(), "192.168.1.2");

    let state = rig.engine.link_state(link).unwrap();
    assert!(state.fwd_usage_kbps >= grant.granted_fwd_kbps);
    assert_eq!(state.active_bearers, 1);

    let record = rig.engine.session(grant.session_id).unwrap();
    assert_eq!(record.link, link);

    rig.engine.release(grant.session_id).unwrap();
    let state = rig.engine.link_state(link).unwrap();
    assert_eq!(state.fwd_usage_kbps, 0);
    assert_eq!(state.active_bearers, 0);
    assert!(rig.engine.session(grant.session_id).is_none());

    // Host returns exactly to its pre-allocation rule set (the restore
    // rule and sysctl are process-lifetime installs).
    let mut after = rig.host.rules();
    after.restore_rule_installed = baseline.restore_rule_installed;
    after.conntrack_acct = baseline.conntrack_acct;
    assert_eq!(after, baseline);

    // Releasing again is a no-op.
    rig.engine.release(grant.session_id).unwrap();
}

// ── Scenario: policy tie-break on cost ──────────────────────────────

#[test]
fn equal_priority_selects_cheaper_link() {
    let rig = rig();
    let mut cap_a = capability("wlan0", LinkType::WiFi);
    cap_a.priority = 10;
    cap_a.cost_per_mb_cents = 5;
    let mut cap_b = capability("wwan0", LinkType::Cellular);
    cap_b.priority = 10;
    cap_b.cost_per_mb_cents = 3;
    let (_a, _link_a) = add_link(&rig, cap_a);
    let (_b, link_b) = add_link(&rig, cap_b);

    let grant = rig.engine.allocate(request("C1", "10.20.0.5")).unwrap();
    assert_eq!(rig.engine.session(grant.session_id).unwrap().link, link_b);
}

// ── Scenario: capacity overflow and recovery ────────────────────────

#[test]
fn third_allocation_overflows_and_recovers_after_release() {
    let rig = rig();
    let mut cap = capability("wlan0", LinkType::WiFi);
    cap.max_fwd_kbps = 1000;
    add_link(&rig, cap);

    let mut req = request("C1", "10.20.0.5");
    req.min_fwd_kbps = 500;
    req.req_fwd_kbps = 500;
    req.min_rev_kbps = 0;
    req.req_rev_kbps = 0;

    let s1 = rig.engine.allocate(req.clone()).unwrap();
    let mut req2 = req.clone();
    req2.client_ip = "10.20.0.6".parse().unwrap();
    let _s2 = rig.engine.allocate(req2).unwrap();

    let mut req3 = req.clone();
    req3.client_ip = "10.20.0.7".parse().unwrap();
    assert!(matches!(
        rig.engine.allocate(req3.clone()),
        Err(Error::NoLinkAvailable) | Err(Error::CapacityExceeded)
    ));

    rig.engine.release(s1.session_id).unwrap();
    let s4 = rig.engine.allocate(req3).unwrap();
    assert_eq!(s4.granted_fwd_kbps, 500);
}

// ── Scenario: lossless evacuation on GoingDown ──────────────────────

#[test]
fn going_down_evacuates_session_losslessly() {
    let rig = rig();
    let mut cap_a = capability("wlan0", LinkType::WiFi);
    cap_a.priority = 10;
    let mut cap_b = capability("wwan0", LinkType::Cellular);
    cap_b.priority = 1;
    let (driver_a, link_a) = add_link(&rig, cap_a);
    let (_driver_b, link_b) = add_link(&rig, cap_b);

    // Priority puts the session on link A.
    let grant = rig.engine.allocate(request("C1", "10.20.0.5")).unwrap();
    assert_eq!(rig.engine.session(grant.session_id).unwrap().link, link_a);

    driver_a.going_down();

    assert!(
        wait_until(Duration::from_secs(5), || {
            rig.engine.session(grant.session_id).map(|r| r.link) == Some(link_b)
        }),
        "session should migrate to the surviving link"
    );

    // Per-link session sets changed by exactly (−1, +1).
    let state_a = rig.engine.link_state(link_a).unwrap();
    let state_b = rig.engine.link_state(link_b).unwrap();
    assert_eq!(state_a.active_bearers, 0);
    assert_eq!(state_b.active_bearers, 1);

    // Lossless: the new-mark classifier was installed before the old-mark
    // classifier was removed, so the client ip was covered throughout.
    let log = rig.host.op_log();
    let client_ops: Vec<&String> = log
        .iter()
        .filter(|op| {
            (op.starts_with("mark_src") || op.starts_with("unmark_src"))
                && op.contains("10.20.0.5")
        })
        .collect();
    let add_new = client_ops
        .iter()
        .position(|op| op.starts_with("mark_src") && op.contains("fwmark 101"))
        .expect("new classifier");
    let del_old = client_ops
        .iter()
        .position(|op| op.starts_with("unmark_src") && op.contains("fwmark 100"))
        .expect("old classifier removal");
    assert!(add_new < del_old, "coverage gap during switch");
}

#[test]
fn failed_switch_changes_nothing() {
    let rig = rig();
    let mut cap_a = capability("wlan0", LinkType::WiFi);
    cap_a.priority = 10;
    let (_a, link_a) = add_link(&rig, cap_a);
    let (_b, link_b) = add_link(&rig, capability("wwan0", LinkType::Cellular));

    let grant = rig.engine.allocate(request("C1", "10.20.0.5")).unwrap();
    let before = rig.host.rules();

    rig.host.fail_next("mark_src");
    assert!(rig.engine.switch(grant.session_id, link_b).is_err());

    assert_eq!(rig.host.rules(), before);
    assert_eq!(rig.engine.session(grant.session_id).unwrap().link, link_a);
    assert_eq!(rig.engine.link_state(link_b).unwrap().active_bearers, 0);
}

// ── Scenario: unique marks under load ───────────────────────────────

#[test]
fn every_active_session_holds_a_unique_mark() {
    let rig = rig();
    for iface in ["wlan0", "wwan0", "sat0"] {
        add_link(&rig, capability(iface, LinkType::Other));
    }

    let mut marks = std::collections::BTreeSet::new();
    let mut sessions = Vec::new();
    for i in 0..48u32 {
        let mut req = request(&format!("C{i}"), &format!("10.20.{}.{}", i / 250, 1 + i % 250));
        req.min_fwd_kbps = 1;
        req.req_fwd_kbps = 1;
        req.min_rev_kbps = 1;
        req.req_rev_kbps = 1;
        let grant = rig.engine.allocate(req).unwrap();
        let record = rig.engine.session(grant.session_id).unwrap();
        assert!(
            (0x100..=0x1FF).contains(&record.mark),
            "mark {:#x} outside pool",
            record.mark
        );
        assert!(marks.insert(record.mark), "mark {:#x} duplicated", record.mark);
        sessions.push(grant.session_id);
    }

    for id in sessions {
        rig.engine.release(id).unwrap();
    }
}

// ── Scenario: accounting round trip ─────────────────────────────────

#[test]
fn stats_follow_cache_then_refresh_then_disappear() {
    let rig = rig();
    add_link(&rig, capability("wlan0", LinkType::WiFi));
    let grant = rig.engine.allocate(request("C1", "10.20.0.5")).unwrap();
    let mark = rig.engine.session(grant.session_id).unwrap().mark;

    rig.conntrack.set_entries(vec![ConntrackEntry {
        mark,
        orig_bytes: 1000,
        orig_packets: 10,
        reply_bytes: 2000,
        reply_packets: 20,
    }]);

    let stats = rig.engine.stats(grant.session_id).unwrap();
    assert_eq!(
        (stats.bytes_in, stats.bytes_out, stats.packets_in, stats.packets_out),
        (1000, 2000, 10, 20)
    );

    // Within the TTL the cached tuple is served even as counters move.
    rig.conntrack.set_entries(vec![ConntrackEntry {
        mark,
        orig_bytes: 5000,
        orig_packets: 50,
        reply_bytes: 9000,
        reply_packets: 90,
    }]);
    let cached = rig.engine.stats(grant.session_id).unwrap();
    assert_eq!(cached.bytes_in, 1000);

    // A forced refresh pulls the fresh counters.
    rig.engine.refresh_stats();
    let fresh = rig.engine.stats(grant.session_id).unwrap();
    assert_eq!((fresh.bytes_in, fresh.bytes_out), (5000, 9000));

    rig.engine.release(grant.session_id).unwrap();
    assert!(matches!(
        rig.engine.stats(grant.session_id),
        Err(Error::SessionNotFound)
    ));
}

#[test]
fn stats_are_monotonic_across_refreshes() {
    let rig = rig_with_ttl(Duration::ZERO);
    add_link(&rig, capability("wlan0", LinkType::WiFi));
    let grant = rig.engine.allocate(request("C1", "10.20.0.5")).unwrap();
    let mark = rig.engine.session(grant.session_id).unwrap().mark;

    let mut previous = 0u64;
    for step in 1..=5u64 {
        rig.conntrack.set_entries(vec![ConntrackEntry {
            mark,
            orig_bytes: step * 700,
            orig_packets: step * 7,
            reply_bytes: step * 1100,
            reply_packets: step * 11,
        }]);
        let stats = rig.engine.stats(grant.session_id).unwrap();
        assert!(stats.bytes_in >= previous);
        previous = stats.bytes_in;
    }
}

// ── Transaction rollback under fault injection ──────────────────────

#[test]
fn allocate_rolls_back_when_route_install_fails() {
    let rig = rig();
    let (_driver, link) = add_link(&rig, capability("wlan0", LinkType::WiFi));
    let baseline = rig.host.rules();

    rig.host.fail_next("mark_src");
    assert!(rig.engine.allocate(request("C1", "10.20.0.5")).is_err());

    assert_eq!(rig.engine.link_state(link).unwrap().active_bearers, 0);
    assert_eq!(rig.engine.link_state(link).unwrap().fwd_usage_kbps, 0);
    assert!(rig.engine.session_ids().is_empty());
    let mut after = rig.host.rules();
    after.restore_rule_installed = baseline.restore_rule_installed;
    after.conntrack_acct = baseline.conntrack_acct;
    assert_eq!(after, baseline);
}

#[test]
fn allocate_rolls_back_when_accounting_fails() {
    let rig = rig();
    let (_driver, link) = add_link(&rig, capability("wlan0", LinkType::WiFi));

    rig.host.fail_next("connmark_pair_add");
    assert!(rig.engine.allocate(request("C1", "10.20.0.5")).is_err());

    assert_eq!(rig.engine.link_state(link).unwrap().active_bearers, 0);
    assert!(rig.engine.session_ids().is_empty());

    // The engine still works afterwards.
    assert!(rig.engine.allocate(request("C1", "10.20.0.5")).is_ok());
}

#[test]
fn no_link_available_without_links() {
    let rig = rig();
    assert!(matches!(
        rig.engine.allocate(request("C1", "10.20.0.5")),
        Err(Error::NoLinkAvailable)
    ));
}

#[test]
fn invalid_requests_rejected_without_side_effects() {
    let rig = rig();
    add_link(&rig, capability("wlan0", LinkType::WiFi));

    let mut empty_client = request("", "10.20.0.5");
    empty_client.client_id.clear();
    assert!(matches!(
        rig.engine.allocate(empty_client),
        Err(Error::InvalidArgument(_))
    ));

    let mut inverted = request("C1", "10.20.0.5");
    inverted.min_fwd_kbps = 4096;
    assert!(matches!(
        rig.engine.allocate(inverted),
        Err(Error::InvalidArgument(_))
    ));

    assert!(rig.engine.session_ids().is_empty());
}

// ── Ground-only links & flight phase ────────────────────────────────

#[test]
fn ground_only_link_requires_ground_phase() {
    use magic_common::types::FlightPhase;

    let rig = rig();
    let mut cap = capability("wlan0", LinkType::WiFi);
    cap.ground_only = true;
    add_link(&rig, cap);

    assert!(matches!(
        rig.engine.allocate(request("C1", "10.20.0.5")),
        Err(Error::NoLinkAvailable)
    ));

    rig.engine.set_flight_phase(FlightPhase::Gate);
    assert!(rig.engine.allocate(request("C1", "10.20.0.5")).is_ok());
}

#[test]
fn crossing_ground_air_boundary_migrates_sessions() {
    use magic_common::types::FlightPhase;

    let rig = rig();
    let mut airport_wifi = capability("wlan0", LinkType::WiFi);
    airport_wifi.ground_only = true;
    airport_wifi.priority = 10;
    let mut cellular = capability("wwan0", LinkType::Cellular);
    cellular.priority = 1;
    let (_wifi, wifi_link) = add_link(&rig, airport_wifi);
    let (_cell, cell_link) = add_link(&rig, cellular);

    // At the gate the ground-only link wins on priority.
    rig.engine.set_flight_phase(FlightPhase::Gate);
    let grant = rig.engine.allocate(request("C1", "10.20.0.5")).unwrap();
    assert_eq!(rig.engine.session(grant.session_id).unwrap().link, wifi_link);

    // Takeoff crosses the boundary: the session must leave the
    // ground-only link.
    rig.engine.set_flight_phase(FlightPhase::Takeoff);
    assert_eq!(rig.engine.session(grant.session_id).unwrap().link, cell_link);
    assert_eq!(rig.engine.link_state(wifi_link).unwrap().active_bearers, 0);
    assert_eq!(rig.engine.link_state(cell_link).unwrap().active_bearers, 1);

    // Climbing stays airborne: no boundary, no movement.
    rig.engine.set_flight_phase(FlightPhase::Climb);
    assert_eq!(rig.engine.session(grant.session_id).unwrap().link, cell_link);

    // Back on the ground the preferred ground-only link is eligible again.
    rig.engine.set_flight_phase(FlightPhase::Gate);
    assert_eq!(rig.engine.session(grant.session_id).unwrap().link, wifi_link);
}

// ── Shutdown ────────────────────────────────────────────────────────

#[test]
fn shutdown_releases_sessions_and_refuses_new_work() {
    let mut rig = rig();
    let (_driver, link) = add_link(&rig, capability("wlan0", LinkType::WiFi));
    let baseline = rig.host.rules();

    let g1 = rig.engine.allocate(request("C1", "10.20.0.5")).unwrap();
    let mut req2 = request("C2", "10.20.0.6");
    req2.req_fwd_kbps = 1024;
    let g2 = rig.engine.allocate(req2).unwrap();
    assert_eq!(rig.engine.session_ids(), vec![g1.session_id, g2.session_id]);

    rig.engine.shutdown();

    assert!(rig.engine.session_ids().is_empty());
    assert_eq!(rig.engine.link_state(link).unwrap().active_bearers, 0);
    let mut after = rig.host.rules();
    after.restore_rule_installed = baseline.restore_rule_installed;
    after.conntrack_acct = baseline.conntrack_acct;
    assert_eq!(after, baseline);

    assert!(matches!(
        rig.engine.allocate(request("C3", "10.20.0.7")),
        Err(Error::Shutdown)
    ));

    // Idempotent.
    rig.engine.shutdown();
}

// ── Flow rules across switches ──────────────────────────────────────

#[test]
fn flow_rules_follow_the_session_across_switch() {
    use magic_common::types::FlowTuple;

    let rig = rig();
    let mut cap_a = capability("wlan0", LinkType::WiFi);
    cap_a.priority = 10;
    let (_a, link_a) = add_link(&rig, cap_a);
    let (_b, link_b) = add_link(&rig, capability("wwan0", LinkType::Cellular));

    let grant = rig.engine.allocate(request("C1", "10.20.0.5")).unwrap();
    let tuple = FlowTuple {
        src_ip: "10.20.0.5".parse().unwrap(),
        dst_ip: "8.8.8.8".parse().unwrap(),
        src_port: 0,
        dst_port: 443,
        protocol: 6,
    };
    rig.engine.add_flow_rule(grant.session_id, tuple, link_a).unwrap();

    rig.engine.switch(grant.session_id, link_b).unwrap();
    assert_eq!(rig.engine.session(grant.session_id).unwrap().link, link_b);

    rig.engine.release(grant.session_id).unwrap();
    assert!(matches!(
        rig.engine.remove_flow_rules(grant.session_id),
        Err(Error::SessionNotFound)
    ));
}
