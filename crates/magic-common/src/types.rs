//! Data models shared between the engine, the wire surface, and the daemon.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Bearer slots per link. The pool is a fixed-size array; allocation is
/// linear first-fit.
pub const BEARERS_PER_LINK: usize = 16;

/// Upper bound on concurrently registered links.
pub const MAX_LINKS: usize = 10;

/// Upper bound on concurrently active sessions (one conntrack mark each).
pub const MAX_SESSIONS: usize = 256;

/// Maximum client-id length in bytes.
pub const MAX_CLIENT_ID_LEN: usize = 63;

// ── Link ────────────────────────────────────────────────────────────

/// Physical technology of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Satcom,
    Cellular,
    WiFi,
    Other,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Satcom => "satcom",
            LinkType::Cellular => "cellular",
            LinkType::WiFi => "wifi",
            LinkType::Other => "other",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "satcom" => Ok(LinkType::Satcom),
            "cellular" => Ok(LinkType::Cellular),
            "wifi" => Ok(LinkType::WiFi),
            "other" => Ok(LinkType::Other),
            other => Err(format!("unknown link type: {other}")),
        }
    }
}

/// Engine-managed life state of a link, distinct from the raw OS
/// interface up/down bit.
///
/// ```text
/// Unknown ──detect──► Detected ──up──► Available ──going_down──► GoingDown
///                        │                │                          │
///                        └──────down──────┴─────────down─────────────┴──► Down ──detect──► Detected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkLifeState {
    #[default]
    Unknown,
    Detected,
    Available,
    GoingDown,
    Down,
}

impl LinkLifeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkLifeState::Unknown => "unknown",
            LinkLifeState::Detected => "detected",
            LinkLifeState::Available => "available",
            LinkLifeState::GoingDown => "going_down",
            LinkLifeState::Down => "down",
        }
    }
}

impl fmt::Display for LinkLifeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static capability of a link, supplied by its driver at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkCapability {
    pub link_name: String,
    /// OS interface name (e.g. "wlan0"). Unique across registered links.
    pub interface_name: String,
    pub link_type: LinkType,
    pub max_fwd_kbps: u32,
    pub max_rev_kbps: u32,
    pub typical_latency_ms: u32,
    pub mtu: u16,
    pub security_level: u8,
    pub cost_per_mb_cents: u32,
    /// Higher wins during selection.
    pub priority: u8,
    pub rssi_min_dbm: i32,
    pub rssi_max_dbm: i32,
    /// Usable only while the aircraft is on the ground (Gate/Taxi).
    pub ground_only: bool,
}

/// Dynamic state of a link, maintained by the registry from driver callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkState {
    pub life_state: LinkLifeState,
    pub rssi_dbm: i32,
    /// Derived from RSSI within the capability's [rssi_min, rssi_max] range.
    pub signal_quality: u8,
    pub fwd_usage_kbps: u32,
    pub rev_usage_kbps: u32,
    pub active_bearers: u8,
    pub last_up: Option<SystemTime>,
    pub last_down: Option<SystemTime>,
}

impl Default for LinkState {
    fn default() -> Self {
        LinkState {
            life_state: LinkLifeState::Unknown,
            rssi_dbm: 0,
            signal_quality: 0,
            fwd_usage_kbps: 0,
            rev_usage_kbps: 0,
            active_bearers: 0,
            last_up: None,
            last_down: None,
        }
    }
}

/// Cumulative traffic counters of a link interface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStats {
    pub tx_bytes: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub rx_packets: u64,
}

/// Map an RSSI reading onto a 0–100 quality percentage within the link's
/// configured RSSI range.
pub fn signal_quality(rssi_dbm: i32, rssi_min_dbm: i32, rssi_max_dbm: i32) -> u8 {
    let range = rssi_max_dbm - rssi_min_dbm;
    if range <= 0 {
        return 0;
    }
    let scaled = ((rssi_dbm - rssi_min_dbm) as f64 * 100.0 / range as f64).round();
    scaled.clamp(0.0, 100.0) as u8
}

// ── QoS & flight phase ──────────────────────────────────────────────

/// Class of service, valid range 0..=15.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QosClass(u8);

impl QosClass {
    pub const BEST_EFFORT: QosClass = QosClass(0);

    pub fn new(value: u8) -> Option<Self> {
        (value <= 15).then_some(QosClass(value))
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Flight phase derived from the aircraft-data feed. Only a routing hint:
/// ground-only links are selectable in `Gate` and `Taxi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightPhase {
    #[default]
    Unknown,
    Gate,
    Taxi,
    Takeoff,
    Climb,
    Cruise,
    Descent,
    Approach,
    Landing,
}

impl FlightPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlightPhase::Unknown => "UNKNOWN",
            FlightPhase::Gate => "GATE",
            FlightPhase::Taxi => "TAXI",
            FlightPhase::Takeoff => "TAKEOFF",
            FlightPhase::Climb => "CLIMB",
            FlightPhase::Cruise => "CRUISE",
            FlightPhase::Descent => "DESCENT",
            FlightPhase::Approach => "APPROACH",
            FlightPhase::Landing => "LANDING",
        }
    }

    /// Whether ground-only links may carry traffic in this phase.
    pub fn on_ground(&self) -> bool {
        matches!(self, FlightPhase::Gate | FlightPhase::Taxi)
    }

    /// Compact encoding for atomics and wire fields.
    pub fn to_u8(self) -> u8 {
        match self {
            FlightPhase::Unknown => 0,
            FlightPhase::Gate => 1,
            FlightPhase::Taxi => 2,
            FlightPhase::Takeoff => 3,
            FlightPhase::Climb => 4,
            FlightPhase::Cruise => 5,
            FlightPhase::Descent => 6,
            FlightPhase::Approach => 7,
            FlightPhase::Landing => 8,
        }
    }

    pub fn from_u8(value: u8) -> FlightPhase {
        match value {
            1 => FlightPhase::Gate,
            2 => FlightPhase::Taxi,
            3 => FlightPhase::Takeoff,
            4 => FlightPhase::Climb,
            5 => FlightPhase::Cruise,
            6 => FlightPhase::Descent,
            7 => FlightPhase::Approach,
            8 => FlightPhase::Landing,
            _ => FlightPhase::Unknown,
        }
    }
}

impl FromStr for FlightPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(FlightPhase::Unknown),
            "GATE" => Ok(FlightPhase::Gate),
            "TAXI" => Ok(FlightPhase::Taxi),
            "TAKEOFF" => Ok(FlightPhase::Takeoff),
            "CLIMB" => Ok(FlightPhase::Climb),
            "CRUISE" => Ok(FlightPhase::Cruise),
            "DESCENT" => Ok(FlightPhase::Descent),
            "APPROACH" => Ok(FlightPhase::Approach),
            "LANDING" => Ok(FlightPhase::Landing),
            other => Err(format!("unknown flight phase: {other}")),
        }
    }
}

// ── Resource requests ───────────────────────────────────────────────

/// A client's resource allocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub client_id: String,
    pub client_ip: IpAddr,
    pub min_fwd_kbps: u32,
    pub req_fwd_kbps: u32,
    pub min_rev_kbps: u32,
    pub req_rev_kbps: u32,
    pub qos: QosClass,
    pub max_delay_ms: u32,
    pub min_security: u8,
    pub persistent: bool,
    pub timeout_sec: u32,
}

impl ResourceRequest {
    /// A minimal valid request, useful for tests and defaults.
    pub fn new(client_id: impl Into<String>, client_ip: IpAddr) -> Self {
        ResourceRequest {
            client_id: client_id.into(),
            client_ip,
            min_fwd_kbps: 0,
            req_fwd_kbps: 0,
            min_rev_kbps: 0,
            req_rev_kbps: 0,
            qos: QosClass::BEST_EFFORT,
            max_delay_ms: u32::MAX,
            min_security: 0,
            persistent: false,
            timeout_sec: 0,
        }
    }
}

/// The engine's answer to a successful allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub session_id: SessionId,
    pub granted_fwd_kbps: u32,
    pub granted_rev_kbps: u32,
    pub local_ip: IpAddr,
    pub gateway: IpAddr,
    pub dns_primary: IpAddr,
    pub dns_secondary: IpAddr,
}

impl ResourceGrant {
    pub fn unspecified(session_id: SessionId) -> Self {
        let zero = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        ResourceGrant {
            session_id,
            granted_fwd_kbps: 0,
            granted_rev_kbps: 0,
            local_ip: zero,
            gateway: zero,
            dns_primary: zero,
            dns_secondary: zero,
        }
    }
}

// ── Flows & counters ────────────────────────────────────────────────

/// A 5-tuple traffic flow template refining a session's routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// 0 matches any port.
    pub src_port: u16,
    pub dst_port: u16,
    /// IP protocol number; 0 matches any.
    pub protocol: u8,
}

/// Per-session traffic counters. "in" is the orig direction
/// (client → world); "out" is the reply direction (world → client).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

impl TrafficCounters {
    pub fn accumulate(&mut self, other: &TrafficCounters) {
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.packets_in += other.packets_in;
        self.packets_out += other.packets_out;
    }
}

/// Truncate a human-readable message to `max` bytes on a char boundary.
/// Wire answers carry at most 128 bytes, event messages at most 256.
pub fn truncate_message(msg: &str, max: usize) -> String {
    if msg.len() <= max {
        return msg.to_string();
    }
    let mut end = max;
    while end > 0 && !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_quality_maps_range() {
        // -90..-30 dBm range, midpoint -60 → 50%
        assert_eq!(signal_quality(-90, -90, -30), 0);
        assert_eq!(signal_quality(-30, -90, -30), 100);
        assert_eq!(signal_quality(-60, -90, -30), 50);
    }

    #[test]
    fn signal_quality_clamps_out_of_range() {
        assert_eq!(signal_quality(-120, -90, -30), 0);
        assert_eq!(signal_quality(0, -90, -30), 100);
    }

    #[test]
    fn signal_quality_degenerate_range() {
        assert_eq!(signal_quality(-60, -60, -60), 0);
        assert_eq!(signal_quality(-60, -30, -90), 0);
    }

    #[test]
    fn qos_class_bounds() {
        assert!(QosClass::new(0).is_some());
        assert!(QosClass::new(15).is_some());
        assert!(QosClass::new(16).is_none());
    }

    #[test]
    fn flight_phase_round_trip() {
        for phase in [
            FlightPhase::Gate,
            FlightPhase::Taxi,
            FlightPhase::Cruise,
            FlightPhase::Landing,
        ] {
            assert_eq!(phase.as_str().parse::<FlightPhase>().unwrap(), phase);
        }
        assert!("BALLISTIC".parse::<FlightPhase>().is_err());
    }

    #[test]
    fn ground_phases() {
        assert!(FlightPhase::Gate.on_ground());
        assert!(FlightPhase::Taxi.on_ground());
        assert!(!FlightPhase::Cruise.on_ground());
        assert!(!FlightPhase::Unknown.on_ground());
    }

    #[test]
    fn counters_accumulate() {
        let mut total = TrafficCounters::default();
        total.accumulate(&TrafficCounters {
            bytes_in: 10,
            bytes_out: 20,
            packets_in: 1,
            packets_out: 2,
        });
        total.accumulate(&TrafficCounters {
            bytes_in: 5,
            bytes_out: 5,
            packets_in: 1,
            packets_out: 1,
        });
        assert_eq!(total.bytes_in, 15);
        assert_eq!(total.bytes_out, 25);
        assert_eq!(total.packets_in, 2);
        assert_eq!(total.packets_out, 3);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let msg = "señal perdida";
        let cut = truncate_message(msg, 4);
        assert!(cut.len() <= 4);
        assert!(msg.starts_with(&cut));
        assert_eq!(truncate_message("ok", 128), "ok");
    }
}
