//! Link selection policy.
//!
//! Pure: the selector reads a registry snapshot and a flight-phase hint and
//! returns the best link, with no hysteresis and no side effects. Scoring is
//! lexicographic — highest priority, then lowest cost per MB, then lowest
//! forward utilization, then lowest latency — with the 16-byte link id as
//! the stable final tie-break.

use magic_common::types::{FlightPhase, LinkLifeState, ResourceRequest};
use magic_common::LinkId;

use crate::registry::{LinkSnapshot, RegistrySnapshot};

/// Does this link satisfy the request at all?
fn eligible(link: &LinkSnapshot, request: &ResourceRequest, phase: FlightPhase) -> bool {
    let cap = &link.capability;
    let state = &link.state;
    state.life_state == LinkLifeState::Available
        && cap.max_fwd_kbps - state.fwd_usage_kbps >= request.min_fwd_kbps
        && cap.max_rev_kbps - state.rev_usage_kbps >= request.min_rev_kbps
        && cap.typical_latency_ms <= request.max_delay_ms
        && cap.security_level >= request.min_security
        && (!cap.ground_only || phase.on_ground())
}

/// Sort key: smaller is better.
fn score(link: &LinkSnapshot) -> (u8, u32, u64, u32, LinkId) {
    let cap = &link.capability;
    // Utilization in hundredths of a percent, integer to keep ordering total.
    let utilization = if cap.max_fwd_kbps == 0 {
        u64::MAX
    } else {
        link.state.fwd_usage_kbps as u64 * 10_000 / cap.max_fwd_kbps as u64
    };
    (
        u8::MAX - cap.priority,
        cap.cost_per_mb_cents,
        utilization,
        cap.typical_latency_ms,
        link.id,
    )
}

/// Pick the best link for `request`, or `None` when nothing qualifies.
pub fn select(
    request: &ResourceRequest,
    snapshot: &RegistrySnapshot,
    phase: FlightPhase,
) -> Option<LinkId> {
    snapshot
        .links
        .iter()
        .filter(|link| eligible(link, request, phase))
        .min_by_key(|link| score(link))
        .map(|link| link.id)
}
