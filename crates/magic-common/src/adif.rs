//! Aircraft-data (ADIF) helpers.
//!
//! The aircraft-data service publishes avionic parameters as flat XML, each
//! parameter tagged with a numeric validity code (0 = no data, 1 = normal
//! operation, 2 = no computed data):
//!
//! ```text
//! <publishAvionicParameters>
//!     <parameter name="FlightPhase" value="CRUISE" validity="1"/>
//!     <parameter name="WeightOnWheels" value="1" validity="1"/>
//! </publishAvionicParameters>
//! ```
//!
//! The `WeightOnWheels` discrete is published as `0` when weight is on the
//! wheels (on the ground) and `1` when airborne.
//!
//! The engine only consumes the flight phase (and weight-on-wheels as a
//! fallback) as a routing hint, so a full XML stack is unnecessary; this
//! micro-parser extracts attributes from `parameter` elements by name.

use std::str::FromStr;

use crate::types::FlightPhase;

/// Validity code marking a parameter as carrying normal data.
const VALIDITY_NORMAL: u32 = 1;

/// Decoded subset of a published aircraft-state message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AircraftState {
    pub flight_phase: FlightPhase,
    pub weight_on_wheels: Option<bool>,
    pub ground_speed_kts: Option<f64>,
    pub vertical_speed_fpm: Option<f64>,
    pub tail_number: Option<String>,
}

/// Extract `attr` of the `<parameter name="{name}" …/>` element, if present
/// and carrying normal-validity data (a missing validity attribute counts
/// as valid).
fn parameter_attr<'a>(xml: &'a str, name: &str, attr: &str) -> Option<&'a str> {
    let anchor = format!("name=\"{name}\"");
    let start = xml.find(&anchor)?;
    let element = &xml[start..];
    let end = element.find('>').unwrap_or(element.len());
    let element = &element[..end];

    if let Some(validity) = attr_value(element, "validity") {
        if validity.trim().parse::<u32>().ok()? != VALIDITY_NORMAL {
            return None;
        }
    }
    attr_value(element, attr)
}

fn attr_value<'a>(element: &'a str, attr: &str) -> Option<&'a str> {
    let pattern = format!("{attr}=\"");
    let start = element.find(&pattern)? + pattern.len();
    let rest = &element[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Parse a published aircraft-state message. Unparseable or invalid
/// parameters are simply absent from the result.
pub fn parse_publish(xml: &str) -> AircraftState {
    let mut state = AircraftState::default();

    if let Some(raw) = parameter_attr(xml, "FlightPhase", "value") {
        if let Ok(phase) = FlightPhase::from_str(raw) {
            state.flight_phase = phase;
        }
    }
    if let Some(raw) = parameter_attr(xml, "WeightOnWheels", "value") {
        // 0 = weight on wheels (ground), non-zero = airborne.
        state.weight_on_wheels = raw.trim().parse::<i32>().ok().map(|v| v == 0);
    }
    state.ground_speed_kts = parameter_attr(xml, "GroundSpeed", "value").and_then(|v| v.parse().ok());
    state.vertical_speed_fpm =
        parameter_attr(xml, "VerticalSpeed", "value").and_then(|v| v.parse().ok());
    state.tail_number = parameter_attr(xml, "AircraftTailNumber", "value").map(str::to_string);

    // With no explicit phase, fall back to weight-on-wheels: on the ground
    // the most conservative ground phase is Taxi, airborne is Unknown.
    if state.flight_phase == FlightPhase::Unknown {
        if let Some(true) = state.weight_on_wheels {
            state.flight_phase = FlightPhase::Taxi;
        }
    }

    state
}

/// Whether a phase change warrants re-running link selection for existing
/// sessions: only the ground/air boundary changes link eligibility.
pub fn should_reevaluate_routing(old: FlightPhase, new: FlightPhase) -> bool {
    old.on_ground() != new.on_ground()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLISH: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<publishAvionicParameters>
    <parameter name="WeightOnWheels" value="1" validity="1" time="1732600000"/>
    <parameter name="FlightPhase" value="CRUISE" validity="1"/>
    <parameter name="GroundSpeed" value="451.2" validity="1"/>
    <parameter name="VerticalSpeed" value="-20" validity="1"/>
    <parameter name="AircraftTailNumber" value="D-MAGIC" validity="1"/>
</publishAvionicParameters>"#;

    #[test]
    fn parses_full_publish() {
        let state = parse_publish(PUBLISH);
        assert_eq!(state.flight_phase, FlightPhase::Cruise);
        assert_eq!(state.weight_on_wheels, Some(false), "1 means airborne");
        assert_eq!(state.ground_speed_kts, Some(451.2));
        assert_eq!(state.vertical_speed_fpm, Some(-20.0));
        assert_eq!(state.tail_number.as_deref(), Some("D-MAGIC"));
    }

    #[test]
    fn invalid_parameters_are_skipped() {
        // 0 = no data, 2 = no computed data.
        for code in ["0", "2"] {
            let xml =
                format!(r#"<parameter name="FlightPhase" value="CRUISE" validity="{code}"/>"#);
            let state = parse_publish(&xml);
            assert_eq!(state.flight_phase, FlightPhase::Unknown, "validity {code}");
        }
    }

    #[test]
    fn non_numeric_validity_is_rejected() {
        let xml = r#"<parameter name="FlightPhase" value="CRUISE" validity="valid"/>"#;
        let state = parse_publish(xml);
        assert_eq!(state.flight_phase, FlightPhase::Unknown);
    }

    #[test]
    fn missing_validity_counts_as_valid() {
        let xml = r#"<parameter name="FlightPhase" value="CLIMB"/>"#;
        let state = parse_publish(xml);
        assert_eq!(state.flight_phase, FlightPhase::Climb);
    }

    #[test]
    fn wow_zero_is_on_ground_and_falls_back_to_taxi() {
        let xml = r#"<parameter name="WeightOnWheels" value="0" validity="1"/>"#;
        let state = parse_publish(xml);
        assert_eq!(state.weight_on_wheels, Some(true));
        assert_eq!(state.flight_phase, FlightPhase::Taxi);
    }

    #[test]
    fn wow_one_is_airborne() {
        let xml = r#"<parameter name="WeightOnWheels" value="1" validity="1"/>"#;
        let state = parse_publish(xml);
        assert_eq!(state.weight_on_wheels, Some(false));
        assert_eq!(state.flight_phase, FlightPhase::Unknown);
    }

    #[test]
    fn garbage_input_yields_default() {
        assert_eq!(parse_publish("not xml at all"), AircraftState::default());
        assert_eq!(parse_publish(""), AircraftState::default());
    }

    #[test]
    fn reevaluation_only_on_ground_air_boundary() {
        assert!(should_reevaluate_routing(
            FlightPhase::Taxi,
            FlightPhase::Takeoff
        ));
        assert!(should_reevaluate_routing(
            FlightPhase::Landing,
            FlightPhase::Gate
        ));
        assert!(!should_reevaluate_routing(
            FlightPhase::Climb,
            FlightPhase::Cruise
        ));
        assert!(!should_reevaluate_routing(
            FlightPhase::Gate,
            FlightPhase::Taxi
        ));
    }
}
