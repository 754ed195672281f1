//! Typed views over resource-control and housekeeping messages.

use std::net::IpAddr;

use magic_common::types::{
    truncate_message, QosClass, ResourceGrant, ResourceRequest, TrafficCounters,
};
use magic_common::SessionId;

use crate::avp::Avp;
use crate::dict::{self, Action};
use crate::message::{Message, WireError};

/// Upper bound on Error-Message text carried in answers.
pub const MAX_ERROR_MESSAGE_LEN: usize = 128;

/// A decoded resource-control request.
#[derive(Debug, Clone)]
pub struct ResourceControlRequest {
    pub action: Action,
    /// Present on Release / Modify / Stats. Stats with no session number
    /// aggregates over the client (or over everything when the client id
    /// is "*").
    pub session: Option<SessionId>,
    pub request: ResourceRequest,
}

impl ResourceControlRequest {
    pub fn from_message(msg: &Message) -> Result<Self, WireError> {
        if msg.header.command != dict::CMD_RESOURCE_CONTROL {
            return Err(WireError::UnknownCommand(msg.header.command));
        }
        let action = msg
            .require(dict::AVP_ACTION)?
            .as_u32()
            .ok()
            .and_then(Action::from_u32)
            .ok_or(WireError::BadAvpPayload(dict::AVP_ACTION))?;

        let client_id = msg
            .require(dict::AVP_CLIENT_ID)?
            .as_utf8()?
            .to_string();
        let client_ip = msg
            .find_addr(dict::AVP_CLIENT_IP)
            .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

        let mut request = ResourceRequest::new(client_id, client_ip);
        request.min_fwd_kbps = msg.find_u32(dict::AVP_MIN_FWD_KBPS).unwrap_or(0);
        request.req_fwd_kbps = msg.find_u32(dict::AVP_REQ_FWD_KBPS).unwrap_or(0);
        request.min_rev_kbps = msg.find_u32(dict::AVP_MIN_REV_KBPS).unwrap_or(0);
        request.req_rev_kbps = msg.find_u32(dict::AVP_REQ_REV_KBPS).unwrap_or(0);
        request.qos = msg
            .find_u32(dict::AVP_QOS_CLASS)
            .and_then(|v| u8::try_from(v).ok())
            .and_then(QosClass::new)
            .unwrap_or(QosClass::BEST_EFFORT);
        request.max_delay_ms = msg.find_u32(dict::AVP_MAX_DELAY_MS).unwrap_or(u32::MAX);
        request.min_security = msg
            .find_u32(dict::AVP_MIN_SECURITY)
            .and_then(|v| u8::try_from(v).ok())
            .unwrap_or(0);
        request.timeout_sec = msg.find_u32(dict::AVP_TIMEOUT_SEC).unwrap_or(0);
        request.persistent = msg.find_u32(dict::AVP_PERSISTENT).unwrap_or(0) != 0;

        let session = msg
            .find_u32(dict::AVP_SESSION_NUMBER)
            .filter(|v| *v != 0)
            .map(SessionId);

        Ok(ResourceControlRequest {
            action,
            session,
            request,
        })
    }

    pub fn into_message(self, hop_by_hop: u32, end_to_end: u32) -> Message {
        let mut msg = Message::request(
            dict::CMD_RESOURCE_CONTROL,
            dict::APPLICATION_ID,
            hop_by_hop,
            end_to_end,
        );
        msg.push(Avp::from_u32(dict::AVP_ACTION, self.action as u32));
        msg.push(Avp::from_utf8(dict::AVP_CLIENT_ID, &self.request.client_id));
        msg.push(Avp::from_addr(dict::AVP_CLIENT_IP, self.request.client_ip));
        if let Some(session) = self.session {
            msg.push(Avp::from_u32(dict::AVP_SESSION_NUMBER, session.value()));
        }
        msg.push(Avp::from_u32(dict::AVP_MIN_FWD_KBPS, self.request.min_fwd_kbps));
        msg.push(Avp::from_u32(dict::AVP_REQ_FWD_KBPS, self.request.req_fwd_kbps));
        msg.push(Avp::from_u32(dict::AVP_MIN_REV_KBPS, self.request.min_rev_kbps));
        msg.push(Avp::from_u32(dict::AVP_REQ_REV_KBPS, self.request.req_rev_kbps));
        msg.push(Avp::from_u32(
            dict::AVP_QOS_CLASS,
            self.request.qos.value() as u32,
        ));
        msg.push(Avp::from_u32(dict::AVP_MAX_DELAY_MS, self.request.max_delay_ms));
        msg.push(Avp::from_u32(
            dict::AVP_MIN_SECURITY,
            self.request.min_security as u32,
        ));
        msg.push(Avp::from_u32(dict::AVP_TIMEOUT_SEC, self.request.timeout_sec));
        msg.push(Avp::from_u32(
            dict::AVP_PERSISTENT,
            self.request.persistent as u32,
        ));
        msg
    }
}

/// Build a successful allocation answer.
pub fn allocate_answer(request: &Message, grant: &ResourceGrant) -> Message {
    let mut ans = Message::answer_to(&request.header);
    ans.push(Avp::from_u32(dict::AVP_RESULT_CODE, dict::RESULT_SUCCESS));
    ans.push(Avp::from_u32(
        dict::AVP_SESSION_NUMBER,
        grant.session_id.value(),
    ));
    ans.push(Avp::from_u32(dict::AVP_GRANTED_FWD_KBPS, grant.granted_fwd_kbps));
    ans.push(Avp::from_u32(dict::AVP_GRANTED_REV_KBPS, grant.granted_rev_kbps));
    ans.push(Avp::from_addr(dict::AVP_LOCAL_IP, grant.local_ip));
    ans.push(Avp::from_addr(dict::AVP_GATEWAY_IP, grant.gateway));
    ans.push(Avp::from_addr(dict::AVP_DNS_PRIMARY, grant.dns_primary));
    ans.push(Avp::from_addr(dict::AVP_DNS_SECONDARY, grant.dns_secondary));
    ans
}

/// Build a stats answer carrying the session's counters.
pub fn stats_answer(request: &Message, counters: &TrafficCounters) -> Message {
    let mut ans = Message::answer_to(&request.header);
    ans.push(Avp::from_u32(dict::AVP_RESULT_CODE, dict::RESULT_SUCCESS));
    ans.push(Avp::from_u64(dict::AVP_BYTES_IN, counters.bytes_in));
    ans.push(Avp::from_u64(dict::AVP_BYTES_OUT, counters.bytes_out));
    ans.push(Avp::from_u64(dict::AVP_PACKETS_IN, counters.packets_in));
    ans.push(Avp::from_u64(dict::AVP_PACKETS_OUT, counters.packets_out));
    ans
}

/// Build a bare success answer (release, watchdog).
pub fn success_answer(request: &Message) -> Message {
    let mut ans = Message::answer_to(&request.header);
    ans.push(Avp::from_u32(dict::AVP_RESULT_CODE, dict::RESULT_SUCCESS));
    ans
}

/// Build a failure answer with a bounded human-readable message.
pub fn failure_answer(request: &Message, result_code: u32, message: &str) -> Message {
    let mut ans = Message::answer_to(&request.header);
    ans.header.flags |= crate::message::FLAG_ERROR;
    ans.push(Avp::from_u32(dict::AVP_RESULT_CODE, result_code));
    ans.push(Avp::from_utf8(
        dict::AVP_ERROR_MESSAGE,
        &truncate_message(message, MAX_ERROR_MESSAGE_LEN),
    ));
    ans
}

/// Build a capabilities-exchange answer.
pub fn capabilities_answer(request: &Message, origin_host: &str) -> Message {
    let mut ans = Message::answer_to(&request.header);
    ans.push(Avp::from_u32(dict::AVP_RESULT_CODE, dict::RESULT_SUCCESS));
    ans.push(Avp::from_utf8(dict::AVP_ORIGIN_HOST, origin_host));
    ans.push(Avp::from_utf8(dict::AVP_PRODUCT_NAME, "magicd"));
    ans
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn sample_request() -> ResourceControlRequest {
        let mut request = ResourceRequest::new("C1", IpAddr::V4(Ipv4Addr::new(10, 20, 0, 5)));
        request.min_fwd_kbps = 512;
        request.req_fwd_kbps = 2048;
        request.min_rev_kbps = 512;
        request.req_rev_kbps = 2048;
        request.qos = QosClass::new(2).unwrap();
        request.max_delay_ms = 500;
        request.timeout_sec = 3600;
        ResourceControlRequest {
            action: Action::Allocate,
            session: None,
            request,
        }
    }

    #[test]
    fn resource_request_round_trip() {
        let encoded = sample_request().into_message(1, 2).encode();
        let msg = Message::decode(&mut encoded.freeze()).unwrap();
        let decoded = ResourceControlRequest::from_message(&msg).unwrap();
        assert_eq!(decoded.action, Action::Allocate);
        assert_eq!(decoded.request.client_id, "C1");
        assert_eq!(decoded.request.req_fwd_kbps, 2048);
        assert_eq!(decoded.request.qos.value(), 2);
        assert_eq!(decoded.request.max_delay_ms, 500);
        assert!(decoded.session.is_none());
    }

    #[test]
    fn release_carries_session_number() {
        let mut req = sample_request();
        req.action = Action::Release;
        req.session = Some(SessionId(42));
        let encoded = req.into_message(3, 4).encode();
        let msg = Message::decode(&mut encoded.freeze()).unwrap();
        let decoded = ResourceControlRequest::from_message(&msg).unwrap();
        assert_eq!(decoded.action, Action::Release);
        assert_eq!(decoded.session, Some(SessionId(42)));
    }

    #[test]
    fn missing_action_rejected() {
        let mut msg = Message::request(dict::CMD_RESOURCE_CONTROL, dict::APPLICATION_ID, 0, 0);
        msg.push(Avp::from_utf8(dict::AVP_CLIENT_ID, "C1"));
        assert_eq!(
            ResourceControlRequest::from_message(&msg).unwrap_err(),
            WireError::MissingAvp(dict::AVP_ACTION)
        );
    }

    #[test]
    fn allocate_answer_carries_grant() {
        let req = sample_request().into_message(5, 6);
        let mut grant = ResourceGrant::unspecified(SessionId(9));
        grant.granted_fwd_kbps = 2048;
        grant.local_ip = IpAddr::V4(Ipv4Addr::new(192, 168, 10, 2));
        let ans = allocate_answer(&req, &grant);
        assert!(!ans.header.is_request());
        assert_eq!(ans.find_u32(dict::AVP_RESULT_CODE), Some(2001));
        assert_eq!(ans.find_u32(dict::AVP_SESSION_NUMBER), Some(9));
        assert_eq!(ans.find_u32(dict::AVP_GRANTED_FWD_KBPS), Some(2048));
        assert_eq!(
            ans.find_addr(dict::AVP_LOCAL_IP),
            Some("192.168.10.2".parse().unwrap())
        );
    }

    #[test]
    fn failure_answer_truncates_message() {
        let req = sample_request().into_message(1, 1);
        let long = "x".repeat(500);
        let ans = failure_answer(&req, 5012, &long);
        assert_eq!(ans.find_u32(dict::AVP_RESULT_CODE), Some(5012));
        assert_eq!(
            ans.find_utf8(dict::AVP_ERROR_MESSAGE).unwrap().len(),
            MAX_ERROR_MESSAGE_LEN
        );
        assert_ne!(ans.header.flags & crate::message::FLAG_ERROR, 0);
    }

    #[test]
    fn stats_answer_counters() {
        let req = sample_request().into_message(1, 1);
        let ans = stats_answer(
            &req,
            &TrafficCounters {
                bytes_in: 1000,
                bytes_out: 2000,
                packets_in: 10,
                packets_out: 20,
            },
        );
        assert_eq!(ans.find_u64(dict::AVP_BYTES_IN), Some(1000));
        assert_eq!(ans.find_u64(dict::AVP_BYTES_OUT), Some(2000));
        assert_eq!(ans.find_u64(dict::AVP_PACKETS_OUT), Some(20));
    }
}
