//! Frame header and message codec.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::avp::Avp;

/// Protocol version.
pub const VERSION: u8 = 1;

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 20;

/// Largest accepted frame. Control traffic is small; anything bigger is a
/// framing error or an attack.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Request bit: set on commands, clear on answers.
pub const FLAG_REQUEST: u8 = 0x80;

/// Error bit: set on protocol-level error answers.
pub const FLAG_ERROR: u8 = 0x20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("frame truncated")]
    Truncated,

    #[error("declared message length {declared} invalid")]
    BadMessageLength { declared: usize },

    #[error("avp {code} declared length {declared} invalid")]
    BadAvpLength { code: u32, declared: usize },

    #[error("avp {0} payload malformed")]
    BadAvpPayload(u32),

    #[error("required avp {0} missing")]
    MissingAvp(u32),

    #[error("unknown command {0}")]
    UnknownCommand(u32),
}

/// The 20-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    /// Total frame length including this header. Filled in by `encode`.
    pub length: u32,
    pub flags: u8,
    /// 24-bit command code.
    pub command: u32,
    pub app_id: u32,
    pub hop_by_hop: u32,
    pub end_to_end: u32,
}

impl Header {
    pub fn is_request(&self) -> bool {
        self.flags & FLAG_REQUEST != 0
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8((self.length >> 16) as u8);
        buf.put_u16(self.length as u16);
        buf.put_u8(self.flags);
        buf.put_u8((self.command >> 16) as u8);
        buf.put_u16(self.command as u16);
        buf.put_u32(self.app_id);
        buf.put_u32(self.hop_by_hop);
        buf.put_u32(self.end_to_end);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Header, WireError> {
        if buf.remaining() < HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let version = buf.get_u8();
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let length = ((buf.get_u8() as u32) << 16) | buf.get_u16() as u32;
        let flags = buf.get_u8();
        let command = ((buf.get_u8() as u32) << 16) | buf.get_u16() as u32;
        Ok(Header {
            version,
            length,
            flags,
            command,
            app_id: buf.get_u32(),
            hop_by_hop: buf.get_u32(),
            end_to_end: buf.get_u32(),
        })
    }
}

/// A complete control message: header plus AVPs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub avps: Vec<Avp>,
}

impl Message {
    /// Build a request frame.
    pub fn request(command: u32, app_id: u32, hop_by_hop: u32, end_to_end: u32) -> Message {
        Message {
            header: Header {
                version: VERSION,
                length: 0,
                flags: FLAG_REQUEST,
                command,
                app_id,
                hop_by_hop,
                end_to_end,
            },
            avps: Vec::new(),
        }
    }

    /// Build the answer skeleton for a request: same command and ids,
    /// request bit cleared.
    pub fn answer_to(request: &Header) -> Message {
        Message {
            header: Header {
                version: VERSION,
                length: 0,
                flags: 0,
                command: request.command,
                app_id: request.app_id,
                hop_by_hop: request.hop_by_hop,
                end_to_end: request.end_to_end,
            },
            avps: Vec::new(),
        }
    }

    pub fn push(&mut self, avp: Avp) -> &mut Self {
        self.avps.push(avp);
        self
    }

    pub fn find(&self, code: u32) -> Option<&Avp> {
        self.avps.iter().find(|a| a.code == code)
    }

    pub fn require(&self, code: u32) -> Result<&Avp, WireError> {
        self.find(code).ok_or(WireError::MissingAvp(code))
    }

    pub fn find_u32(&self, code: u32) -> Option<u32> {
        self.find(code).and_then(|a| a.as_u32().ok())
    }

    pub fn find_u64(&self, code: u32) -> Option<u64> {
        self.find(code).and_then(|a| a.as_u64().ok())
    }

    pub fn find_utf8(&self, code: u32) -> Option<&str> {
        self.find(code).and_then(|a| a.as_utf8().ok())
    }

    pub fn find_addr(&self, code: u32) -> Option<std::net::IpAddr> {
        self.find(code).and_then(|a| a.as_addr().ok())
    }

    /// Serialize the frame, computing the total length field.
    pub fn encode(&self) -> BytesMut {
        let body: usize = self.avps.iter().map(Avp::encoded_len).sum();
        let total = HEADER_LEN + body;
        let mut buf = BytesMut::with_capacity(total);
        let mut header = self.header;
        header.length = total as u32;
        header.encode(&mut buf);
        for avp in &self.avps {
            avp.encode(&mut buf);
        }
        buf
    }

    /// Decode one complete frame from `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Message, WireError> {
        let start_remaining = buf.remaining();
        let header = Header::decode(buf)?;
        let declared = header.length as usize;
        if declared < HEADER_LEN || declared > MAX_FRAME_LEN {
            return Err(WireError::BadMessageLength { declared });
        }
        if declared > start_remaining {
            return Err(WireError::Truncated);
        }

        let mut body_remaining = declared - HEADER_LEN;
        let mut avps = Vec::new();
        while body_remaining > 0 {
            let before = buf.remaining();
            let avp = Avp::decode(buf)?;
            let consumed = before - buf.remaining();
            if consumed > body_remaining {
                return Err(WireError::BadMessageLength { declared });
            }
            body_remaining -= consumed;
            avps.push(avp);
        }

        Ok(Message { header, avps })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict;
    use proptest::prelude::*;

    #[test]
    fn header_round_trip() {
        let mut msg = Message::request(dict::CMD_RESOURCE_CONTROL, dict::APPLICATION_ID, 7, 9);
        msg.push(Avp::from_u32(dict::AVP_RESULT_CODE, 2001));
        let encoded = msg.encode();
        assert_eq!(
            encoded.len() % 4,
            0,
            "frames stay 4-byte aligned: {}",
            encoded.len()
        );
        let decoded = Message::decode(&mut encoded.freeze()).unwrap();
        assert!(decoded.header.is_request());
        assert_eq!(decoded.header.command, dict::CMD_RESOURCE_CONTROL);
        assert_eq!(decoded.header.hop_by_hop, 7);
        assert_eq!(decoded.header.end_to_end, 9);
        assert_eq!(decoded.find_u32(dict::AVP_RESULT_CODE), Some(2001));
    }

    #[test]
    fn answer_mirrors_request_ids() {
        let req = Message::request(dict::CMD_DEVICE_WATCHDOG, dict::APPLICATION_ID, 11, 22);
        let ans = Message::answer_to(&req.header);
        assert!(!ans.header.is_request());
        assert_eq!(ans.header.command, dict::CMD_DEVICE_WATCHDOG);
        assert_eq!(ans.header.hop_by_hop, 11);
        assert_eq!(ans.header.end_to_end, 22);
    }

    #[test]
    fn bad_version_rejected() {
        let msg = Message::request(257, dict::APPLICATION_ID, 0, 0);
        let mut encoded = msg.encode();
        encoded[0] = 9;
        assert_eq!(
            Message::decode(&mut encoded.freeze()),
            Err(WireError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn truncated_frame_rejected() {
        let mut msg = Message::request(257, dict::APPLICATION_ID, 0, 0);
        msg.push(Avp::from_utf8(dict::AVP_ORIGIN_HOST, "client.cabin"));
        let encoded = msg.encode();
        for cut in [1, HEADER_LEN - 1, HEADER_LEN + 3, encoded.len() - 1] {
            let partial = encoded.clone().freeze().slice(..cut);
            assert!(
                Message::decode(&mut partial.clone()).is_err(),
                "cut at {cut} must fail"
            );
        }
    }

    #[test]
    fn avp_overrunning_frame_rejected() {
        let mut msg = Message::request(257, dict::APPLICATION_ID, 0, 0);
        msg.push(Avp::from_u32(dict::AVP_RESULT_CODE, 2001));
        let mut encoded = msg.encode();
        // Shrink the declared message length so the AVP runs past the frame.
        encoded[1] = 0;
        encoded[2] = 0;
        encoded[3] = (HEADER_LEN + 4) as u8;
        assert!(Message::decode(&mut encoded.freeze()).is_err());
    }

    proptest! {
        #[test]
        fn proptest_message_round_trip(
            command in prop_oneof![Just(257u32), Just(280u32), Just(100_005u32)],
            hbh in any::<u32>(),
            e2e in any::<u32>(),
            values in proptest::collection::vec(any::<u32>(), 0..8),
            text in "[a-zA-Z0-9;.\\-]{0,64}",
        ) {
            let mut msg = Message::request(command, dict::APPLICATION_ID, hbh, e2e);
            for (i, v) in values.iter().enumerate() {
                msg.push(Avp::from_u32(100_100 + i as u32, *v));
            }
            msg.push(Avp::from_utf8(dict::AVP_SESSION_ID, &text));
            let encoded = msg.encode();
            let decoded = Message::decode(&mut encoded.freeze()).unwrap();
            prop_assert_eq!(decoded.header.command, command);
            prop_assert_eq!(decoded.avps.len(), values.len() + 1);
            for (i, v) in values.iter().enumerate() {
                prop_assert_eq!(decoded.find_u32(100_100 + i as u32), Some(*v));
            }
            prop_assert_eq!(decoded.find_utf8(dict::AVP_SESSION_ID), Some(text.as_str()));
        }

        #[test]
        fn proptest_decode_never_panics(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = Message::decode(&mut bytes::Bytes::from(data));
        }
    }
}
