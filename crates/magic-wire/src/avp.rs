//! Attribute-value pair codec.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::message::WireError;

/// Size of the AVP header: code (4) + flags (1) + length (3).
pub const AVP_HEADER_LEN: usize = 8;

/// Mandatory-bit: the receiver must understand this AVP.
pub const AVP_FLAG_MANDATORY: u8 = 0x40;

/// Address family tags used in address-valued AVPs.
const ADDR_FAMILY_IPV4: u16 = 1;
const ADDR_FAMILY_IPV6: u16 = 2;

fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// A single attribute-value pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avp {
    pub code: u32,
    pub flags: u8,
    pub payload: Bytes,
}

impl Avp {
    pub fn new(code: u32, payload: Bytes) -> Self {
        Avp {
            code,
            flags: AVP_FLAG_MANDATORY,
            payload,
        }
    }

    pub fn from_u32(code: u32, value: u32) -> Self {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32(value);
        Avp::new(code, buf.freeze())
    }

    pub fn from_u64(code: u32, value: u64) -> Self {
        let mut buf = BytesMut::with_capacity(8);
        buf.put_u64(value);
        Avp::new(code, buf.freeze())
    }

    pub fn from_utf8(code: u32, value: &str) -> Self {
        Avp::new(code, Bytes::copy_from_slice(value.as_bytes()))
    }

    /// Address payload: 2-byte family tag followed by the raw octets.
    pub fn from_addr(code: u32, addr: IpAddr) -> Self {
        let mut buf = BytesMut::with_capacity(18);
        match addr {
            IpAddr::V4(v4) => {
                buf.put_u16(ADDR_FAMILY_IPV4);
                buf.put_slice(&v4.octets());
            }
            IpAddr::V6(v6) => {
                buf.put_u16(ADDR_FAMILY_IPV6);
                buf.put_slice(&v6.octets());
            }
        }
        Avp::new(code, buf.freeze())
    }

    pub fn as_u32(&self) -> Result<u32, WireError> {
        if self.payload.len() != 4 {
            return Err(WireError::BadAvpPayload(self.code));
        }
        Ok(u32::from_be_bytes(self.payload[..4].try_into().unwrap()))
    }

    pub fn as_u64(&self) -> Result<u64, WireError> {
        if self.payload.len() != 8 {
            return Err(WireError::BadAvpPayload(self.code));
        }
        Ok(u64::from_be_bytes(self.payload[..8].try_into().unwrap()))
    }

    pub fn as_utf8(&self) -> Result<&str, WireError> {
        std::str::from_utf8(&self.payload).map_err(|_| WireError::BadAvpPayload(self.code))
    }

    pub fn as_addr(&self) -> Result<IpAddr, WireError> {
        if self.payload.len() < 2 {
            return Err(WireError::BadAvpPayload(self.code));
        }
        let family = u16::from_be_bytes(self.payload[..2].try_into().unwrap());
        let octets = &self.payload[2..];
        match (family, octets.len()) {
            (ADDR_FAMILY_IPV4, 4) => {
                let raw: [u8; 4] = octets.try_into().unwrap();
                Ok(IpAddr::V4(Ipv4Addr::from(raw)))
            }
            (ADDR_FAMILY_IPV6, 16) => {
                let raw: [u8; 16] = octets.try_into().unwrap();
                Ok(IpAddr::V6(Ipv6Addr::from(raw)))
            }
            _ => Err(WireError::BadAvpPayload(self.code)),
        }
    }

    /// Declared length: header plus payload, padding excluded.
    pub fn declared_len(&self) -> usize {
        AVP_HEADER_LEN + self.payload.len()
    }

    /// Space the AVP occupies on the wire, padding included.
    pub fn encoded_len(&self) -> usize {
        align4(self.declared_len())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.code);
        let declared = self.declared_len() as u32;
        buf.put_u8(self.flags);
        buf.put_u8((declared >> 16) as u8);
        buf.put_u16(declared as u16);
        buf.put_slice(&self.payload);
        for _ in self.declared_len()..self.encoded_len() {
            buf.put_u8(0);
        }
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Avp, WireError> {
        if buf.remaining() < AVP_HEADER_LEN {
            return Err(WireError::Truncated);
        }
        let code = buf.get_u32();
        let flags = buf.get_u8();
        let declared = ((buf.get_u8() as usize) << 16) | buf.get_u16() as usize;
        if declared < AVP_HEADER_LEN {
            return Err(WireError::BadAvpLength { code, declared });
        }
        let payload_len = declared - AVP_HEADER_LEN;
        let padded_payload = align4(declared) - AVP_HEADER_LEN;
        if buf.remaining() < padded_payload {
            return Err(WireError::Truncated);
        }
        let payload = buf.copy_to_bytes(payload_len);
        buf.advance(padded_payload - payload_len);
        Ok(Avp {
            code,
            flags,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u32_round_trip() {
        let avp = Avp::from_u32(268, 2001);
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);
        assert_eq!(buf.len() % 4, 0);
        let decoded = Avp::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.code, 268);
        assert_eq!(decoded.as_u32().unwrap(), 2001);
    }

    #[test]
    fn utf8_padding() {
        // 5-byte payload → declared 13, padded to 16
        let avp = Avp::from_utf8(264, "magic");
        assert_eq!(avp.declared_len(), 13);
        assert_eq!(avp.encoded_len(), 16);
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);
        assert_eq!(buf.len(), 16);
        let decoded = Avp::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.as_utf8().unwrap(), "magic");
    }

    #[test]
    fn addr_round_trip() {
        for addr in [
            "10.1.2.3".parse::<IpAddr>().unwrap(),
            "fd00::42".parse::<IpAddr>().unwrap(),
        ] {
            let avp = Avp::from_addr(100024, addr);
            let mut buf = BytesMut::new();
            avp.encode(&mut buf);
            let decoded = Avp::decode(&mut buf.freeze()).unwrap();
            assert_eq!(decoded.as_addr().unwrap(), addr);
        }
    }

    #[test]
    fn wrong_width_rejected() {
        let avp = Avp::from_u32(1, 5);
        assert!(avp.as_u64().is_err());
        let avp = Avp::from_u64(1, 5);
        assert!(avp.as_u32().is_err());
    }

    #[test]
    fn undersized_declared_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(268);
        buf.put_u8(0x40);
        buf.put_u8(0);
        buf.put_u16(4); // below the 8-byte header minimum
        let err = Avp::decode(&mut buf.freeze()).unwrap_err();
        assert!(matches!(err, WireError::BadAvpLength { code: 268, .. }));
    }

    #[test]
    fn truncated_payload_rejected() {
        let avp = Avp::from_utf8(264, "abcdef");
        let mut buf = BytesMut::new();
        avp.encode(&mut buf);
        let short = buf.freeze().slice(..10);
        assert!(matches!(
            Avp::decode(&mut short.clone()),
            Err(WireError::Truncated)
        ));
    }
}
