//! Engine identifiers.
//!
//! `LinkId` is an opaque 16-byte value (UUIDv7, time-ordered) assigned by the
//! registry at driver registration. Ordering is lexicographic over the raw
//! bytes, which the policy selector relies on as its final tie-break.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier of a registered physical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LinkId(Uuid);

impl LinkId {
    /// Allocate a fresh, time-ordered id.
    pub fn generate() -> Self {
        LinkId(Uuid::now_v7())
    }

    /// The raw 16 bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        LinkId(Uuid::from_bytes(bytes))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lnk_{}", self.0.as_simple())
    }
}

/// Identifier of a client session. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u32);

impl SessionId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a bearer, unique within its owning link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BearerId(pub u8);

impl fmt::Display for BearerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_ids_are_unique() {
        assert_ne!(LinkId::generate(), LinkId::generate());
    }

    #[test]
    fn link_ids_are_time_ordered() {
        let a = LinkId::generate();
        let b = LinkId::generate();
        // UUIDv7 is time-ordered, so later ids compare greater.
        assert!(b > a);
    }

    #[test]
    fn link_id_byte_round_trip() {
        let a = LinkId::generate();
        let b = LinkId::from_bytes(*a.as_bytes());
        assert_eq!(a, b);
    }

    #[test]
    fn display_prefixes() {
        assert!(LinkId::generate().to_string().starts_with("lnk_"));
        assert_eq!(SessionId(7).to_string(), "7");
    }
}
