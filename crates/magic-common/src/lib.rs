//! Shared types for the MAGIC platform.
//!
//! This crate contains:
//! - **Ids** — opaque link, session, and bearer identifiers
//! - **Models** — link capability/state/stats, QoS, flight phase, resource requests
//! - **Error taxonomy** — the engine-wide error enum and its wire result-code mapping
//! - **Configuration** — the INI loader and the typed daemon / per-link views
//! - **ADIF helpers** — the aircraft-data XML micro-parser feeding flight-phase hints

pub mod adif;
pub mod config;
pub mod error;
pub mod ids;
pub mod types;

pub use error::{Error, Result};
pub use ids::{BearerId, LinkId, SessionId};
