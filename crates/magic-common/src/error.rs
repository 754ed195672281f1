//! Engine-wide error taxonomy.
//!
//! Local errors are surfaced to the caller without side effects; transaction
//! errors (`HostConfig`, `SwitchFailed`) mean the caller rolled back to the
//! pre-state. Invariant violations are not represented here — they abort.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("link not found")]
    LinkNotFound,

    #[error("link is not available")]
    LinkNotAvailable,

    #[error("link still referenced by active sessions or bearers")]
    LinkBusy,

    #[error("interface {0} is already registered")]
    DuplicateInterface(String),

    #[error("requested bandwidth exceeds remaining link capacity")]
    CapacityExceeded,

    #[error("bearer id space exhausted on link")]
    BearerIdExhausted,

    #[error("no link satisfies the request")]
    NoLinkAvailable,

    #[error("session not found")]
    SessionNotFound,

    #[error("conntrack mark pool exhausted")]
    MarkPoolExhausted,

    #[error("kernel traffic accounting unavailable")]
    AccountingUnavailable,

    #[error("host configuration failed during {op}: {detail}")]
    HostConfig { op: &'static str, detail: String },

    #[error("switch failed: {reason}")]
    SwitchFailed { reason: String },

    #[error("driver call failed: {0}")]
    DriverCallFailed(String),

    #[error("engine is shutting down")]
    Shutdown,
}

impl Error {
    /// Map the error onto the control protocol's Result-Code space.
    /// 2001 (success) is produced by the answer builders, never here.
    pub fn result_code(&self) -> u32 {
        match self {
            Error::InvalidArgument(_) => 5004,
            Error::SessionNotFound => 5002,
            Error::CapacityExceeded
            | Error::BearerIdExhausted
            | Error::MarkPoolExhausted
            | Error::NoLinkAvailable => 5006,
            Error::LinkNotFound
            | Error::LinkNotAvailable
            | Error::LinkBusy
            | Error::DuplicateInterface(_)
            | Error::AccountingUnavailable
            | Error::HostConfig { .. }
            | Error::SwitchFailed { .. }
            | Error::DriverCallFailed(_)
            | Error::Shutdown => 5012,
        }
    }
}
