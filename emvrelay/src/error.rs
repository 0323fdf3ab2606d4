use std::time::Duration;
use thiserror::Error;

use crate::session::TransactionState;
use crate::session::TrackerEvent;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("malformed TLV at offset {offset}: {reason}")]
    MalformedTlv { offset: usize, reason: String },

    #[error("malformed APDU: {0}")]
    MalformedApdu(String),

    #[error("no kernel profile registered for AID {0}")]
    UnknownScheme(String),

    #[error("injection fired {lateness:?} late for a {requested:?} delay (tolerance {tolerance:?})")]
    TimingBudgetExceeded {
        requested: Duration,
        lateness: Duration,
        tolerance: Duration,
    },

    #[error("no transition from {from:?} on {event:?}")]
    UnexpectedTransition {
        from: TransactionState,
        event: TrackerEvent,
    },

    // pan is always stored truncated
    #[error("live session already exists for card {pan} / ATC {atc:04X}")]
    SessionConflict { pan: String, atc: u16 },

    #[error("interceptor {interceptor} failed: {reason}")]
    InterceptorFailed { interceptor: String, reason: String },

    #[error("configuration: {0}")]
    Configuration(String),

    #[error("timing scheduler is not running")]
    SchedulerUnavailable,

    #[error("transport channel closed")]
    TransportClosed,
}

impl RelayError {
    pub fn malformed_tlv(offset: usize, reason: impl Into<String>) -> RelayError {
        RelayError::MalformedTlv {
            offset,
            reason: reason.into(),
        }
    }
}

impl From<serde_yaml::Error> for RelayError {
    fn from(err: serde_yaml::Error) -> Self {
        RelayError::Configuration(err.to_string())
    }
}

impl From<hex::FromHexError> for RelayError {
    fn from(err: hex::FromHexError) -> Self {
        RelayError::Configuration(format!("invalid hex: {}", err))
    }
}
