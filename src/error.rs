use std::sync::Arc;

use thiserror::Error;


/// Failure of a single bus transaction (or of a discovery/refresh cycle built from them).
#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("transport error: {0}")]
    Transport(Arc<std::io::Error>),

    #[error("exception response (function {function:#04x}, code {code:?})")]
    ExceptionResponse {
        function: u8,
        code: Option<u8>
    },

    #[error("invalid checksum (expected {expected:#06x}, actual: {actual:#06x})")]
    ChecksumMismatch {
        expected: u16,
        actual: u16
    },

    #[error("adaptor is not ready")]
    AdaptorNotReady,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("no response within the command timeout")]
    Timeout,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unit {0} is not present")]
    UnitNotPresent(u8),

    #[error("command sequencer has shut down")]
    Closed,
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Transport(Arc::new(err))
    }
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;
