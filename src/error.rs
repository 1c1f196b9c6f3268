use crate::transfer::TransferId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DccError>;

#[derive(Error, Debug)]
pub enum DccError {
    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("File operation error: {0}")]
    FileOperation(String),

    #[error("No free port in range {first}-{last}")]
    PortRangeExhausted { first: u16, last: u16 },

    #[error("Unknown transfer {0}")]
    UnknownTransfer(TransferId),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Engine is not running")]
    EngineStopped,
}

impl DccError {
    pub(crate) fn protocol(verb: &str, reason: impl std::fmt::Display) -> Self {
        DccError::Protocol(format!("invalid DCC {} request: {}", verb, reason))
    }
}
