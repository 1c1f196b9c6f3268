pub mod config;
pub mod error;
pub mod network;
pub mod service;
pub mod transfer;

pub use error::{DccError, Result};
pub use service::{DccEngine, EngineHandle, OutgoingControl};
pub use transfer::{TransferEvent, TransferId, TransferSnapshot, TransferStatus};
