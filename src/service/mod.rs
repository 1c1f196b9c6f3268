pub mod engine;
pub mod manager;

pub use engine::{DccEngine, EngineHandle};
pub use manager::{OutgoingControl, TransferManager};
