pub mod settings;

pub use settings::{NetworkSettings, PortRange, Settings, TransferSettings};
