pub mod protocol;
pub mod socket;

pub use protocol::{ChatOffer, DccMessage, Reject, ResumeMessage, SendOffer};
pub use socket::PortAllocator;
