//! Radio dongle link and the discovered-node directory.

pub mod directory;
pub mod link;

pub use directory::{NetworkDirectory, RemoteNode};
pub use link::{Destination, InboundMessage, LinkState, NdRecord, RadioHandles, RadioLink};
