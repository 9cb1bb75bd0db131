//! Host-side coordination core for experiment response devices.
//!
//! Discovers DRT (detection response task) and VOG (visual occlusion
//! goggle) units over USB serial and an XBee radio dongle, runs one
//! protocol session per device, and multiplexes everything through a
//! single [`router::Router`] that a UI drives with `device,port>key>value`
//! commands. Completed trials land in a [`results::ResultsSink`].

#![warn(missing_docs)]

pub mod channel;
pub mod events;
pub mod protocol;
pub mod radio;
pub mod results;
pub mod router;
pub mod scanner;
pub mod session;

/// Crate version, surfaced to UIs for display
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commonly used types for embedding the core in a host application
pub mod prelude {
    pub use crate::events::{DevicesChanged, UiMessage};
    pub use crate::results::{FileSink, MemorySink, ResultRecord, ResultsSink};
    pub use crate::router::{Router, RouterEvent};
    pub use crate::scanner::ScannerEvent;
    pub use crate::session::{DeviceProfile, SessionHandle};
}
