//! Wire protocols
//!
//! Binary XBee API framing for the radio link, and the `key>value` text
//! grammar shared by wired serial devices and radio application payloads.

pub mod error;
pub mod frame;
pub mod line;

pub use error::ProtocolError;
pub use frame::{Deframer, Frame, FrameKind, NodeAddress};
pub use line::DeviceLine;

/// Baud rate for every known device and the radio dongle
pub const BAUD_RATE: u32 = 921_600;

/// Bounded wait for an AT command response in milliseconds
pub const AT_TIMEOUT_MS: u64 = 2000;

/// Inter-record wait during node discovery before a scan is considered
/// complete, in milliseconds
pub const DISCOVERY_RECORD_TIMEOUT_MS: u64 = 2500;

/// Poll interval for coordinator-association checks and port scans,
/// in milliseconds
pub const POLL_INTERVAL_MS: u64 = 500;
