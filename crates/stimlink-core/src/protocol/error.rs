//! Protocol errors

use thiserror::Error;

/// Errors that can occur on the radio link or device transports
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Bad start byte, length mismatch, or checksum failure. The caller
    /// discards the frame and resynchronizes on the next delimiter.
    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    /// An AT command went unanswered within the bounded wait.
    #[error("AT command timed out")]
    Timeout,

    /// Transmit attempted before the destination address resolved.
    #[error("radio link not ready")]
    NotReady,

    /// The transport is gone; pending operations fail fast.
    #[error("radio link closed")]
    LinkClosed,

    /// Discovery returned a node id that does not match the
    /// `prefix[_ ]digits` pattern. The node is ignored, not fatal.
    #[error("unparseable node id: {0:?}")]
    UnparseableNodeId(String),

    /// A TransmitStatus frame reported a non-zero delivery status.
    #[error("remote delivery failed with status {0:#04x}")]
    DeliveryFailed(u8),

    /// Serial port open/read/write failure.
    #[error("serial port error: {0}")]
    Serial(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
