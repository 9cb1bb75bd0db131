//! Transport channel seam
//!
//! Abstraction over the raw byte transports so the radio link and device
//! sessions run against a real serial port in production and an in-memory
//! duplex in tests.

use tokio::io::{AsyncRead, AsyncWrite};

/// Any async byte channel a transport can own
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Channel for T where T: AsyncRead + AsyncWrite + Send + Unpin {}
