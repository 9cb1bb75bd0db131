//! UI boundary message types
//!
//! The UI consumes and produces 4-tuples `(device_type, port_or_node_id,
//! key, value)` with the textual wire shape `device,port>key>value` — the
//! same shape in both directions.

use std::fmt;
use std::str::FromStr;

/// One message crossing the UI boundary, either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiMessage {
    /// Device-type label (`sDRT`, `wVOG`, ...) or `all`
    pub device: String,
    /// Port name / node instance id, or `all`
    pub port: String,
    /// Command or event key
    pub key: String,
    /// Value; may be empty
    pub value: String,
}

impl UiMessage {
    /// Build a message from parts
    pub fn new(
        device: impl Into<String>,
        port: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            port: port.into(),
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for UiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{}>{}>{}",
            self.device, self.port, self.key, self.value
        )
    }
}

/// Parse failure for the textual UI message shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiMessageParseError(pub String);

impl fmt::Display for UiMessageParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unparseable ui message: {:?}", self.0)
    }
}

impl std::error::Error for UiMessageParseError {}

impl FromStr for UiMessage {
    type Err = UiMessageParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let err = || UiMessageParseError(raw.to_string());
        let (addr, rest) = raw.split_once('>').ok_or_else(err)?;
        let (device, port) = addr.split_once(',').ok_or_else(err)?;
        // The value may itself contain `>` (config echoes never do, but
        // passthrough payloads might); split only once more.
        let (key, value) = match rest.split_once('>') {
            Some((k, v)) => (k, v),
            None => (rest, ""),
        };
        if device.is_empty() || port.is_empty() || key.is_empty() {
            return Err(err());
        }
        Ok(UiMessage::new(device, port, key, value))
    }
}

/// Roster change for one device type, emitted by both the serial scanner
/// path and the radio network directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicesChanged {
    /// Device-type label, e.g. `wDRT`
    pub device_type: String,
    /// All currently known port names / node instance ids for that type
    pub ids: Vec<String>,
}
