//! The `key>value` device command grammar
//!
//! Both transports speak newline-terminated UTF-8 text lines: a key,
//! optionally followed by `>` and a value. Some firmware revisions emit `|`
//! as the separator; both are accepted inbound. Config payloads are
//! comma-joined `key:value` pairs with no trailing comma.

/// One parsed command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLine {
    /// Command key, e.g. `set_cfg`
    pub key: String,
    /// Value after the separator; empty when the separator is absent
    pub value: String,
}

impl DeviceLine {
    /// Build a line from parts
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Parse a raw line. Returns `None` for blank input; a missing
    /// separator means an empty value.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let (key, value) = match raw.find(['>', '|']) {
            Some(pos) => (&raw[..pos], &raw[pos + 1..]),
            None => (raw, ""),
        };
        if key.is_empty() {
            return None;
        }
        Some(Self::new(key, value))
    }

    /// Wire form including the trailing newline
    pub fn to_wire(&self) -> String {
        format!("{}>{}\n", self.key, self.value)
    }
}

/// Split a `k:v,k:v` config payload into pairs. Entries without a colon or
/// with an empty key are skipped; transport noise is expected.
pub fn parse_config_pairs(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter_map(|entry| {
            let (k, v) = entry.split_once(':')?;
            let k = k.trim();
            if k.is_empty() {
                return None;
            }
            Some((k.to_string(), v.trim().to_string()))
        })
        .collect()
}

/// Join config pairs into the `k:v,k:v` wire form, no trailing comma
pub fn format_config_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect::<Vec<_>>()
        .join(",")
}
