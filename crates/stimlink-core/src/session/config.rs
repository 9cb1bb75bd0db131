//! Per-device configuration mapping
//!
//! Every device type carries a fixed configuration template. The live
//! mapping must always contain every template key; if a key goes missing or
//! empty the whole mapping self-heals back to the template defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::line::{format_config_pairs, parse_config_pairs};
use crate::session::DeviceProfile;

/// Ordered key/value configuration for one device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    profile: DeviceProfile,
    values: BTreeMap<String, String>,
}

impl DeviceConfig {
    /// Template defaults for the given profile
    pub fn new(profile: DeviceProfile) -> Self {
        let mut config = Self {
            profile,
            values: BTreeMap::new(),
        };
        config.reset_to_template();
        config
    }

    fn reset_to_template(&mut self) {
        self.values = self
            .profile
            .config_template()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
    }

    /// Restore template defaults if any template key is missing or empty
    pub fn heal(&mut self) {
        let broken = self
            .profile
            .config_template()
            .iter()
            .any(|(k, _)| self.values.get(*k).map(String::as_str).unwrap_or("") == "");
        if broken {
            warn!(
                profile = self.profile.label(),
                "config missing template keys, resetting to defaults"
            );
            self.reset_to_template();
        }
    }

    /// Apply a `k:v,k:v` update payload. Keys outside the template are
    /// ignored, not errors. Self-heals afterwards.
    pub fn update_from_str(&mut self, payload: &str) {
        for (key, value) in parse_config_pairs(payload) {
            if self.values.contains_key(&key) {
                self.values.insert(key, value);
            } else {
                warn!(key, "ignoring unknown config key");
            }
        }
        self.heal();
    }

    /// Current value for a key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Current value parsed as milliseconds, falling back to the template
    /// default when unparsable
    pub fn get_ms(&self, key: &str) -> u64 {
        let template_default = || {
            self.profile
                .config_template()
                .iter()
                .find(|(k, _)| *k == key)
                .and_then(|(_, v)| v.parse().ok())
                .unwrap_or(0)
        };
        match self.get(key).map(str::parse) {
            Some(Ok(ms)) => ms,
            _ => template_default(),
        }
    }

    /// Full configuration in the `k:v,k:v` wire form
    pub fn to_line(&self) -> String {
        format_config_pairs(self.values.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Number of keys currently held
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when no keys are held (never the case after healing)
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn remove_for_test(&mut self, key: &str) {
        self.values.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_template_populated_on_creation() {
        let config = DeviceConfig::new(DeviceProfile::Drt);
        assert_eq!(config.get("ONTM"), Some("1000"));
        assert_eq!(config.get("DBNC"), Some("100"));
        assert_eq!(config.get("ISIH"), Some("5000"));
        assert_eq!(config.get("ISIL"), Some("3000"));
        assert_eq!(config.get("SPCT"), Some("100"));
    }

    #[test]
    fn test_self_heal_restores_missing_key() {
        let mut config = DeviceConfig::new(DeviceProfile::Drt);
        config.update_from_str("ONTM:500");
        config.remove_for_test("ISIL");
        config.heal();
        assert_eq!(config.len(), 5);
        assert_eq!(config.get("ISIL"), Some("3000"));
        // A full reset also drops the earlier update.
        assert_eq!(config.get("ONTM"), Some("1000"));
    }

    #[test]
    fn test_update_ignores_unknown_keys() {
        let mut config = DeviceConfig::new(DeviceProfile::Drt);
        config.update_from_str("ONTM:500,BOGUS:1,DBNC:50");
        assert_eq!(config.get("ONTM"), Some("500"));
        assert_eq!(config.get("DBNC"), Some("50"));
        assert_eq!(config.get("BOGUS"), None);
        assert_eq!(config.len(), 5);
    }

    #[test]
    fn test_get_ms_falls_back_on_garbage() {
        let mut config = DeviceConfig::new(DeviceProfile::Wvog);
        config.update_from_str("cls:not-a-number");
        assert_eq!(config.get_ms("cls"), 1500);
        assert_eq!(config.get_ms("opn"), 1500);
    }
}
