// ble-central Source Code File
//
// Copyright 2026 ble-central contributors. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Tunables for an [`Adapter`](crate::Adapter).

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
#[cfg(feature = "serde")]
use serde_cr as serde;
use std::time::Duration;

/// Settings an [`Adapter`](crate::Adapter) is created with. With the `serde` feature enabled
/// this can be loaded from any serde format; missing fields take their default.
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_cr", default)
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Ask the radio to report every advertisement instead of the first one per peripheral.
    /// Needed to track RSSI, and to see a peripheral again after it disconnected.
    pub allow_duplicates: bool,
    /// Drop advertisements from peripherals that do not advertise a name.
    pub require_name: bool,
    /// Scan duration used by [`Adapter::scan_and_collect`](crate::Adapter::scan_and_collect).
    pub default_scan_timeout: Duration,
    /// Deadline for every GATT operation issued through a [`Device`](crate::Device).
    pub operation_timeout: Option<Duration>,
    /// Capacity of each device's event broadcast channel.
    pub event_capacity: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig {
            allow_duplicates: true,
            require_name: true,
            default_scan_timeout: Duration::from_secs(10),
            operation_timeout: None,
            event_capacity: 16,
        }
    }
}

impl AdapterConfig {
    pub fn with_allow_duplicates(mut self, allow: bool) -> Self {
        self.allow_duplicates = allow;
        self
    }

    pub fn with_require_name(mut self, require: bool) -> Self {
        self.require_name = require;
        self
    }

    pub fn with_default_scan_timeout(mut self, timeout: Duration) -> Self {
        self.default_scan_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        // tokio's broadcast channel panics on zero capacity.
        self.event_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = AdapterConfig::default();
        assert!(config.allow_duplicates);
        assert!(config.require_name);
        assert_eq!(config.default_scan_timeout, Duration::from_secs(10));
        assert_eq!(config.operation_timeout, None);
    }

    #[test]
    fn builder() {
        let config = AdapterConfig::default()
            .with_require_name(false)
            .with_operation_timeout(Duration::from_secs(2))
            .with_event_capacity(0);
        assert!(!config.require_name);
        assert_eq!(config.operation_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.event_capacity, 1);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn partial_toml() {
        let config: AdapterConfig = toml::from_str(
            r#"
            require_name = false
            default_scan_timeout = { secs = 3, nanos = 0 }
            "#,
        )
        .unwrap();
        assert!(!config.require_name);
        assert!(config.allow_duplicates);
        assert_eq!(config.default_scan_timeout, Duration::from_secs(3));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn json_round_trip() {
        let config = AdapterConfig::default().with_operation_timeout(Duration::from_millis(500));
        let json = serde_json::to_string(&config).unwrap();
        let back: AdapterConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
