//! Endpoint manager configuration
//!
//! All timing constants used by registration, keep-alive probing, connectivity
//! debouncing and WiFi scanning live here so deployments can tune them from a
//! TOML file. Its `[logging]` table configures [`setup_logging`](crate::logging::setup_logging).
//!
//! ```rust
//! use rvoip_endpoint_core::config::EndpointConfig;
//!
//! let config = EndpointConfig::from_toml_str(r#"
//!     wifi_only = true
//!     connectivity_debounce_ms = 500
//! "#).unwrap();
//!
//! assert!(config.wifi_only);
//! assert_eq!(config.registration_expiry_secs, 3600);
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EndpointError, EndpointResult};
use crate::logging::LoggingConfig;

/// Caller id of the telephony process, allowed to act on any profile
pub const PHONE_CALLER_ID: u32 = 1001;

/// Configuration for [`EndpointManager`](crate::EndpointManager)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Expiry requested in every REGISTER
    pub registration_expiry_secs: u32,
    /// Backoff unit and smallest distinguishable keep-alive step
    pub short_expiry_secs: u32,
    /// Safety margin subtracted from the granted expiry before refreshing
    pub min_expiry_secs: u32,
    /// Keep-alive interval used until one has been measured
    pub default_keep_alive_interval_secs: u32,
    /// Upper bound for the registration retry delay
    pub max_backoff_secs: u32,
    /// Lower bound of the keep-alive interval search
    pub keep_alive_min_interval_secs: u32,
    /// Upper bound of the keep-alive interval search
    pub keep_alive_max_interval_secs: u32,
    /// Consecutive unchanged-port responses needed to accept an interval
    pub keep_alive_pass_threshold: u32,
    /// Delay before a "connected" notification is acted upon
    pub connectivity_debounce_ms: u64,
    /// Period of WiFi scans while waiting for a connection
    pub wifi_scan_interval_secs: u32,
    /// Ignore every network type but WiFi
    pub wifi_only: bool,
    /// Caller id allowed to access every profile
    pub privileged_caller: u32,
    /// Consecutive zero-duration registrations answered by an immediate retry
    pub max_immediate_refreshes: u32,
    /// Where [`UdpRouteResolver::from_config`](crate::UdpRouteResolver::from_config) routes towards to find the local address
    pub route_probe_addr: SocketAddr,
    pub logging: LoggingConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            registration_expiry_secs: 3600,
            short_expiry_secs: 10,
            min_expiry_secs: 60,
            default_keep_alive_interval_secs: 10,
            max_backoff_secs: 3600,
            keep_alive_min_interval_secs: 10,
            keep_alive_max_interval_secs: 120,
            keep_alive_pass_threshold: 10,
            connectivity_debounce_ms: 2000,
            wifi_scan_interval_secs: 60,
            wifi_only: false,
            privileged_caller: PHONE_CALLER_ID,
            max_immediate_refreshes: 3,
            route_probe_addr: SocketAddr::from(([192, 168, 1, 1], 80)),
            logging: LoggingConfig::default(),
        }
    }
}

impl EndpointConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> EndpointResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| EndpointError::config(format!("invalid endpoint config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> EndpointResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            EndpointError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Enable WiFi-only mode
    pub fn with_wifi_only(mut self, wifi_only: bool) -> Self {
        self.wifi_only = wifi_only;
        self
    }

    /// Set the privileged caller id
    pub fn with_privileged_caller(mut self, caller: u32) -> Self {
        self.privileged_caller = caller;
        self
    }

    /// Check the relations between the settings
    pub fn validate(&self) -> EndpointResult<()> {
        if self.short_expiry_secs == 0 {
            return Err(EndpointError::config("short_expiry_secs must be positive"));
        }
        if self.min_expiry_secs == 0 || self.min_expiry_secs > self.registration_expiry_secs {
            return Err(EndpointError::config(
                "min_expiry_secs must be positive and not exceed registration_expiry_secs",
            ));
        }
        if self.keep_alive_min_interval_secs == 0
            || self.keep_alive_min_interval_secs >= self.keep_alive_max_interval_secs
        {
            return Err(EndpointError::config(
                "keep-alive search bounds must satisfy 0 < min < max",
            ));
        }
        if self.keep_alive_pass_threshold == 0 {
            return Err(EndpointError::config("keep_alive_pass_threshold must be positive"));
        }
        if self.default_keep_alive_interval_secs == 0 {
            return Err(EndpointError::config(
                "default_keep_alive_interval_secs must be positive",
            ));
        }
        if self.max_backoff_secs < self.short_expiry_secs {
            return Err(EndpointError::config(
                "max_backoff_secs must be at least short_expiry_secs",
            ));
        }
        if self.wifi_scan_interval_secs == 0 {
            return Err(EndpointError::config("wifi_scan_interval_secs must be positive"));
        }
        self.logging.env_filter()?;
        Ok(())
    }

    pub(crate) fn connectivity_debounce(&self) -> Duration {
        Duration::from_millis(self.connectivity_debounce_ms)
    }

    pub(crate) fn wifi_scan_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.wifi_scan_interval_secs))
    }
}
