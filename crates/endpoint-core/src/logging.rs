//! Logging for processes hosting the endpoint manager
//!
//! The `[logging]` table of the endpoint configuration file selects the
//! filter and output format:
//!
//! ```toml
//! [logging]
//! filter = "rvoip_endpoint_core=debug,warn"
//! format = "json"
//! ```
//!
//! `RUST_LOG`, when set, takes precedence over the configured filter.

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{EndpointError, EndpointResult};

/// Output format of the fmt subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human readable
    Full,
    /// One line per event
    #[default]
    Compact,
    /// One JSON object per event, for log shippers
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives
    pub filter: String,
    pub format: LogFormat,
    /// Include file and line of each event
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::default(),
            source_location: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Parse the configured filter
    pub fn env_filter(&self) -> EndpointResult<EnvFilter> {
        EnvFilter::try_new(&self.filter)
            .map_err(|e| EndpointError::config(format!("invalid log filter {:?}: {}", self.filter, e)))
    }
}

/// Install the global subscriber; fails if one is already installed
pub fn setup_logging(config: &LoggingConfig) -> EndpointResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => config.env_filter()?,
    };
    let builder = fmt()
        .with_env_filter(filter)
        .with_file(config.source_location)
        .with_line_number(config.source_location);

    let installed = match config.format {
        LogFormat::Full => builder.try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| EndpointError::config(format!("logging already initialized: {}", e)))?;

    info!(version = crate::VERSION, format = ?config.format, "SIP endpoint logging ready");
    Ok(())
}
