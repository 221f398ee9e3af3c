//! Subscriber setup for binaries embedding beacon.
//!
//! The library only emits `tracing` events; it never installs a subscriber
//! on its own. Call [`init`] once at startup.

use crate::config::{BeaconConfig, LoggingSection};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `beacon=debug,reqwest=warn`
    pub filter: String,
    /// Emit one JSON object per line instead of human-readable text
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl From<&LoggingSection> for LogConfig {
    fn from(section: &LoggingSection) -> Self {
        Self {
            filter: section.level.clone(),
            json: section.json,
        }
    }
}

impl LogConfig {
    /// Filter and format from a resolved config (`BEACON_LOG` and `--verbose` included).
    pub fn from_config(config: &BeaconConfig) -> Self {
        Self {
            filter: config.log_filter(),
            json: config.toml.logging.json,
        }
    }

    /// Falls back to `info` when the directive does not parse.
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.filter).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install a stderr fmt subscriber. Returns `false` if one was already set.
pub fn init(config: &LogConfig) -> bool {
    let layer = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).with_target(false).boxed()
    };

    tracing_subscriber::registry()
        .with(config.env_filter())
        .with(layer)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_filter_falls_back() {
        let config = LogConfig {
            filter: "beacon=notalevel".to_string(),
            json: false,
        };
        assert_eq!(config.env_filter().to_string(), "info");
    }

    #[test]
    fn test_from_logging_section() {
        let section = LoggingSection {
            level: "warn".to_string(),
            json: true,
        };
        let config = LogConfig::from(&section);
        assert_eq!(config.filter, "warn");
        assert!(config.json);
    }

    #[test]
    fn test_second_init_is_harmless() {
        let config = LogConfig::default();
        let _ = init(&config);
        assert!(!init(&config));
    }
}
