//! Configuration for the analytics pipeline and the `beacon` CLI.
//!
//! Settings are read from `.beacon/beacon.toml` in the project directory and
//! layered as file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [app]
//! name = "superapp"
//! version = "1.0.0"
//!
//! [backend]
//! base_url = "http://127.0.0.1:3030"
//! endpoint = "call"
//! timeout_secs = 10
//!
//! [batch]
//! flush_delay_ms = 5000
//!
//! [identity]
//! store = "file"
//! path = "/custom/storage.json"
//!
//! [experiments]
//! hash = "rolling"
//! track_exposures = true
//!
//! [logging]
//! level = "info"
//! json = false
//! ```
//!
//! | Variable                | Overrides                  |
//! |-------------------------|----------------------------|
//! | `BEACON_BACKEND_URL`    | `backend.base_url`         |
//! | `BEACON_STORAGE_PATH`   | `identity.path`            |
//! | `BEACON_FLUSH_DELAY_MS` | `batch.flush_delay_ms`     |
//! | `BEACON_LOG`            | `logging.level` (a filter) |

use crate::experiments::BucketingHash;
use crate::identity::FileStore;
use crate::transport::Endpoint;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backend used when neither the file nor the environment names one.
/// Baked in from `BEACON_BACKEND_URL` at build time when it is set.
pub const DEFAULT_BACKEND_URL: &str = match option_env!("BEACON_BACKEND_URL") {
    Some(url) => url,
    None => "http://127.0.0.1:3030",
};

pub const CONFIG_DIR: &str = ".beacon";
pub const CONFIG_FILE: &str = "beacon.toml";

pub const ENV_BACKEND_URL: &str = "BEACON_BACKEND_URL";
pub const ENV_STORAGE_PATH: &str = "BEACON_STORAGE_PATH";
pub const ENV_FLUSH_DELAY_MS: &str = "BEACON_FLUSH_DELAY_MS";
pub const ENV_LOG: &str = "BEACON_LOG";

const MAX_SENSIBLE_FLUSH_DELAY_MS: u64 = 60 * 60 * 1000;

/// Which key-value store backs the anonymous id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStoreKind {
    #[default]
    File,
    /// No persistence; a fresh id every process.
    Memory,
}

impl std::fmt::Display for IdentityStoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityStoreKind::File => write!(f, "file"),
            IdentityStoreKind::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for IdentityStoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(IdentityStoreKind::File),
            "memory" => Ok(IdentityStoreKind::Memory),
            _ => anyhow::bail!("Invalid identity store '{}'. Valid values: file, memory", s),
        }
    }
}

/// Host application metadata attached to every event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSection {
    /// Sent as `app_name` in the device context
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Sent as `app_version` in the device context
    #[serde(default = "default_app_version")]
    pub version: String,
}

fn default_app_name() -> String {
    "beacon".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            version: default_app_version(),
        }
    }
}

/// Telemetry backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSection {
    /// Base URL; the endpoint path is appended
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Route and body shape: `call` (tool envelope), `event` or `track`
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            endpoint: Endpoint::default(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Queue and debounce settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSection {
    /// Debounce window between the first queued event and the flush
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,
}

fn default_flush_delay_ms() -> u64 {
    5000
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            flush_delay_ms: default_flush_delay_ms(),
        }
    }
}

/// Where the anonymous id is kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySection {
    /// `file` persists across runs, `memory` lasts one process
    #[serde(default)]
    pub store: IdentityStoreKind,
    /// Storage file for `store = "file"` (default: platform data dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Experiment bucketing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentsSection {
    /// Bucketing function; changing it reassigns subjects
    #[serde(default)]
    pub hash: BucketingHash,
    /// Track `_experiment_exposure` the first time a subject is bucketed
    #[serde(default = "default_track_exposures")]
    pub track_exposures: bool,
}

fn default_track_exposures() -> bool {
    true
}

impl Default for ExperimentsSection {
    fn default() -> Self {
        Self {
            hash: BucketingHash::default(),
            track_exposures: default_track_exposures(),
        }
    }
}

/// Subscriber settings used by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive when `BEACON_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// One JSON object per line instead of text
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// The complete beacon.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BeaconToml {
    /// `[app]`: host application metadata
    #[serde(default)]
    pub app: AppSection,
    /// `[backend]`: where events are sent
    #[serde(default)]
    pub backend: BackendSection,
    /// `[batch]`: debounce window
    #[serde(default)]
    pub batch: BatchSection,
    /// `[identity]`: anonymous id storage
    #[serde(default)]
    pub identity: IdentitySection,
    /// `[experiments]`: bucketing
    #[serde(default)]
    pub experiments: ExperimentsSection,
    /// `[logging]`: subscriber defaults
    #[serde(default)]
    pub logging: LoggingSection,
}

impl BeaconToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse beacon.toml")
    }

    /// Load `<beacon_dir>/beacon.toml`, or defaults if it does not exist.
    pub fn load_or_default(beacon_dir: &Path) -> Result<Self> {
        let config_path = beacon_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize beacon.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Return human-readable warnings for suspicious values.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let url = &self.backend.base_url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            warnings.push(format!(
                "Invalid backend.base_url '{}': must start with http:// or https://",
                url
            ));
        }
        if self.backend.timeout_secs == 0 {
            warnings.push("backend.timeout_secs is 0: every request will time out".to_string());
        }
        if self.batch.flush_delay_ms > MAX_SENSIBLE_FLUSH_DELAY_MS {
            warnings.push(format!(
                "batch.flush_delay_ms = {} is over one hour; \
                 events may sit in memory for a long time",
                self.batch.flush_delay_ms
            ));
        }
        if self.app.name.trim().is_empty() {
            warnings.push("app.name is empty".to_string());
        }

        warnings
    }
}

/// Runtime configuration: beacon.toml plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct BeaconConfig {
    /// Root of the project (the CLI's `--project-dir`)
    pub project_dir: PathBuf,
    /// `<project_dir>/.beacon`
    pub beacon_dir: PathBuf,
    /// Parsed beacon.toml, or defaults when it is missing
    pub toml: BeaconToml,
    /// CLI override: verbose logging
    pub verbose: bool,
}

impl BeaconConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let beacon_dir = project_dir.join(CONFIG_DIR);
        let toml = BeaconToml::load_or_default(&beacon_dir)?;

        Ok(Self {
            project_dir,
            beacon_dir,
            toml,
            verbose: false,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.beacon_dir.join(CONFIG_FILE)
    }

    /// Backend base URL (env → file → build default).
    pub fn backend_url(&self) -> String {
        non_empty_env(ENV_BACKEND_URL).unwrap_or_else(|| self.toml.backend.base_url.clone())
    }

    pub fn endpoint(&self) -> Endpoint {
        self.toml.backend.endpoint
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.backend.timeout_secs)
    }

    /// Flush delay (env → file). An unparsable env value is ignored.
    pub fn flush_delay(&self) -> Duration {
        let ms = match non_empty_env(ENV_FLUSH_DELAY_MS) {
            Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
                tracing::warn!(value = %raw, "ignoring invalid {}", ENV_FLUSH_DELAY_MS);
                self.toml.batch.flush_delay_ms
            }),
            None => self.toml.batch.flush_delay_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn identity_store(&self) -> IdentityStoreKind {
        self.toml.identity.store
    }

    /// Storage file (env → file → platform data dir → `.beacon/storage.json`).
    pub fn storage_path(&self) -> PathBuf {
        non_empty_env(ENV_STORAGE_PATH)
            .map(PathBuf::from)
            .or_else(|| self.toml.identity.path.clone())
            .or_else(FileStore::default_path)
            .unwrap_or_else(|| self.beacon_dir.join("storage.json"))
    }

    pub fn bucketing_hash(&self) -> BucketingHash {
        self.toml.experiments.hash
    }

    pub fn track_exposures(&self) -> bool {
        self.toml.experiments.track_exposures
    }

    /// Filter directive for the subscriber (env → `--verbose` → file).
    pub fn log_filter(&self) -> String {
        non_empty_env(ENV_LOG).unwrap_or_else(|| {
            if self.verbose {
                "debug".to_string()
            } else {
                self.toml.logging.level.clone()
            }
        })
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
