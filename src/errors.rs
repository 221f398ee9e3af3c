//! Typed error hierarchy for the analytics pipeline.
//!
//! Three enums cover the three failure domains:
//! - `TransportError` — a single event send to the telemetry backend
//! - `StorageError` — the key-value store that persists the anonymous id
//! - `ExperimentError` — invalid bucketing input
//!
//! None of these ever reach a caller of `track()` or `flush()`; the batcher
//! and identity resolver log and absorb them.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from sending one event to the backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("Backend at {url} responded with status {status}")]
    Status { status: u16, url: String },

    #[error("Failed to encode event payload: {0}")]
    Encode(#[source] serde_json::Error),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => TransportError::Status {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => TransportError::Http(err),
        }
    }
}

/// Errors from the local key-value store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage file at {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to lock storage file at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage lock poisoned")]
    Poisoned,
}

/// Errors from experiment bucketing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExperimentError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}
