//! Client-side product analytics.
//!
//! - [`identity`] keeps a stable anonymous id per device
//! - [`batcher`] queues events and flushes them on a debounce timer
//! - [`experiments`] buckets subjects into experiment variants
//! - [`analytics`] ties them together behind the [`Analytics`] handle
//!
//! [`collector`] is a local stand-in for the telemetry backend.

pub mod analytics;
pub mod batcher;
pub mod collector;
pub mod config;
pub mod errors;
pub mod event;
pub mod experiments;
pub mod identity;
pub mod lifecycle;
pub mod logging;
pub mod transport;

pub use analytics::{Analytics, AnalyticsBuilder};
pub use batcher::{BatcherStats, FlushReport};
pub use errors::{ExperimentError, StorageError, TransportError};
pub use event::{DeviceContext, Properties};
pub use experiments::{BucketingHash, assign_variant};
pub use identity::{FileStore, IdentitySource, KeyValueStore, MemoryStore};
pub use lifecycle::AppState;
pub use transport::{Endpoint, HttpTransport, Transport};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
