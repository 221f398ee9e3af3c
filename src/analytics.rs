//! The `Analytics` handle: identity, batching, lifecycle and experiments
//! behind one cloneable value.
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use beacon::{Analytics, AppState, props};
//!
//! let analytics = Analytics::builder().build()?;
//! analytics.track("app_open", props! { "cold_start" => true });
//! analytics.on_navigation("home").await;
//! let copy = analytics.variant("paywall_copy", &["A", "B"])?;
//! analytics.on_app_state_change(AppState::Background).await;
//! analytics.shutdown().await;
//! # let _ = copy;
//! # Ok(())
//! # }
//! ```

use crate::batcher::{Batcher, BatcherStats, DEFAULT_FLUSH_DELAY, FlushReport};
use crate::config::{BeaconConfig, DEFAULT_BACKEND_URL, IdentityStoreKind};
use crate::errors::ExperimentError;
use crate::event::{DeviceContext, EXPOSURE_EVENT, Enricher, Event, Properties};
use crate::experiments::BucketingHash;
use crate::identity::{FileStore, IdentityResolver, IdentitySource, KeyValueStore, MemoryStore};
use crate::lifecycle::{AppState, ScreenTracker};
use crate::transport::{Endpoint, HttpTransport, Transport};
use anyhow::Result;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Reported `(experiment, subject)` pairs kept before the set is reset.
const MAX_REMEMBERED_EXPOSURES: usize = 4096;

/// Configures and builds an [`Analytics`] handle.
///
/// Unset parts default to: HTTP transport to the default backend, a file
/// store in the platform data directory, and a device context for this crate.
pub struct AnalyticsBuilder {
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn KeyValueStore>>,
    context: Option<DeviceContext>,
    flush_delay: Duration,
    hash: BucketingHash,
    track_exposures: bool,
}

impl Default for AnalyticsBuilder {
    fn default() -> Self {
        Self {
            transport: None,
            store: None,
            context: None,
            flush_delay: DEFAULT_FLUSH_DELAY,
            hash: BucketingHash::default(),
            track_exposures: true,
        }
    }
}

impl AnalyticsBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn context(mut self, context: DeviceContext) -> Self {
        self.context = Some(context);
        self
    }

    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    pub fn hash(mut self, hash: BucketingHash) -> Self {
        self.hash = hash;
        self
    }

    pub fn track_exposures(mut self, enabled: bool) -> Self {
        self.track_exposures = enabled;
        self
    }

    pub fn build(self) -> Result<Analytics> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::new(
                DEFAULT_BACKEND_URL,
                Endpoint::default(),
                DEFAULT_REQUEST_TIMEOUT,
            )?),
        };
        let store = self.store.unwrap_or_else(default_store);
        let context = self.context.unwrap_or_else(|| {
            DeviceContext::detect(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        });

        let identity = Arc::new(IdentityResolver::new(store));
        let enricher = Arc::new(Enricher::new(context, identity));
        let batcher = Batcher::new(transport, enricher.clone(), self.flush_delay);

        Ok(Analytics {
            inner: Arc::new(Inner {
                batcher,
                enricher,
                screens: ScreenTracker::new(),
                hash: self.hash,
                track_exposures: self.track_exposures,
                exposures: Mutex::new(HashSet::new()),
            }),
        })
    }
}

fn default_store() -> Arc<dyn KeyValueStore> {
    match FileStore::default_path() {
        Some(path) => Arc::new(FileStore::new(path)),
        None => {
            tracing::warn!("no platform data directory, anonymous id will not persist");
            Arc::new(MemoryStore::new())
        }
    }
}

struct Inner {
    batcher: Batcher,
    enricher: Arc<Enricher>,
    screens: ScreenTracker,
    hash: BucketingHash,
    track_exposures: bool,
    /// `(experiment, subject)` pairs already reported. Cleared on
    /// `reset_user` and when it reaches [`MAX_REMEMBERED_EXPOSURES`].
    exposures: Mutex<HashSet<(String, String)>>,
}

/// Cloneable analytics handle. Clones share one queue and one identity.
#[derive(Clone)]
pub struct Analytics {
    inner: Arc<Inner>,
}

impl Analytics {
    pub fn builder() -> AnalyticsBuilder {
        AnalyticsBuilder::default()
    }

    /// Build from a resolved configuration.
    pub fn from_config(config: &BeaconConfig) -> Result<Self> {
        let transport = HttpTransport::new(
            &config.backend_url(),
            config.endpoint(),
            config.request_timeout(),
        )?;
        let store: Arc<dyn KeyValueStore> = match config.identity_store() {
            IdentityStoreKind::File => Arc::new(FileStore::new(config.storage_path())),
            IdentityStoreKind::Memory => Arc::new(MemoryStore::new()),
        };
        let app = &config.toml.app;

        Self::builder()
            .transport(Arc::new(transport))
            .store(store)
            .context(DeviceContext::detect(app.name.clone(), app.version.clone()))
            .flush_delay(config.flush_delay())
            .hash(config.bucketing_hash())
            .track_exposures(config.track_exposures())
            .build()
    }

    /// Queue an event. Never fails.
    pub fn track(&self, name: impl Into<String>, properties: Properties) {
        self.inner.batcher.track(Event::new(name, properties));
    }

    pub async fn flush(&self) -> FlushReport {
        self.inner.batcher.flush().await
    }

    /// Leaving the foreground flushes immediately and cancels the pending timer.
    pub async fn on_app_state_change(&self, state: AppState) -> Option<FlushReport> {
        if !state.should_flush() {
            return None;
        }
        tracing::debug!(%state, "app left foreground, flushing");
        Some(self.inner.batcher.flush().await)
    }

    /// Report the active screen.
    ///
    /// A change of screen queues a `_screen` event and flushes immediately,
    /// cancelling the pending timer. Returns `None` when the screen is
    /// unchanged and nothing was sent.
    pub async fn on_navigation(&self, screen: &str) -> Option<FlushReport> {
        let event = self.inner.screens.navigate(screen)?;
        self.inner.batcher.track(event);
        tracing::debug!(screen, "screen changed, flushing");
        Some(self.inner.batcher.flush().await)
    }

    pub fn current_screen(&self) -> Option<String> {
        self.inner.screens.current()
    }

    /// Bucket the current subject into `experiment`.
    ///
    /// The first assignment per experiment and subject also tracks an
    /// `_experiment_exposure` event, unless exposures are disabled.
    pub fn variant<S: AsRef<str>>(
        &self,
        experiment: &str,
        variants: &[S],
    ) -> Result<String, ExperimentError> {
        let subject = self.subject_id();
        let variant = self.inner.hash.assign(&subject, experiment, variants)?.to_string();

        if self.inner.track_exposures && self.first_exposure(experiment, &subject) {
            let mut properties = Properties::new();
            properties.insert("experiment".into(), Value::from(experiment));
            properties.insert("variant".into(), Value::from(variant.as_str()));
            properties.insert("hash".into(), Value::from(self.inner.hash.to_string()));
            self.inner.batcher.track(Event::new(EXPOSURE_EVENT, properties));
        }
        Ok(variant)
    }

    fn first_exposure(&self, experiment: &str, subject: &str) -> bool {
        let mut seen = self.lock_exposures();
        if seen.len() >= MAX_REMEMBERED_EXPOSURES {
            seen.clear();
        }
        seen.insert((experiment.to_string(), subject.to_string()))
    }

    fn lock_exposures(&self) -> MutexGuard<'_, HashSet<(String, String)>> {
        self.inner
            .exposures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn bucketing_hash(&self) -> BucketingHash {
        self.inner.hash
    }

    pub fn identify(&self, user_id: impl Into<String>) {
        self.inner.enricher.identity().identify(user_id);
    }

    /// Forget the authenticated user and the exposures reported so far.
    pub fn reset_user(&self) {
        self.inner.enricher.identity().reset_user();
        self.lock_exposures().clear();
    }

    pub fn set_user_properties(&self, properties: Properties) {
        self.inner.enricher.set_user_properties(properties);
    }

    pub fn clear_user_properties(&self) {
        self.inner.enricher.clear_user_properties();
    }

    pub fn user_properties(&self) -> Properties {
        self.inner.enricher.user_properties()
    }

    pub fn anonymous_id(&self) -> String {
        self.inner.enricher.identity().anonymous_id()
    }

    pub fn identity_source(&self) -> IdentitySource {
        self.inner.enricher.identity().source()
    }

    pub fn subject_id(&self) -> String {
        self.inner.enricher.identity().subject_id()
    }

    /// Flush what is queued and stop accepting events.
    pub async fn shutdown(&self) -> FlushReport {
        self.inner.batcher.shutdown().await
    }

    pub fn pending(&self) -> usize {
        self.inner.batcher.pending()
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.inner.batcher.is_flush_scheduled()
    }

    pub fn stats(&self) -> BatcherStats {
        self.inner.batcher.stats()
    }
}
