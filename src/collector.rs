//! Local telemetry collector for development and tests.
//!
//! Accepts the same requests [`HttpTransport`](crate::transport::HttpTransport)
//! sends and keeps them in memory, optionally appending each one to a JSON
//! lines log file.
//!
//! | Route          | Body                                     |
//! |----------------|------------------------------------------|
//! | `GET /health`  |                                          |
//! | `POST /call`   | `{"tool":"trackEvent","input":{..},"userId"}` |
//! | `POST /event`  | `{"event","properties","userId"}`        |
//! | `POST /track`  | `{"event","properties","userId"}`        |
//! | `GET /events`  | returns the buffered events              |
//!
//! Events are kept in a bounded ring buffer (default [`DEFAULT_MAX_EVENTS`]);
//! when it is full the oldest event is dropped.
//!
//! ```no_run
//! use beacon::collector::CollectorServer;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut server = CollectorServer::new();
//! let url = server.start_local().await?;
//! // point a transport at `url` ...
//! let events = server.drain_events().await;
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::event::{OutgoingEvent, Properties};
use crate::transport::{Endpoint, TRACK_TOOL, ToolCall};
use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, oneshot};

/// Ring buffer capacity unless set with [`CollectorServer::with_max_events`].
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

/// An event as received by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedEvent {
    /// Event name
    pub event: String,
    /// Enriched properties as sent by the client
    pub properties: Properties,
    /// Subject id from the envelope
    #[serde(rename = "userId")]
    pub user_id: String,
    /// Route it arrived on
    pub endpoint: Endpoint,
    /// Server clock at acceptance
    pub received_at: DateTime<Utc>,
}

impl ReceivedEvent {
    fn new(event: String, properties: Properties, user_id: String, endpoint: Endpoint) -> Self {
        Self {
            event,
            properties,
            user_id,
            endpoint,
            received_at: Utc::now(),
        }
    }
}

/// Buffered events and server status.
#[derive(Debug)]
pub(crate) struct CollectorState {
    /// Oldest first
    pub(crate) events: VecDeque<ReceivedEvent>,
    /// Set by `start`, cleared by `stop`
    pub(crate) running: bool,
    /// Ring buffer capacity
    pub(crate) max_events: usize,
    /// Accepted since start, including events since dropped from the buffer
    pub(crate) total_received: u64,
}

impl Default for CollectorState {
    fn default() -> Self {
        Self {
            events: VecDeque::new(),
            running: false,
            max_events: DEFAULT_MAX_EVENTS,
            total_received: 0,
        }
    }
}

impl CollectorState {
    fn push_event(&mut self, event: ReceivedEvent) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
        self.total_received += 1;
    }
}

/// State shared by the handlers.
pub(crate) struct Shared {
    pub(crate) state: RwLock<CollectorState>,
    log: Option<LogFile>,
}

struct LogFile {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl Shared {
    async fn record(&self, event: ReceivedEvent) {
        tracing::debug!(
            event = %event.event,
            user_id = %event.user_id,
            endpoint = %event.endpoint,
            "received event"
        );
        if let Some(log) = &self.log {
            log.append(&event).await;
        }
        self.state.write().await.push_event(event);
    }
}

impl LogFile {
    async fn append(&self, event: &ReceivedEvent) {
        let mut line = match serde_json::to_vec(event) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "could not encode event for the log file");
                return;
            }
        };
        line.push(b'\n');

        let mut file = self.file.lock().await;
        let written = async {
            file.write_all(&line).await?;
            file.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "could not append to event log"
            );
        }
    }
}

/// HTTP server that plays the telemetry backend.
pub struct CollectorServer {
    pub(crate) shared: Arc<Shared>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    addr: Option<SocketAddr>,
}

impl Default for CollectorServer {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorServer {
    pub fn new() -> Self {
        Self::with_parts(CollectorState::default(), None)
    }

    /// Keep at most `max_events` buffered events.
    pub fn with_max_events(max_events: usize) -> Self {
        Self::with_parts(
            CollectorState {
                max_events: max_events.max(1),
                ..CollectorState::default()
            },
            None,
        )
    }

    /// Also append every accepted event to `path` as one JSON line.
    pub fn with_log_file(self, path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory: {}", parent.display()))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open event log: {}", path.display()))?;

        let shared = Arc::try_unwrap(self.shared)
            .map_err(|_| anyhow::anyhow!("Cannot attach a log file to a running collector"))?;
        let state = shared.state.into_inner();
        let log = LogFile {
            path: path.to_path_buf(),
            file: Mutex::new(tokio::fs::File::from_std(file)),
        };
        Ok(Self::with_parts(state, Some(log)))
    }

    fn with_parts(state: CollectorState, log: Option<LogFile>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(state),
                log,
            }),
            shutdown_tx: None,
            addr: None,
        }
    }

    /// Bind to a dynamic port on localhost. Returns the base URL.
    pub async fn start_local(&mut self) -> Result<String> {
        self.start(SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    /// Bind to `addr` and serve in a background task. Returns the base URL.
    pub async fn start(&mut self, addr: SocketAddr) -> Result<String> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind collector to {}", addr))?;

        let addr = listener
            .local_addr()
            .context("Failed to get collector address")?;
        self.addr = Some(addr);

        self.shared.state.write().await.running = true;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let app = build_router(self.shared.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %e, "collector server error");
            }
        });

        let url = format!("http://{}", addr);
        tracing::info!(%url, "collector listening");
        Ok(url)
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.shared.state.write().await.running = false;
        if let Some(addr) = self.addr.take() {
            tracing::info!(%addr, "collector stopped");
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.shared.state.read().await.running
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn url(&self) -> Option<String> {
        self.addr.map(|addr| format!("http://{}", addr))
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.shared.log.as_ref().map(|log| log.path.as_path())
    }

    /// Take all buffered events.
    pub async fn drain_events(&self) -> Vec<ReceivedEvent> {
        self.shared.state.write().await.events.drain(..).collect()
    }

    pub async fn peek_events(&self) -> Vec<ReceivedEvent> {
        self.shared.state.read().await.events.iter().cloned().collect()
    }

    pub async fn event_count(&self) -> usize {
        self.shared.state.read().await.events.len()
    }

    pub async fn total_received(&self) -> u64 {
        self.shared.state.read().await.total_received
    }

    pub async fn clear_events(&self) {
        self.shared.state.write().await.events.clear();
    }
}

fn build_router(shared: Arc<Shared>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/call", post(call_handler))
        .route("/event", post(event_handler))
        .route("/track", post(track_handler))
        .route("/events", get(list_handler))
        .with_state(shared)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// ToolBridge entry point; only `trackEvent` is understood.
async fn call_handler(
    State(shared): State<Arc<Shared>>,
    Json(call): Json<ToolCall>,
) -> Result<StatusCode, (StatusCode, String)> {
    if call.tool != TRACK_TOOL {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Unsupported tool '{}'. Supported: {}", call.tool, TRACK_TOOL),
        ));
    }
    shared
        .record(ReceivedEvent::new(
            call.input.event,
            call.input.properties,
            call.user_id,
            Endpoint::Call,
        ))
        .await;
    Ok(StatusCode::OK)
}

async fn event_handler(
    State(shared): State<Arc<Shared>>,
    Json(event): Json<OutgoingEvent>,
) -> StatusCode {
    record_flat(&shared, event, Endpoint::Event).await
}

async fn track_handler(
    State(shared): State<Arc<Shared>>,
    Json(event): Json<OutgoingEvent>,
) -> StatusCode {
    record_flat(&shared, event, Endpoint::Track).await
}

async fn record_flat(shared: &Shared, event: OutgoingEvent, endpoint: Endpoint) -> StatusCode {
    shared
        .record(ReceivedEvent::new(
            event.event,
            event.properties,
            event.user_id,
            endpoint,
        ))
        .await;
    StatusCode::OK
}

async fn list_handler(State(shared): State<Arc<Shared>>) -> Json<Vec<ReceivedEvent>> {
    Json(shared.state.read().await.events.iter().cloned().collect())
}
