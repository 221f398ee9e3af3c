//! In-memory event queue with a debounced flush.
//!
//! `track` appends to the queue and, if nothing is pending, schedules one
//! flush `flush_delay` later. A flush swaps the queue out under the lock,
//! enriches each event and sends them concurrently. Send failures are logged
//! and counted; they never reach the caller.
//!
//! The queue and the timer handle share one mutex so the swap and the timer
//! cancellation are a single step. The lock is never held across an `.await`.
//!
//! A scheduled timer keeps the batcher alive until it fires, so dropping
//! every handle does not lose a pending batch. Events still queued when the
//! last reference goes away (no timer was scheduled) get a final flush on
//! the current runtime, or a warning when there is none.

use crate::event::{Enricher, Event, OutgoingEvent};
use crate::transport::Transport;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const DEFAULT_FLUSH_DELAY: Duration = Duration::from_millis(5000);

/// Outcome of a single flush. Informational only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0
    }
}

impl std::fmt::Display for FlushReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} attempted, {} delivered, {} failed",
            self.attempted, self.delivered, self.failed
        )
    }
}

/// Lifetime counters for a batcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatcherStats {
    /// Events accepted into the queue
    pub tracked: u64,
    pub delivered: u64,
    /// Sends that returned a transport error
    pub failed: u64,
    /// Debounce timers started
    pub flushes_scheduled: u64,
    /// Events rejected because `shutdown` had already run
    pub dropped_after_shutdown: u64,
}

#[derive(Default)]
struct Counters {
    tracked: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    flushes_scheduled: AtomicU64,
    dropped_after_shutdown: AtomicU64,
}

/// A scheduled flush. `generation` tells the timer task whether it is still
/// the current one when it wakes up.
struct ScheduledFlush {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct BatchState {
    queue: Vec<Event>,
    timer: Option<ScheduledFlush>,
    next_generation: u64,
}

struct Inner {
    state: Mutex<BatchState>,
    transport: Arc<dyn Transport>,
    enricher: Arc<Enricher>,
    flush_delay: Duration,
    shut_down: AtomicBool,
    counters: Counters,
}

/// Cloneable handle to a shared queue.
#[derive(Clone)]
pub struct Batcher {
    inner: Arc<Inner>,
}

impl Batcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        enricher: Arc<Enricher>,
        flush_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BatchState::default()),
                transport,
                enricher,
                flush_delay,
                shut_down: AtomicBool::new(false),
                counters: Counters::default(),
            }),
        }
    }

    pub fn flush_delay(&self) -> Duration {
        self.inner.flush_delay
    }

    pub fn enricher(&self) -> &Arc<Enricher> {
        &self.inner.enricher
    }

    /// Queue an event. Never fails.
    pub fn track(&self, event: Event) {
        let inner = &self.inner;
        let mut state = inner.lock_state();
        // Checked under the lock so nothing lands behind shutdown's final flush.
        if inner.shut_down.load(Ordering::Acquire) {
            drop(state);
            inner
                .counters
                .dropped_after_shutdown
                .fetch_add(1, Ordering::Relaxed);
            tracing::debug!(event = %event.name, "batcher shut down, dropping event");
            return;
        }

        state.queue.push(event);
        inner.counters.tracked.fetch_add(1, Ordering::Relaxed);

        if state.timer.is_some() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let generation = state.next_generation;
                state.next_generation += 1;
                let handle = runtime.spawn(run_timer(
                    Arc::clone(&self.inner),
                    generation,
                    inner.flush_delay,
                ));
                state.timer = Some(ScheduledFlush { generation, handle });
                inner
                    .counters
                    .flushes_scheduled
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                tracing::debug!(
                    pending = state.queue.len(),
                    "no async runtime, event stays queued until an explicit flush"
                );
            }
        }
    }

    /// Send everything queued so far and cancel the pending timer.
    pub async fn flush(&self) -> FlushReport {
        let batch = self.inner.take_batch();
        self.inner.send_batch(batch).await
    }

    /// Cancel the pending timer without sending. Queued events stay queued.
    pub fn cancel_scheduled(&self) -> bool {
        let mut state = self.inner.lock_state();
        match state.timer.take() {
            Some(scheduled) => {
                scheduled.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop accepting events and flush what is left.
    pub async fn shutdown(&self) -> FlushReport {
        {
            let _state = self.inner.lock_state();
            self.inner.shut_down.store(true, Ordering::Release);
        }
        self.flush().await
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    pub fn is_flush_scheduled(&self) -> bool {
        self.inner.lock_state().timer.is_some()
    }

    pub fn stats(&self) -> BatcherStats {
        let c = &self.inner.counters;
        BatcherStats {
            tracked: c.tracked.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            flushes_scheduled: c.flushes_scheduled.load(Ordering::Relaxed),
            dropped_after_shutdown: c.dropped_after_shutdown.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap the queue out and abort the pending timer.
    fn take_batch(&self) -> Vec<Event> {
        let mut state = self.lock_state();
        if let Some(scheduled) = state.timer.take() {
            scheduled.handle.abort();
        }
        std::mem::take(&mut state.queue)
    }

    /// Swap the queue out on behalf of the timer task with `generation`.
    ///
    /// A timer that was cancelled or replaced gets nothing: the queue now
    /// belongs to whichever flush superseded it.
    fn take_batch_for_timer(&self, generation: u64) -> Vec<Event> {
        let mut state = self.lock_state();
        match &state.timer {
            Some(scheduled) if scheduled.generation == generation => {
                state.timer = None;
                std::mem::take(&mut state.queue)
            }
            _ => Vec::new(),
        }
    }

    async fn send_batch(&self, batch: Vec<Event>) -> FlushReport {
        let report = deliver(self.transport.as_ref(), &self.enricher, batch).await;
        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);
        report
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        let batch = std::mem::take(&mut state.queue);
        if batch.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(pending = batch.len(), "last handle dropped, flushing queue");
                let transport = Arc::clone(&self.transport);
                let enricher = Arc::clone(&self.enricher);
                runtime.spawn(async move {
                    deliver(transport.as_ref(), &enricher, batch).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    pending = batch.len(),
                    "analytics dropped outside an async runtime, queued events were not sent"
                );
            }
        }
    }
}

/// Enrich and send `batch` concurrently. Failures are logged, never returned.
async fn deliver(
    transport: &dyn Transport,
    enricher: &Enricher,
    batch: Vec<Event>,
) -> FlushReport {
    if batch.is_empty() {
        return FlushReport::default();
    }

    let outgoing: Vec<OutgoingEvent> = batch
        .into_iter()
        .map(|event| enricher.enrich(event))
        .collect();

    let sends = outgoing.iter().map(|event| async move {
        let result = transport.send(event).await;
        (event, result)
    });
    let results = join_all(sends).await;

    let mut report = FlushReport {
        attempted: results.len(),
        ..FlushReport::default()
    };
    for (event, result) in results {
        match result {
            Ok(()) => report.delivered += 1,
            Err(e) => {
                report.failed += 1;
                tracing::debug!(
                    event = %event.event,
                    error = %e,
                    "event send failed, dropping"
                );
            }
        }
    }

    tracing::debug!(
        attempted = report.attempted,
        delivered = report.delivered,
        failed = report.failed,
        "flush complete"
    );
    report
}

/// Owns a strong reference until it fires, so the pending batch outlives
/// every user handle.
async fn run_timer(inner: Arc<Inner>, generation: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    let batch = inner.take_batch_for_timer(generation);
    inner.send_batch(batch).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{DeviceContext, Properties};
    use crate::identity::{IdentityResolver, MemoryStore};
    use crate::transport::testing::RecordingTransport;

    fn batcher_with(transport: Arc<RecordingTransport>) -> Batcher {
        let identity = Arc::new(IdentityResolver::new(Arc::new(MemoryStore::new())));
        let enricher = Arc::new(Enricher::new(DeviceContext::detect("test", "0.0.0"), identity));
        Batcher::new(transport, enricher, DEFAULT_FLUSH_DELAY)
    }

    fn event(name: &str) -> Event {
        Event::new(name, Properties::new())
    }

    #[tokio::test]
    async fn test_flush_sends_all_events_in_call_order() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());

        for i in 0..5 {
            batcher.track(event(&format!("e{}", i)));
        }
        assert_eq!(batcher.pending(), 5);

        let report = batcher.flush().await;
        assert_eq!(
            report,
            FlushReport {
                attempted: 5,
                delivered: 5,
                failed: 0
            }
        );
        assert_eq!(transport.names(), vec!["e0", "e1", "e2", "e3", "e4"]);
        assert_eq!(batcher.pending(), 0);
    }

    #[tokio::test]
    async fn test_empty_flush_sends_nothing() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());

        let report = batcher.flush().await;
        assert!(report.is_empty());
        assert!(transport.delivered().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_multiple_tracks_schedule_a_single_timer() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());

        batcher.track(event("a"));
        batcher.track(event("b"));
        batcher.track(event("c"));
        assert!(batcher.is_flush_scheduled());
        assert_eq!(batcher.stats().flushes_scheduled, 1);

        tokio::time::sleep(Duration::from_millis(4000)).await;
        assert!(transport.delivered().is_empty());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(transport.names(), vec!["a", "b", "c"]);
        assert!(!batcher.is_flush_scheduled());

        batcher.track(event("d"));
        assert_eq!(batcher.stats().flushes_scheduled, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_flush_cancels_timer() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());

        batcher.track(event("a"));
        assert!(batcher.is_flush_scheduled());
        batcher.flush().await;
        assert!(!batcher.is_flush_scheduled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.names(), vec!["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_does_not_steal_later_events() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());

        batcher.track(event("a"));
        assert!(batcher.cancel_scheduled());
        assert!(!batcher.cancel_scheduled());
        assert_eq!(batcher.pending(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(transport.delivered().is_empty());

        batcher.track(event("b"));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.names(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failed_send_does_not_stop_others() {
        let transport = Arc::new(RecordingTransport::failing_on(&["boom"]));
        let batcher = batcher_with(transport.clone());

        batcher.track(event("ok-1"));
        batcher.track(event("boom"));
        batcher.track(event("ok-2"));

        let report = batcher.flush().await;
        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);

        let mut names = transport.names();
        names.sort();
        assert_eq!(names, vec!["ok-1", "ok-2"]);

        let stats = batcher.stats();
        assert_eq!(stats.tracked, 3);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_drops_later_events() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());

        batcher.track(event("before"));
        let report = batcher.shutdown().await;
        assert_eq!(report.delivered, 1);
        assert!(batcher.is_shut_down());

        batcher.track(event("after"));
        assert_eq!(batcher.pending(), 0);
        assert_eq!(batcher.stats().dropped_after_shutdown, 1);
        assert_eq!(transport.names(), vec!["before"]);
    }

    #[test]
    fn test_track_outside_runtime_keeps_event_queued() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());

        batcher.track(event("offline"));
        assert_eq!(batcher.pending(), 1);
        assert!(!batcher.is_flush_scheduled());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let report = runtime.block_on(batcher.flush());
        assert_eq!(report.delivered, 1);
        assert_eq!(transport.names(), vec!["offline"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_batch_survives_dropping_last_handle() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());
        batcher.track(event("purchase"));
        batcher.track(event("checkout"));
        drop(batcher);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(transport.delivered().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.names(), vec!["purchase", "checkout"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unscheduled_queue_flushed_when_last_handle_dropped() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());
        batcher.track(event("held"));
        assert!(batcher.cancel_scheduled());
        drop(batcher);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.names(), vec!["held"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_track_racing_shutdown_is_delivered_or_counted() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let batcher = batcher.clone();
                tokio::spawn(async move {
                    for i in 0..250 {
                        batcher.track(event(&format!("p{}-{}", p, i)));
                        if i % 50 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        let report = batcher.shutdown().await;
        for producer in producers {
            producer.await.unwrap();
        }

        let stats = batcher.stats();
        assert_eq!(stats.tracked + stats.dropped_after_shutdown, 1000);
        assert_eq!(report.delivered as u64, stats.tracked);
        assert_eq!(batcher.pending(), 0);
        assert!(!batcher.is_flush_scheduled());
    }

    #[tokio::test]
    async fn test_events_are_enriched_at_send_time() {
        let transport = Arc::new(RecordingTransport::new());
        let batcher = batcher_with(transport.clone());

        batcher.track(event("a"));
        batcher.enricher().identity().identify("late-user");
        batcher.flush().await;

        let sent = transport.delivered();
        assert_eq!(sent[0].user_id, "late-user");
    }
}
