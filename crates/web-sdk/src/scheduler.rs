//! Flush scheduling: size-triggered, timer-triggered, and teardown flushes.
//!
//! Every flush takes the whole queue under the state lock before its first
//! await, so racing flushes never share an event and an enqueue landing
//! mid-delivery stays queued for the next cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use sitepulse_core::{BeaconOutcome, CollectorError, CollectorResult, Diagnostic};

use crate::events::Batch;
use crate::tracker::Tracker;
use crate::transport::{DeliveryReport, IngestClient, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Retrying delivery; failed batches go back to the queue front.
    Async,
    /// Teardown delivery; best effort, nothing is re-queued.
    Sync,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Queue empty or site not configured; nothing happened.
    Skipped,
    Delivered { events: usize, attempts: u32 },
    Requeued { events: usize },
    /// Handed to the beacon (or found none); the batch is gone either way.
    BestEffort { events: usize, outcome: BeaconOutcome },
    /// No beacon: one unretried keep-alive request was made instead.
    Fallback { events: usize, delivered: bool },
    /// Teardown batch could not be serialized and was dropped unsent.
    Unsendable { events: usize },
}

impl<C: IngestClient> Tracker<C> {
    /// Drain the queue and deliver it. Failures only reach diagnostics.
    pub async fn flush(&self, mode: FlushMode) -> FlushOutcome {
        let Some(transport) = self.inner.transport.get() else {
            return FlushOutcome::Skipped;
        };

        let batch = {
            let mut state = self.inner.state.lock();
            let Some(site_id) = state.consent.site_id().map(str::to_string) else {
                return FlushOutcome::Skipped;
            };
            if state.queue.is_empty() {
                return FlushOutcome::Skipped;
            }
            Batch::new(site_id, state.queue.take_all())
        };
        let events = batch.len();
        debug!(events, ?mode, "flushing queue");

        match mode {
            FlushMode::Async => {
                let result = transport.send(&batch).await;
                self.settle(batch, result)
            }
            FlushMode::Sync => self.flush_teardown(transport, batch).await,
        }
    }

    /// Beacon when there is one, otherwise a single keep-alive request bounded
    /// by the teardown timeout. The batch is never re-queued.
    async fn flush_teardown(&self, transport: &Transport<C>, batch: Batch) -> FlushOutcome {
        let events = batch.len();
        let outcome = match transport.send_best_effort(&batch) {
            Ok(outcome) => outcome,
            Err(err) => return self.report_unsendable(events, err),
        };
        if outcome != BeaconOutcome::NotAvailable {
            debug!(events, ?outcome, "teardown batch handed to beacon");
            self.inner
                .diagnostics
                .emit(Diagnostic::BestEffort { events, outcome });
            return FlushOutcome::BestEffort { events, outcome };
        }

        let error = match transport.send_once(&batch).await {
            Ok(()) => None,
            Err(CollectorError::Delivery(err)) => Some(err),
            Err(other) => return self.report_unsendable(events, other),
        };
        let delivered = error.is_none();
        if let Some(err) = &error {
            warn!(events, error = %err, "teardown batch lost");
        }
        self.inner
            .diagnostics
            .emit(Diagnostic::BestEffortFallback { events, error });
        FlushOutcome::Fallback { events, delivered }
    }

    /// Host-initiated flush on the retrying path.
    pub async fn flush_now(&self) -> FlushOutcome {
        self.flush(FlushMode::Async).await
    }

    /// Page is going away: stop the timer and send whatever is queued once.
    pub async fn teardown(&self) -> FlushOutcome {
        if let Some(timer) = self.inner.timer.lock().take() {
            timer.abort();
        }
        self.flush(FlushMode::Sync).await
    }

    /// Run an async flush on its own task so the producer never waits on it.
    pub(crate) fn spawn_flush(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, size-triggered flush deferred");
            return;
        };
        let tracker = self.clone();
        handle.spawn(async move {
            tracker.flush(FlushMode::Async).await;
        });
    }

    pub(crate) fn start_timer(&self, interval_ms: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, periodic flush disabled");
            return;
        };
        let period = Duration::from_millis(interval_ms);
        let weak = Arc::downgrade(&self.inner);

        let timer = handle.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Tracker { inner }.flush(FlushMode::Async).await;
            }
        });

        if let Some(previous) = self.inner.timer.lock().replace(timer) {
            previous.abort();
        }
    }

    /// Resolve an async delivery: drop the batch on success, put it back in
    /// front of the queue on failure.
    fn settle(&self, batch: Batch, result: CollectorResult<DeliveryReport>) -> FlushOutcome {
        let events = batch.len();
        match result {
            Ok(report) => {
                info!(events, attempts = report.attempts, "batch delivered");
                metrics::counter!("collector.flushed").increment(events as u64);
                self.inner.diagnostics.emit(Diagnostic::Delivered {
                    events,
                    attempts: report.attempts,
                });
                FlushOutcome::Delivered {
                    events,
                    attempts: report.attempts,
                }
            }
            Err(err) => {
                let evicted = self.inner.state.lock().queue.requeue_front(batch.events);
                error!(events, error = %err, "batch delivery failed, re-queued");
                metrics::counter!("collector.requeued").increment(events as u64);
                self.report_requeued(events, err);
                self.report_evicted(evicted);
                FlushOutcome::Requeued { events }
            }
        }
    }

    fn report_unsendable(&self, events: usize, err: CollectorError) -> FlushOutcome {
        error!(events, error = %err, "teardown batch could not be serialized, dropped");
        self.inner.diagnostics.emit(Diagnostic::Unsendable {
            events,
            error: err.to_string(),
        });
        FlushOutcome::Unsendable { events }
    }

    fn report_requeued(&self, events: usize, err: CollectorError) {
        let error = match err {
            CollectorError::Delivery(err) => err,
            other => sitepulse_core::DeliveryError::Network(other.to_string()),
        };
        self.inner
            .diagnostics
            .emit(Diagnostic::Requeued { events, error });
    }
}
