//! Local diagnostics: the only place admission drops and delivery failures
//! surface. Producers of events never see them.
//!
//! Pipeline components accept an `Arc<dyn DiagnosticsSink>`; the default is
//! a no-op sink, tests attach a [`CaptureSink`].

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DeliveryError;
use crate::types::{BeaconOutcome, EventKind};

/// Why an event was not admitted to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    SiteNotConfigured,
    ConsentRequired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// Event rejected at admission.
    Dropped { kind: EventKind, reason: DropReason },
    /// Oldest events discarded to honor `max_queue_size`.
    Evicted { count: usize },
    /// Batch accepted by the endpoint.
    Delivered { events: usize, attempts: u32 },
    /// Batch put back at the queue front after retries ran out.
    Requeued { events: usize, error: DeliveryError },
    /// Teardown send; whatever happened, the batch is gone.
    BestEffort {
        events: usize,
        outcome: BeaconOutcome,
    },
    /// Keep-alive fallback used at teardown when no beacon exists.
    BestEffortFallback {
        events: usize,
        error: Option<DeliveryError>,
    },
    /// Teardown batch could not be serialized; no send was attempted.
    Unsendable { events: usize, error: String },
}

pub trait DiagnosticsSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Discards everything.
pub struct NoopSink;

impl DiagnosticsSink for NoopSink {
    fn emit(&self, _diagnostic: Diagnostic) {}
}

/// In-memory sink that captures diagnostics for testing.
#[derive(Default)]
pub struct CaptureSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.diagnostics.lock().len()
    }

    /// Number of admission drops recorded with `reason`.
    pub fn count_dropped(&self, reason: DropReason) -> usize {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| matches!(d, Diagnostic::Dropped { reason: r, .. } if *r == reason))
            .count()
    }

    pub fn clear(&self) {
        self.diagnostics.lock().clear();
    }
}

impl DiagnosticsSink for CaptureSink {
    fn emit(&self, diagnostic: Diagnostic) {
        self.diagnostics.lock().push(diagnostic);
    }
}

pub fn noop_sink() -> Arc<dyn DiagnosticsSink> {
    Arc::new(NoopSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
