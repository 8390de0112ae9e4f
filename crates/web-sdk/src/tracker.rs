//! Tracker: the host-facing API. Every `track*` call builds an event,
//! runs it through the consent gate, and queues it without waiting for
//! delivery. Nothing here fails visibly to the caller.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sitepulse_core::diagnostics::noop_sink;
use sitepulse_core::{
    CollectorConfig, CollectorError, CollectorResult, Diagnostic, DiagnosticsSink, EventKind,
    Scalar,
};

use crate::builder::EventBuilder;
use crate::consent::{ConsentState, Lifecycle, Session, SessionStore};
use crate::events::{Event, EventFields, PageContext};
use crate::queue::EventQueue;
use crate::transport::{Beacon, IngestClient, RetryPolicy, Transport};

/// Mutable pipeline state. Guarded by one lock that is never held across
/// an await point.
#[derive(Debug, Default)]
pub(crate) struct PipelineState {
    pub(crate) consent: ConsentState,
    pub(crate) queue: EventQueue,
    pub(crate) page: PageContext,
    pub(crate) dimensions: BTreeMap<String, Scalar>,
}

pub(crate) struct Inner<C> {
    pub(crate) client: Arc<C>,
    pub(crate) beacon: Option<Arc<dyn Beacon>>,
    pub(crate) store: Option<Arc<dyn SessionStore>>,
    pub(crate) diagnostics: Arc<dyn DiagnosticsSink>,
    pub(crate) transport: OnceLock<Transport<C>>,
    pub(crate) state: Mutex<PipelineState>,
    /// Serializes consent grants so the session store sees one write.
    pub(crate) grant: Mutex<()>,
    pub(crate) timer: Mutex<Option<JoinHandle<()>>>,
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.get_mut().take() {
            timer.abort();
        }
    }
}

/// Builds a [`Tracker`] around an ingest client.
pub struct TrackerBuilder<C> {
    client: C,
    beacon: Option<Arc<dyn Beacon>>,
    store: Option<Arc<dyn SessionStore>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    page: PageContext,
}

impl<C: IngestClient> TrackerBuilder<C> {
    /// Attach the teardown beacon. Without one, teardown falls back to a
    /// single unretried request.
    pub fn with_beacon(mut self, beacon: Arc<dyn Beacon>) -> Self {
        self.beacon = Some(beacon);
        self
    }

    pub fn with_session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    pub fn with_page(mut self, page: PageContext) -> Self {
        self.page = page;
        self
    }

    pub fn build(self) -> Tracker<C> {
        Tracker {
            inner: Arc::new(Inner {
                client: Arc::new(self.client),
                beacon: self.beacon,
                store: self.store,
                diagnostics: self.diagnostics,
                transport: OnceLock::new(),
                state: Mutex::new(PipelineState {
                    page: self.page,
                    ..Default::default()
                }),
                grant: Mutex::new(()),
                timer: Mutex::new(None),
            }),
        }
    }
}

/// Cheaply cloneable handle to one collection pipeline.
pub struct Tracker<C> {
    pub(crate) inner: Arc<Inner<C>>,
}

impl<C> Clone for Tracker<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: IngestClient> Tracker<C> {
    pub fn builder(client: C) -> TrackerBuilder<C> {
        TrackerBuilder {
            client,
            beacon: None,
            store: None,
            diagnostics: noop_sink(),
            page: PageContext::default(),
        }
    }

    pub fn new(client: C) -> Self {
        Self::builder(client).build()
    }

    /// Freeze the configuration and start the periodic flush. A tracker is
    /// configured at most once.
    pub fn configure(&self, config: CollectorConfig) -> CollectorResult<()> {
        config.validate()?;
        let config = Arc::new(config);

        let transport = Transport::new(
            Arc::clone(&self.inner.client),
            self.inner.beacon.clone(),
            config.collection_endpoint.clone(),
            RetryPolicy::from_config(&config),
        )
        .with_keepalive_timeout(Duration::from_millis(config.teardown_timeout_ms));
        if self.inner.transport.set(transport).is_err() {
            return Err(CollectorError::Config("collector already configured".into()));
        }

        let evicted = {
            let mut state = self.inner.state.lock();
            state.consent.configure(Arc::clone(&config));
            state.queue.set_max_size(config.max_queue_size)
        };
        self.report_evicted(evicted);

        self.start_timer(config.flush_interval_ms);
        Ok(())
    }

    /// Grant consent. Idempotent; only the first call creates a session.
    /// The session store is consulted without the pipeline lock held.
    pub fn grant_consent(&self) {
        let _grant = self.inner.grant.lock();
        let Some(key) = self.inner.state.lock().consent.pending_grant_key() else {
            debug!("consent already granted");
            return;
        };
        let session = Session::resolve(self.inner.store.as_deref(), &key);
        self.inner.state.lock().consent.complete_grant(session);
    }

    pub fn set_custom_dimension(&self, name: impl Into<String>, value: impl Into<Scalar>) {
        self.inner
            .state
            .lock()
            .dimensions
            .insert(name.into(), value.into());
    }

    /// Update the document context after a navigation.
    pub fn set_page(&self, page: PageContext) {
        self.inner.state.lock().page = page;
    }

    /// Build an event of `kind` from the current context and queue it.
    pub fn track(&self, kind: EventKind, fields: EventFields) {
        let event = {
            let state = self.inner.state.lock();
            EventBuilder {
                site_id: state.consent.site_id().unwrap_or_default(),
                page: &state.page,
                session_id: state.consent.session_id(),
                dimensions: &state.dimensions,
            }
            .build(kind, fields)
        };
        self.enqueue(event);
    }

    /// Admit `event` through the consent gate and append it to the queue.
    /// Reaching `batch_size` schedules a flush on its own task.
    pub fn enqueue(&self, mut event: Event) {
        let (queued, evicted, threshold_hit) = {
            let mut state = self.inner.state.lock();
            match state.consent.admit(event.kind) {
                Err(reason) => {
                    drop(state);
                    warn!(kind = %event.kind, ?reason, "event dropped at admission");
                    metrics::counter!("collector.dropped").increment(1);
                    self.inner.diagnostics.emit(Diagnostic::Dropped {
                        kind: event.kind,
                        reason,
                    });
                    return;
                }
                Ok(()) => {}
            }

            if event.session_id.is_none() {
                event.session_id = state.consent.session_id().map(str::to_string);
            }
            let batch_size = state
                .consent
                .config()
                .map(|c| c.batch_size)
                .unwrap_or(usize::MAX);

            let evicted = state.queue.push(event);
            let queued = state.queue.len();
            (queued, evicted, queued >= batch_size)
        };

        metrics::counter!("collector.queued").increment(1);
        debug!(queued, "event queued");
        self.report_evicted(evicted);

        if threshold_hit {
            self.spawn_flush();
        }
    }

    pub fn track_page_view(&self) {
        self.track(EventKind::PageView, EventFields::new());
    }

    pub fn track_event(&self, name: &str, data: serde_json::Value) {
        self.track(
            EventKind::Event,
            EventFields::new().payload(json!({ "name": name, "data": data })),
        );
    }

    pub fn track_goal(&self, name: &str, value: Option<f64>) {
        self.track(
            EventKind::Goal,
            EventFields::new().payload(json!({ "name": name, "value": value })),
        );
    }

    pub fn track_ecommerce(&self, action: &str, data: serde_json::Value) {
        self.track(
            EventKind::Ecommerce,
            EventFields::new().payload(json!({ "action": action, "data": data })),
        );
    }

    /// Scroll depth sample, in percent of the page.
    pub fn track_scroll(&self, depth_percent: u8) {
        self.track(
            EventKind::Scroll,
            EventFields::new().payload(json!({ "depth": depth_percent.min(100) })),
        );
    }

    /// Heatmap click sample at viewport coordinates.
    pub fn track_click(&self, x: f64, y: f64, selector: Option<&str>) {
        self.track(
            EventKind::Heatmap,
            EventFields::new().payload(json!({ "x": x, "y": y, "selector": selector })),
        );
    }

    pub fn track_error(&self, message: &str, source: Option<&str>) {
        self.track(
            EventKind::Error,
            EventFields::new().payload(json!({ "message": message, "source": source })),
        );
    }

    pub fn track_performance(&self, timings: serde_json::Value) {
        self.track(EventKind::Performance, EventFields::new().payload(timings));
    }

    pub fn track_engagement(&self, seconds_on_page: u64) {
        self.track(
            EventKind::Engagement,
            EventFields::new().payload(json!({ "timeOnPage": seconds_on_page })),
        );
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Copy of the queued events, front first.
    pub fn queued_events(&self) -> Vec<Event> {
        self.inner.state.lock().queue.iter().cloned().collect()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.inner.state.lock().consent.lifecycle()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .consent
            .session_id()
            .map(str::to_string)
    }

    pub(crate) fn report_evicted(&self, count: usize) {
        if count == 0 {
            return;
        }
        warn!(count, "queue full, oldest events evicted");
        metrics::counter!("collector.evicted").increment(count as u64);
        self.inner.diagnostics.emit(Diagnostic::Evicted { count });
    }
}
