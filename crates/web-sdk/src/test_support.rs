//! Scripted collaborators shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use sitepulse_core::{DeliveryError, EventKind};

use crate::events::{Batch, Event};
use crate::transport::{Beacon, IngestClient, PostMode};

pub fn event(kind: EventKind, label: &str) -> Event {
    Event {
        id: Uuid::new_v4(),
        kind,
        timestamp: Utc::now(),
        url: format!("https://example.com/{label}"),
        title: None,
        referrer: None,
        site_id: "site-1".into(),
        session_id: None,
        utm: BTreeMap::new(),
        custom_dimensions: BTreeMap::new(),
        payload: None,
    }
}

pub fn batch_of(n: usize) -> Batch {
    let events = (0..n)
        .map(|i| event(EventKind::Event, &format!("e{i}")))
        .collect();
    Batch::new("site-1", events)
}

/// Pauses every `post` until released, announcing entry first.
#[derive(Clone, Default)]
pub struct Hold {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

/// Ingest client that fails according to a script and records every body.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<DeliveryError>>,
    bodies: Mutex<Vec<Bytes>>,
    modes: Mutex<Vec<PostMode>>,
    delivered: Mutex<Vec<Bytes>>,
    hold: Option<Hold>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `k` attempts with `err`, then succeeds.
    pub fn failing_first(k: usize, err: DeliveryError) -> Self {
        Self {
            script: Mutex::new(std::iter::repeat(err).take(k).collect()),
            ..Default::default()
        }
    }

    pub fn with_hold(mut self, hold: Hold) -> Self {
        self.hold = Some(hold);
        self
    }

    pub fn calls(&self) -> usize {
        self.bodies.lock().len()
    }

    pub fn bodies(&self) -> Vec<Bytes> {
        self.bodies.lock().clone()
    }

    pub fn modes(&self) -> Vec<PostMode> {
        self.modes.lock().clone()
    }

    /// Batches whose attempt succeeded, in delivery order.
    pub fn delivered(&self) -> Vec<Batch> {
        self.delivered
            .lock()
            .iter()
            .map(|b| serde_json::from_slice(b).expect("delivered body is a batch"))
            .collect()
    }

    /// URLs of every delivered event, flattened in delivery order.
    pub fn delivered_urls(&self) -> Vec<String> {
        self.delivered()
            .into_iter()
            .flat_map(|b| b.events)
            .map(|e| e.url.replace("https://example.com/", ""))
            .collect()
    }
}

impl IngestClient for ScriptedClient {
    fn post(
        &self,
        _endpoint: &str,
        body: Bytes,
        mode: PostMode,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        self.bodies.lock().push(body.clone());
        self.modes.lock().push(mode);
        let outcome = self.script.lock().pop_front();
        let hold = self.hold.clone();

        async move {
            if let Some(hold) = hold {
                hold.entered.notify_one();
                hold.release.notified().await;
            }
            match outcome {
                Some(err) => Err(err),
                None => {
                    self.delivered.lock().push(body);
                    Ok(())
                }
            }
        }
    }
}

/// Beacon that records what it was given.
pub struct RecordingBeacon {
    accept: bool,
    sent: Mutex<Vec<Bytes>>,
}

impl RecordingBeacon {
    pub fn new(accept: bool) -> Self {
        Self {
            accept,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Batch> {
        self.sent
            .lock()
            .iter()
            .map(|b| serde_json::from_slice(b).expect("beacon body is a batch"))
            .collect()
    }
}

impl Beacon for RecordingBeacon {
    fn send_beacon(&self, _endpoint: &str, body: Bytes) -> bool {
        self.sent.lock().push(body);
        self.accept
    }
}

/// Poll `condition` until it holds, failing the test after a second.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 1s"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
