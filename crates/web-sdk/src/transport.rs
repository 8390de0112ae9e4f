//! Batch delivery to the collection endpoint.
//!
//! Two primitives: [`Transport::send`] serializes once and retries with
//! exponential backoff plus jitter; [`Transport::send_best_effort`] hands the
//! batch to a fire-and-forget [`Beacon`] and never retries. Without a beacon,
//! teardown uses [`Transport::send_once`], a single keep-alive request bounded
//! by a timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use sitepulse_core::{BeaconOutcome, CollectorConfig, CollectorResult, DeliveryError};

use crate::events::Batch;

/// Keep-alive bound used when the configuration does not supply one.
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// How a single request is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostMode {
    /// Regular delivery on the retrying path.
    Standard,
    /// Teardown request. Must complete within `timeout` or be abandoned.
    KeepAlive { timeout: Duration },
}

/// Asynchronous request primitive. One call is one delivery attempt.
pub trait IngestClient: Send + Sync + 'static {
    fn post(
        &self,
        endpoint: &str,
        body: Bytes,
        mode: PostMode,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Non-blocking send that never reports failure to its caller beyond a
/// boolean "accepted".
pub trait Beacon: Send + Sync {
    fn send_beacon(&self, endpoint: &str, body: Bytes) -> bool;
}

/// JSON POST over `reqwest`. Any 2xx is success.
#[derive(Debug, Clone, Default)]
pub struct HttpIngestClient {
    client: reqwest::Client,
}

impl HttpIngestClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl IngestClient for HttpIngestClient {
    fn post(
        &self,
        endpoint: &str,
        body: Bytes,
        mode: PostMode,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send {
        let mut request = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let PostMode::KeepAlive { timeout } = mode {
            request = request.timeout(timeout);
        }

        async move {
            let response = request.send().await.map_err(|e| match mode {
                PostMode::KeepAlive { timeout } if e.is_timeout() => {
                    DeliveryError::Timeout(millis(timeout))
                }
                _ => DeliveryError::Network(e.to_string()),
            })?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(DeliveryError::Status(status.as_u16()))
            }
        }
    }
}

/// Beacon backed by a detached task on the current tokio runtime. Reports
/// `false` when no runtime is running.
///
/// The runtime cancels detached tasks when it shuts down, so a process that
/// exits right after teardown must [`drain`](HttpBeacon::drain) first.
#[derive(Debug, Clone, Default)]
pub struct HttpBeacon {
    client: reqwest::Client,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl HttpBeacon {
    pub fn new() -> Self {
        Self::default()
    }

    /// Beacon requests spawned but not yet finished.
    pub fn in_flight(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|task| !task.is_finished());
        pending.len()
    }

    /// Wait up to `timeout` for in-flight requests and return how many
    /// finished. Requests past the deadline stay detached.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let deadline = tokio::time::Instant::now() + timeout;
        let mut finished = 0;
        let mut abandoned = 0;
        for task in pending {
            match tokio::time::timeout_at(deadline, task).await {
                Ok(_) => finished += 1,
                Err(_) => abandoned += 1,
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "beacon requests still in flight after drain");
        }
        finished
    }
}

impl Beacon for HttpBeacon {
    fn send_beacon(&self, endpoint: &str, body: Bytes) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let request = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        let endpoint = endpoint.to_string();

        let task = handle.spawn(async move {
            match request.send().await {
                Ok(resp) => debug!(%endpoint, status = %resp.status(), "beacon sent"),
                Err(e) => debug!(%endpoint, error = %e, "beacon lost"),
            }
        });

        let mut pending = self.pending.lock();
        pending.retain(|running| !running.is_finished());
        pending.push(task);
        true
    }
}

/// Exponential backoff: after failed attempt `n` (1-indexed) wait
/// `base * 2^(n-1)` plus uniform jitter in `[0, base * 2^(n-1)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &CollectorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.retry_backoff_base_ms),
            config.retry_max_attempts,
        )
    }

    /// Delay before jitter following failed attempt `failed_attempt`.
    pub fn base_delay(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent)
    }

    /// Full delay with jitter following failed attempt `failed_attempt`.
    pub fn delay_after<R: Rng + ?Sized>(&self, failed_attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(failed_attempt);
        base.saturating_add(Duration::from_millis(rng.gen_range(0..=millis(base))))
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// What a successful `send` went through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempts: u32,
    /// Backoff waits taken, in order.
    pub waits: Vec<Duration>,
}

pub struct Transport<C> {
    client: Arc<C>,
    beacon: Option<Arc<dyn Beacon>>,
    endpoint: String,
    policy: RetryPolicy,
    keepalive_timeout: Duration,
}

impl<C: IngestClient> Transport<C> {
    pub fn new(
        client: Arc<C>,
        beacon: Option<Arc<dyn Beacon>>,
        endpoint: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            beacon,
            endpoint: endpoint.into(),
            policy,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }

    /// Bound for the single teardown request made by [`send_once`](Self::send_once).
    pub fn with_keepalive_timeout(mut self, timeout: Duration) -> Self {
        self.keepalive_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn encode(batch: &Batch) -> CollectorResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(batch)?))
    }

    /// Deliver `batch`, retrying up to `policy.max_attempts` times. The error
    /// after the last attempt is returned inside `DeliveryError::Exhausted`.
    pub async fn send(&self, batch: &Batch) -> CollectorResult<DeliveryReport> {
        let body = Self::encode(batch)?;
        let mut waits = Vec::new();
        let mut attempt = 1;

        loop {
            debug!(
                attempt,
                max_attempts = self.policy.max_attempts,
                events = batch.len(),
                "attempting batch delivery"
            );
            metrics::counter!("transport.attempts").increment(1);

            let err = match self
                .client
                .post(&self.endpoint, body.clone(), PostMode::Standard)
                .await
            {
                Ok(()) => return Ok(DeliveryReport { attempts: attempt, waits }),
                Err(err) => err,
            };
            metrics::counter!("transport.failures").increment(1);

            if attempt >= self.policy.max_attempts {
                return Err(DeliveryError::Exhausted {
                    attempts: attempt,
                    last: Box::new(err),
                }
                .into());
            }

            let wait = self.policy.delay_after(attempt, &mut rand::thread_rng());
            warn!(
                attempt,
                error = %err,
                backoff_ms = millis(wait),
                "batch delivery failed, backing off"
            );
            tokio::time::sleep(wait).await;
            waits.push(wait);
            attempt += 1;
        }
    }

    /// One keep-alive attempt, no retry, abandoned after the keep-alive
    /// timeout. Used at teardown when no beacon exists.
    pub async fn send_once(&self, batch: &Batch) -> CollectorResult<()> {
        let body = Self::encode(batch)?;
        metrics::counter!("transport.attempts").increment(1);

        let timeout = self.keepalive_timeout;
        let post = self
            .client
            .post(&self.endpoint, body, PostMode::KeepAlive { timeout });
        match tokio::time::timeout(timeout, post).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeliveryError::Timeout(millis(timeout)).into()),
        }
    }

    /// Hand `batch` to the beacon. Never retries; only a batch that cannot
    /// be serialized is an error, and then the beacon is not called.
    pub fn send_best_effort(&self, batch: &Batch) -> CollectorResult<BeaconOutcome> {
        let Some(beacon) = self.beacon.as_deref() else {
            return Ok(BeaconOutcome::NotAvailable);
        };
        let body = Self::encode(batch)?;
        metrics::counter!("transport.beacons").increment(1);
        let accepted = beacon.send_beacon(&self.endpoint, body);
        Ok(BeaconOutcome::Attempted { accepted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{batch_of, Hold, RecordingBeacon, ScriptedClient};
    use sitepulse_core::CollectorError;

    fn transport(client: Arc<ScriptedClient>, max_attempts: u32) -> Transport<ScriptedClient> {
        Transport::new(
            client,
            None,
            "http://collector.test/api/collect",
            RetryPolicy::new(Duration::from_millis(1), max_attempts),
        )
    }

    #[test]
    fn test_backoff_bounds() {
        let policy = RetryPolicy::new(Duration::from_millis(100), 5);
        let mut rng = rand::thread_rng();
        for n in 1..=4 {
            let floor = Duration::from_millis(100 * (1 << (n - 1)));
            assert_eq!(policy.base_delay(n), floor);
            for _ in 0..50 {
                let delay = policy.delay_after(n, &mut rng);
                assert!(delay >= floor);
                assert!(delay <= floor * 2);
            }
        }
    }

    #[test]
    fn test_millis_saturates() {
        assert_eq!(millis(Duration::from_millis(1_500)), 1_500);
        assert_eq!(millis(Duration::MAX), u64::MAX);

        let policy = RetryPolicy::new(Duration::MAX, 3);
        assert_eq!(policy.delay_after(3, &mut rand::thread_rng()), Duration::MAX);
    }

    #[test]
    fn test_policy_clamps_attempts() {
        assert_eq!(RetryPolicy::new(Duration::from_millis(5), 0).max_attempts, 1);
        let config = CollectorConfig::for_site("site-1");
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.base, Duration::from_millis(1_000));
        assert_eq!(policy.max_attempts, 3);
    }

    #[tokio::test]
    async fn test_first_attempt_success_has_no_wait() {
        let client = Arc::new(ScriptedClient::new());
        let report = transport(client.clone(), 3)
            .send(&batch_of(2))
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert!(report.waits.is_empty());
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let client = Arc::new(ScriptedClient::failing_first(
            2,
            DeliveryError::Status(503),
        ));
        let batch = batch_of(3);
        let report = transport(client.clone(), 4).send(&batch).await.unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.waits.len(), 2);
        assert!(report.waits[0] >= Duration::from_millis(1));
        assert!(report.waits[1] >= Duration::from_millis(2));
        assert!(report.waits[1] >= report.waits[0]);

        let delivered = client.delivered();
        assert_eq!(delivered.len(), 1);
        let ids: Vec<_> = delivered[0].events.iter().map(|e| e.id).collect();
        let expected: Vec<_> = batch.events.iter().map(|e| e.id).collect();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let client = Arc::new(ScriptedClient::failing_first(
            10,
            DeliveryError::Network("connection refused".into()),
        ));
        let err = transport(client.clone(), 3)
            .send(&batch_of(1))
            .await
            .unwrap_err();

        match err {
            CollectorError::Delivery(DeliveryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(*last, DeliveryError::Network("connection refused".into()));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(client.calls(), 3);
        // Serialized once: every attempt carries the same body.
        let bodies = client.bodies();
        assert!(bodies.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_send_once_does_not_retry() {
        let client = Arc::new(ScriptedClient::failing_first(
            1,
            DeliveryError::Status(500),
        ));
        let result = transport(client.clone(), 5).send_once(&batch_of(1)).await;
        assert!(result.is_err());
        assert_eq!(client.calls(), 1);
        assert_eq!(
            client.modes(),
            vec![PostMode::KeepAlive {
                timeout: DEFAULT_KEEPALIVE_TIMEOUT
            }]
        );
    }

    #[tokio::test]
    async fn test_send_once_gives_up_after_keepalive_timeout() {
        let hold = Hold::default();
        let client = Arc::new(ScriptedClient::new().with_hold(hold.clone()));
        let transport =
            transport(client.clone(), 3).with_keepalive_timeout(Duration::from_millis(20));

        let result = tokio::time::timeout(Duration::from_secs(1), transport.send_once(&batch_of(1)))
            .await
            .expect("send_once must not outlive its timeout");

        match result {
            Err(CollectorError::Delivery(DeliveryError::Timeout(ms))) => assert_eq!(ms, 20),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(client.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_retrying_path_uses_standard_mode() {
        let client = Arc::new(ScriptedClient::failing_first(
            1,
            DeliveryError::Status(502),
        ));
        transport(client.clone(), 2).send(&batch_of(1)).await.unwrap();
        assert_eq!(client.modes(), vec![PostMode::Standard; 2]);
    }

    #[test]
    fn test_best_effort_without_beacon() {
        let client = Arc::new(ScriptedClient::new());
        let outcome = transport(client.clone(), 3)
            .send_best_effort(&batch_of(1))
            .unwrap();
        assert_eq!(outcome, BeaconOutcome::NotAvailable);
        assert_eq!(client.calls(), 0);
    }

    #[test]
    fn test_best_effort_reports_acceptance() {
        for accept in [true, false] {
            let beacon = Arc::new(RecordingBeacon::new(accept));
            let transport = Transport::new(
                Arc::new(ScriptedClient::new()),
                Some(beacon.clone() as Arc<dyn Beacon>),
                "http://collector.test/api/collect",
                RetryPolicy::new(Duration::from_millis(1), 3),
            );
            let outcome = transport.send_best_effort(&batch_of(2)).unwrap();
            assert_eq!(outcome, BeaconOutcome::Attempted { accepted: accept });
            assert_eq!(beacon.sent().len(), 1);
            assert_eq!(beacon.sent()[0].events.len(), 2);
        }
    }

    #[test]
    fn test_http_beacon_without_runtime() {
        let beacon = HttpBeacon::new();
        assert!(!beacon.send_beacon("http://127.0.0.1:9/collect", Bytes::from_static(b"{}")));
        assert_eq!(beacon.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_http_beacon_drain_with_nothing_pending() {
        let beacon = HttpBeacon::new();
        assert_eq!(beacon.drain(Duration::from_millis(10)).await, 0);
    }
}
