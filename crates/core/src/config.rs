use std::collections::BTreeSet;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{CollectorError, CollectorResult};
use crate::types::EventKind;

/// Session store key used when no configuration names one.
pub const DEFAULT_SESSION_STORAGE_KEY: &str = "sitepulse_session";

/// Collector configuration. Loaded from environment variables with the
/// prefix `SITEPULSE__` and an optional TOML file, then frozen.
#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    /// Site identifier stamped on every event; empty means unset.
    #[serde(default)]
    pub site_id: String,
    #[serde(default = "default_collection_endpoint")]
    pub collection_endpoint: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_consent_exempt")]
    pub consent_exempt: BTreeSet<EventKind>,
    /// Upper bound on queued events; the oldest are evicted past it.
    /// `None` keeps the queue unbounded.
    #[serde(default)]
    pub max_queue_size: Option<usize>,
    #[serde(default = "default_session_storage_key")]
    pub session_storage_key: String,
    /// Upper bound on the single teardown request made when no beacon is
    /// attached.
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
}

fn default_collection_endpoint() -> String {
    "http://localhost:8080/api/collect".to_string()
}
fn default_batch_size() -> usize {
    10
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_retry_backoff_base_ms() -> u64 {
    1_000
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_consent_exempt() -> BTreeSet<EventKind> {
    EventKind::DEFAULT_CONSENT_EXEMPT.into_iter().collect()
}
fn default_session_storage_key() -> String {
    DEFAULT_SESSION_STORAGE_KEY.to_string()
}
fn default_teardown_timeout_ms() -> u64 {
    2_000
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            site_id: String::new(),
            collection_endpoint: default_collection_endpoint(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            consent_exempt: default_consent_exempt(),
            max_queue_size: None,
            session_storage_key: default_session_storage_key(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
        }
    }
}

impl CollectorConfig {
    /// Configuration for a site with every other field at its default.
    pub fn for_site(site_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            ..Default::default()
        }
    }

    /// Load from `SITEPULSE__*` environment variables.
    pub fn load() -> CollectorResult<Self> {
        Self::load_from(None)
    }

    /// Load from an optional TOML file, with environment variables layered on top.
    pub fn load_from(file: Option<&Path>) -> CollectorResult<Self> {
        debug!(file = ?file, "loading collector configuration");
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("SITEPULSE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("consent_exempt"),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn has_site(&self) -> bool {
        !self.site_id.trim().is_empty()
    }

    pub fn is_consent_exempt(&self, kind: EventKind) -> bool {
        self.consent_exempt.contains(&kind)
    }

    /// Reject values that would stall or spin the flush loop.
    pub fn validate(&self) -> CollectorResult<()> {
        if self.collection_endpoint.trim().is_empty() {
            return Err(CollectorError::Config(
                "collection_endpoint must not be empty".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(CollectorError::Config("batch_size must be > 0".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(CollectorError::Config(
                "flush_interval_ms must be > 0".into(),
            ));
        }
        if self.retry_backoff_base_ms == 0 {
            return Err(CollectorError::Config(
                "retry_backoff_base_ms must be > 0".into(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(CollectorError::Config(
                "retry_max_attempts must be >= 1".into(),
            ));
        }
        if self.teardown_timeout_ms == 0 {
            return Err(CollectorError::Config(
                "teardown_timeout_ms must be > 0".into(),
            ));
        }
        if self.max_queue_size == Some(0) {
            return Err(CollectorError::Config(
                "max_queue_size must be > 0 when set".into(),
            ));
        }
        Ok(())
    }
}
