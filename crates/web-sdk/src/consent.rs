//! Consent gate and session lifecycle.
//!
//! Consent moves once from ungranted to granted and is never revoked. The
//! first grant creates the session, reusing an id already persisted in the
//! host's session store when there is one.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};
use uuid::Uuid;

use sitepulse_core::config::DEFAULT_SESSION_STORAGE_KEY;
use sitepulse_core::{CollectorConfig, DropReason, EventKind};

/// Host-provided key-value store that outlives one page but not the
/// browsing session.
pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
}

/// In-process session store.
#[derive(Default)]
pub struct MemorySessionStore {
    entries: DashMap<String, String>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
}

impl Session {
    fn generate() -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Reuse the id persisted under `key`, or create one and persist it.
    pub fn resolve(store: Option<&dyn SessionStore>, key: &str) -> Self {
        let Some(store) = store else {
            return Self::generate();
        };
        match store.get(key) {
            Some(id) if !id.is_empty() => Self { id },
            _ => {
                let session = Self::generate();
                store.set(key, &session.id);
                session
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Configured,
    ConsentGranted,
}

/// Configuration, consent and session state shared by the pipeline.
#[derive(Debug, Default)]
pub struct ConsentState {
    config: Option<Arc<CollectorConfig>>,
    granted: bool,
    session: Option<Session>,
}

impl ConsentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure(&mut self, config: Arc<CollectorConfig>) {
        info!(site_id = %config.site_id, "collector configured");
        self.config = Some(config);
    }

    pub fn config(&self) -> Option<&Arc<CollectorConfig>> {
        self.config.as_ref()
    }

    /// The configured, non-empty site id.
    pub fn site_id(&self) -> Option<&str> {
        self.config
            .as_deref()
            .filter(|c| c.has_site())
            .map(|c| c.site_id.as_str())
    }

    pub fn is_granted(&self) -> bool {
        self.granted
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn lifecycle(&self) -> Lifecycle {
        match (self.site_id(), self.granted) {
            (None, _) => Lifecycle::Uninitialized,
            (Some(_), false) => Lifecycle::Configured,
            (Some(_), true) => Lifecycle::ConsentGranted,
        }
    }

    /// Grant consent. Returns `true` only on the first call, which is also
    /// the only call that touches the session store.
    pub fn grant(&mut self, store: Option<&dyn SessionStore>) -> bool {
        let Some(key) = self.pending_grant_key() else {
            debug!("consent already granted");
            return false;
        };
        self.complete_grant(Session::resolve(store, &key))
    }

    /// Store key to resolve the session under, or `None` once consent is
    /// granted. First half of a grant split around the store I/O.
    pub fn pending_grant_key(&self) -> Option<String> {
        if self.granted {
            return None;
        }
        let key = self
            .config
            .as_deref()
            .map(|c| c.session_storage_key.as_str())
            .unwrap_or(DEFAULT_SESSION_STORAGE_KEY);
        Some(key.to_string())
    }

    /// Record consent with `session`. A no-op returning `false` when consent
    /// was already granted.
    pub fn complete_grant(&mut self, session: Session) -> bool {
        if self.granted {
            return false;
        }
        info!(session_id = %session.id, "consent granted");
        self.granted = true;
        self.session = Some(session);
        true
    }

    /// Admission policy for an event of `kind`.
    pub fn admit(&self, kind: EventKind) -> Result<(), DropReason> {
        let Some(config) = self.config.as_deref().filter(|c| c.has_site()) else {
            return Err(DropReason::SiteNotConfigured);
        };
        if self.granted || config.is_consent_exempt(kind) {
            Ok(())
        } else {
            Err(DropReason::ConsentRequired)
        }
    }
}
