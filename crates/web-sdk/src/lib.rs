//! Client-side collection pipeline: event building, consent-gated
//! admission, batching, and at-least-once delivery to a collection endpoint.
//!
//! # Modules
//!
//! - [`events`]: Event and batch wire types, page context, per-call overrides
//! - [`builder`]: Stamps events with page context, session, UTM and dimensions
//! - [`consent`]: Consent gate, session creation, and the session store seam
//! - [`queue`]: FIFO queue with front re-queue and optional drop-oldest bound
//! - [`transport`]: Retrying HTTP delivery and the teardown beacon
//! - [`tracker`]: Host-facing API: configure, consent, track
//! - [`scheduler`]: Size, timer, and teardown flushes

pub mod builder;
pub mod consent;
pub mod events;
pub mod queue;
pub mod scheduler;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use consent::{Lifecycle, MemorySessionStore, Session, SessionStore};
pub use events::{Batch, Event, EventFields, PageContext};
pub use scheduler::{FlushMode, FlushOutcome};
pub use tracker::{Tracker, TrackerBuilder};
pub use transport::{
    Beacon, HttpBeacon, HttpIngestClient, IngestClient, PostMode, RetryPolicy, Transport,
    DEFAULT_KEEPALIVE_TIMEOUT,
};
