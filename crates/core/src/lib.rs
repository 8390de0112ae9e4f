pub mod config;
pub mod diagnostics;
pub mod error;
pub mod types;

pub use config::CollectorConfig;
pub use diagnostics::{Diagnostic, DiagnosticsSink, DropReason};
pub use error::{CollectorError, CollectorResult, DeliveryError};
pub use types::{BeaconOutcome, EventKind, Scalar};
