use thiserror::Error;

pub type CollectorResult<T> = Result<T, CollectorError>;

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for CollectorError {
    fn from(err: config::ConfigError) -> Self {
        CollectorError::Config(err.to_string())
    }
}

/// Failure to hand a batch to the collection endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("endpoint answered HTTP {0}")]
    Status(u16),

    #[error("network failure: {0}")]
    Network(String),

    #[error("no response within {0} ms")]
    Timeout(u64),

    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<DeliveryError>,
    },
}
