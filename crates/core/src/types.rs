use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of behavioral event captured by the tracker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PageView,
    Event,
    Goal,
    Ecommerce,
    Scroll,
    Heatmap,
    Error,
    Performance,
    Engagement,
}

impl EventKind {
    /// Kinds admitted before consent unless configured otherwise. These carry
    /// no identifying data.
    pub const DEFAULT_CONSENT_EXEMPT: [EventKind; 3] = [
        EventKind::PageView,
        EventKind::Performance,
        EventKind::Engagement,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PageView => "page_view",
            EventKind::Event => "event",
            EventKind::Goal => "goal",
            EventKind::Ecommerce => "ecommerce",
            EventKind::Scroll => "scroll",
            EventKind::Heatmap => "heatmap",
            EventKind::Error => "error",
            EventKind::Performance => "performance",
            EventKind::Engagement => "engagement",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar value of a custom dimension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Number(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Number(value as f64)
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Scalar::Bool(value)
    }
}

/// Result of the fire-and-forget delivery used at teardown. Consumed only by
/// diagnostics; never feeds a retry path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BeaconOutcome {
    /// The primitive exists and was invoked; `accepted` is what it reported.
    Attempted { accepted: bool },
    /// The host offers no beacon primitive.
    NotAvailable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&EventKind::PageView).unwrap();
        assert_eq!(json, "\"page_view\"");
        let parsed: EventKind = serde_json::from_str("\"ecommerce\"").unwrap();
        assert_eq!(parsed, EventKind::Ecommerce);
        assert_eq!(EventKind::Heatmap.to_string(), "heatmap");
    }

    #[test]
    fn test_scalar_untagged() {
        let dims = vec![Scalar::from("pro"), Scalar::from(3_i64), Scalar::from(true)];
        let json = serde_json::to_string(&dims).unwrap();
        assert_eq!(json, r#"["pro",3.0,true]"#);
    }
}
