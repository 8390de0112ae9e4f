//! Event builder: stamps raw events with timestamp, page context, session,
//! UTM parameters, and custom dimensions.

use std::collections::BTreeMap;

use chrono::Utc;
use url::Url;
use uuid::Uuid;

use sitepulse_core::{EventKind, Scalar};

use crate::events::{Event, EventFields, PageContext};

/// Query keys copied into `Event::utm` when present.
pub const UTM_KEYS: [&str; 5] = [
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
];

/// Read-only view of the context an event is stamped from.
#[derive(Debug, Clone, Copy)]
pub struct EventBuilder<'a> {
    pub site_id: &'a str,
    pub page: &'a PageContext,
    pub session_id: Option<&'a str>,
    pub dimensions: &'a BTreeMap<String, Scalar>,
}

impl<'a> EventBuilder<'a> {
    pub fn build(&self, kind: EventKind, fields: EventFields) -> Event {
        let page_url = self.page.url.as_str();

        Event {
            id: Uuid::new_v4(),
            kind,
            timestamp: Utc::now(),
            url: fields.url.unwrap_or_else(|| page_url.to_string()),
            title: fields.title.or_else(|| self.page.title.clone()),
            referrer: fields.referrer.or_else(|| self.page.referrer.clone()),
            site_id: self.site_id.to_string(),
            session_id: self.session_id.map(str::to_string),
            // Campaign attribution comes from the page the visitor landed on,
            // not from a per-call url override.
            utm: parse_utm(page_url),
            custom_dimensions: self.dimensions.clone(),
            payload: fields.payload,
        }
    }
}

/// Extract the UTM parameters present in `url`'s query string. Unparseable
/// URLs yield no parameters.
pub fn parse_utm(url: &str) -> BTreeMap<String, String> {
    let Ok(parsed) = Url::parse(url) else {
        return BTreeMap::new();
    };

    let mut utm = BTreeMap::new();
    for (key, value) in parsed.query_pairs() {
        if UTM_KEYS.contains(&key.as_ref()) {
            utm.entry(key.into_owned()).or_insert_with(|| value.into_owned());
        }
    }
    utm
}
