//! Request/response records observed by the interception engine

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hudsucker::hyper::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{ser::SerializeMap, Deserialize, Serialize, Serializer};
use tracing::warn;
use url::Url;
use uuid::Uuid;

/// Timing metadata of one exchange. Timestamps are milliseconds since `start_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingEvents {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_received_timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_sent_timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted_timestamp: Option<f64>,
}

impl TimingEvents {
    pub fn starting_now() -> Self {
        Self {
            start_time: Utc::now(),
            body_received_timestamp: None,
            response_sent_timestamp: None,
            aborted_timestamp: None,
        }
    }

    /// Milliseconds elapsed since the exchange started.
    pub fn elapsed_ms(&self) -> f64 {
        (Utc::now() - self.start_time).num_microseconds().unwrap_or(0) as f64 / 1000.0
    }
}

/// A request as seen by matchers, handlers and lifecycle listeners.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub id: String,
    pub method: String,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub timing: TimingEvents,
}

impl InterceptedRequest {
    pub fn new(method: impl Into<String>, url: Url) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            method: method.into(),
            url,
            headers: HeaderMap::new(),
            body: Vec::new(),
            timing: TimingEvents::starting_now(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        append_header(&mut self.headers, name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Hostname without port, empty for host-less URLs.
    pub fn hostname(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// `host + path`, the value cache stage/ignore globs are tested against.
    pub fn host_and_path(&self) -> String {
        format!("{}{}", self.hostname(), self.path())
    }

    pub fn aborted(&self) -> AbortedRequest {
        let mut timing = self.timing.clone();
        timing.aborted_timestamp = Some(timing.elapsed_ms());
        AbortedRequest {
            id: self.id.clone(),
            url: self.url.to_string(),
            headers: self.headers.clone(),
            timing,
        }
    }
}

/// A finished response, correlated to its request by `id`.
#[derive(Debug, Clone)]
pub struct CompletedResponse {
    pub id: String,
    pub status_code: u16,
    pub status_message: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub timing: TimingEvents,
}

impl CompletedResponse {
    pub fn new(id: impl Into<String>, status_code: u16) -> Self {
        Self {
            id: id.into(),
            status_code,
            status_message: None,
            headers: HeaderMap::new(),
            body: Vec::new(),
            timing: TimingEvents::starting_now(),
        }
    }

    /// Appends, so repeated names keep every value.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        append_header(&mut self.headers, name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// An exchange that ended before a response was delivered.
#[derive(Debug, Clone, Serialize)]
pub struct AbortedRequest {
    pub id: String,
    pub url: String,
    #[serde(serialize_with = "serialize_headers")]
    pub headers: HeaderMap,
    #[serde(flatten)]
    pub timing: TimingEvents,
}

fn append_header(headers: &mut HeaderMap, name: &str, value: &str) {
    match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
        (Ok(name), Ok(value)) => {
            headers.append(name, value);
        }
        _ => warn!("Skipping invalid header {}: {}", name, value),
    }
}

/// Headers as a JSON object; a repeated name maps to an array of its values.
pub(crate) fn serialize_headers<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(headers.keys_len()))?;
    for name in headers.keys() {
        let values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
            .collect();
        match values.as_slice() {
            [single] => map.serialize_entry(name.as_str(), single)?,
            _ => map.serialize_entry(name.as_str(), &values)?,
        }
    }
    map.end()
}

/// Render a body for JSON events: text when it is UTF-8, base64 otherwise.
pub(crate) fn encode_body(body: &[u8]) -> (String, BodyEncoding) {
    match std::str::from_utf8(body) {
        Ok(text) => (text.to_string(), BodyEncoding::Utf8),
        Err(_) => (STANDARD.encode(body), BodyEncoding::Base64),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BodyEncoding {
    Utf8,
    Base64,
}
