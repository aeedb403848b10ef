//! Handlers produce, or defer, the response for a matched request.
//!
//! A handler never touches the network itself: it returns a
//! [`Disposition`] that the interception engine carries out.

use crate::cache::{Cache, CacheKey};
use crate::config::ForwardRule;
use crate::error::JamboxError;
use crate::exchange::InterceptedRequest;
use crate::Result;
use hudsucker::hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use tracing::error;
use url::Url;

/// Diagnostic header carrying the cache key of a cache-served response.
pub const HASH_HEADER: &str = "x-jambox-hash";

/// What the engine should do with a matched request.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Answer directly without touching the network
    Respond(StaticResponse),
    /// Send upstream to a different host
    Forward(Forwarding),
    /// Send upstream untouched
    PassThrough,
    /// No rule applied
    Unmatched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Stub,
    Engine,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaticResponse {
    pub status: u16,
    pub status_message: Option<String>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub source: ResponseSource,
}

impl StaticResponse {
    /// Served when no rule matched (network requests blocked).
    pub fn unmatched() -> Self {
        Self {
            status: 503,
            status_message: Some("Service Unavailable".to_string()),
            headers: plain_text(),
            body: b"No rules were found matching this request".to_vec(),
            source: ResponseSource::Engine,
        }
    }

    /// Served when a handler failed.
    pub fn failure(err: &JamboxError) -> Self {
        Self {
            status: 500,
            status_message: Some("Internal Server Error".to_string()),
            headers: plain_text(),
            body: format!("Error: {}", err).into_bytes(),
            source: ResponseSource::Engine,
        }
    }

    /// Served when the upstream could not be reached or its response read.
    pub fn bad_gateway(err: &JamboxError) -> Self {
        Self {
            status: 502,
            status_message: Some("Bad Gateway".to_string()),
            ..Self::failure(err)
        }
    }
}

fn plain_text() -> HeaderMap {
    HeaderMap::from_iter([(CONTENT_TYPE, HeaderValue::from_static("text/plain"))])
}

/// Forwarding directive for the engine's upstream client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Forwarding {
    /// `scheme://host[:port]` receiving the request
    pub target_host: String,
    /// Overwrite the outbound Host header; `false` in explanations when unset
    #[serde(serialize_with = "host_or_false")]
    pub update_host_header: Option<String>,
}

fn host_or_false<S: Serializer>(value: &Option<String>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(host) => serializer.serialize_str(host),
        None => serializer.serialize_bool(false),
    }
}

/// `host[:port]`, omitting the scheme's default port.
pub(crate) fn host_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// Forwards to a remapped target host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyHandler {
    /// Hosts whose self-signed certificates are tolerated
    ignore_host_https_errors: Vec<String>,
    forwarding: Forwarding,
}

impl ProxyHandler {
    pub fn for_rule(rule: &ForwardRule) -> Self {
        let change_hosts = rule.change_hosts();
        let original_host = host_of(&rule.original);
        let target_host = host_of(&rule.target);
        let scheme = if rule.use_ssl() { "https" } else { "http" };

        Self {
            ignore_host_https_errors: vec![if change_hosts {
                target_host.clone()
            } else {
                original_host.clone()
            }],
            forwarding: Forwarding {
                target_host: format!("{}://{}", scheme, target_host),
                update_host_header: change_hosts.then_some(original_host),
            },
        }
    }

    pub fn trusted_hosts(&self) -> &[String] {
        &self.ignore_host_https_errors
    }

    pub fn forwarding(&self) -> &Forwarding {
        &self.forwarding
    }

    pub fn explain(&self) -> String {
        format!(
            "ProxyHandler {}",
            serde_json::to_string(self).unwrap_or_default()
        )
    }
}

/// Forwards a WebSocket upgrade to the target over `ws://`.
#[derive(Debug, Clone, PartialEq)]
pub struct WebSocketForwardHandler {
    target_host: String,
}

impl WebSocketForwardHandler {
    pub fn for_rule(rule: &ForwardRule) -> Self {
        Self {
            target_host: format!("ws://{}", host_of(&rule.target)),
        }
    }

    pub fn explain(&self) -> String {
        format!("forward the websocket to {}", self.target_host)
    }
}

/// Replays a committed response from the cache.
#[derive(Debug, Clone)]
pub struct CacheHandler {
    cache: Arc<Cache>,
}

impl CacheHandler {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }

    pub fn handle(&self, request: &InterceptedRequest) -> Result<StaticResponse> {
        let key = CacheKey::of(request);
        let Some(response) = self.cache.get(&key) else {
            error!("Cache entry {} vanished before [{}] could be served", key, request.id);
            return Err(JamboxError::CacheMiss(key.to_string()));
        };

        let mut headers = response.headers;
        match HeaderValue::from_str(key.as_str()) {
            Ok(hash) => {
                headers.insert(HASH_HEADER, hash);
            }
            Err(e) => error!("Cache key {} is not a header value: {}", key, e),
        }

        Ok(StaticResponse {
            status: response.status_code,
            status_message: response.status_message,
            headers,
            body: response.body,
            source: ResponseSource::Cache,
        })
    }
}

/// Answers with a fixed status and body.
#[derive(Debug, Clone, PartialEq)]
pub struct StubHandler {
    status: u16,
    status_message: String,
    body: Vec<u8>,
}

impl StubHandler {
    pub fn new(status: u16, status_message: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            status_message: status_message.into(),
            body,
        }
    }

    pub fn response(&self) -> StaticResponse {
        StaticResponse {
            status: self.status,
            status_message: Some(self.status_message.clone()),
            headers: HeaderMap::new(),
            body: self.body.clone(),
            source: ResponseSource::Stub,
        }
    }

    pub fn explain(&self) -> String {
        let mut explained = format!("respond with status {} ({})", self.status, self.status_message);
        if !self.body.is_empty() {
            explained.push_str(&format!(" and body \"{}\"", String::from_utf8_lossy(&self.body)));
        }
        explained
    }
}

/// Sends the request on to its original destination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassThroughHandler {
    trusted_hosts: Vec<String>,
}

impl PassThroughHandler {
    pub fn new(trusted_hosts: Vec<String>) -> Self {
        Self { trusted_hosts }
    }

    pub fn explain(&self) -> String {
        if self.trusted_hosts.is_empty() {
            "pass the request through to the target host".to_string()
        } else {
            format!(
                "pass the request through to the target host, trusting {}",
                self.trusted_hosts.join(", ")
            )
        }
    }
}

#[derive(Debug, Clone)]
pub enum Handler {
    Proxy(ProxyHandler),
    WebSocketForward(WebSocketForwardHandler),
    Cache(CacheHandler),
    Stub(StubHandler),
    PassThrough(PassThroughHandler),
}

impl Handler {
    pub async fn handle(&self, request: &InterceptedRequest) -> Result<Disposition> {
        match self {
            Handler::Proxy(handler) => Ok(Disposition::Forward(handler.forwarding.clone())),
            Handler::WebSocketForward(handler) => Ok(Disposition::Forward(Forwarding {
                target_host: handler.target_host.clone(),
                update_host_header: None,
            })),
            Handler::Cache(handler) => handler.handle(request).map(Disposition::Respond),
            Handler::Stub(handler) => Ok(Disposition::Respond(handler.response())),
            Handler::PassThrough(_) => Ok(Disposition::PassThrough),
        }
    }

    pub fn explain(&self) -> String {
        match self {
            Handler::Proxy(handler) => handler.explain(),
            Handler::WebSocketForward(handler) => handler.explain(),
            Handler::Cache(_) => "CacheHandler return a response from cache".to_string(),
            Handler::Stub(handler) => handler.explain(),
            Handler::PassThrough(handler) => handler.explain(),
        }
    }

    /// Hosts this handler tolerates self-signed certificates for.
    pub fn trusted_hosts(&self) -> &[String] {
        match self {
            Handler::Proxy(handler) => handler.trusted_hosts(),
            Handler::PassThrough(handler) => &handler.trusted_hosts,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ForwardValue;
    use crate::exchange::CompletedResponse;

    fn forward_rule(original: &str, target: &str) -> ForwardRule {
        ForwardRule::new(original, ForwardValue::Target(target.to_string()).into()).unwrap()
    }

    #[test]
    fn test_proxy_handler_changing_hosts() {
        let handler = ProxyHandler::for_rule(&forward_rule("http://a.com", "http://localhost:3000"));
        assert_eq!(handler.trusted_hosts(), &["localhost:3000".to_string()]);
        assert_eq!(handler.forwarding().target_host, "http://localhost:3000");
        assert_eq!(handler.forwarding().update_host_header.as_deref(), Some("a.com"));
    }

    #[test]
    fn test_proxy_handler_same_hostname_other_port() {
        let handler = ProxyHandler::for_rule(&forward_rule("http://a.com", "http://a.com:9000"));
        assert_eq!(handler.forwarding().target_host, "http://a.com:9000");
        assert_eq!(handler.forwarding().update_host_header, None);
        assert_eq!(handler.trusted_hosts(), &["a.com".to_string()]);
        assert_eq!(
            handler.explain(),
            r#"ProxyHandler {"ignoreHostHttpsErrors":["a.com"],"forwarding":{"targetHost":"http://a.com:9000","updateHostHeader":false}}"#
        );
    }

    #[test]
    fn test_proxy_handler_upgrades_to_https() {
        let handler = ProxyHandler::for_rule(&forward_rule("http://a.com", "https://staging.a.com"));
        assert_eq!(handler.forwarding().target_host, "https://staging.a.com");
    }

    #[test]
    fn test_websocket_forward_explain() {
        let handler = WebSocketForwardHandler::for_rule(&forward_rule("https://a.com", "https://localhost:3443"));
        assert_eq!(handler.explain(), "forward the websocket to ws://localhost:3443");
    }

    #[test]
    fn test_stub_explain() {
        assert_eq!(
            StubHandler::new(204, "jambox stub", Vec::new()).explain(),
            "respond with status 204 (jambox stub)"
        );
        assert_eq!(
            StubHandler::new(200, "OK", b"{}".to_vec()).explain(),
            "respond with status 200 (OK) and body \"{}\""
        );
    }

    #[tokio::test]
    async fn test_cache_handler_serves_committed_response() {
        let cache = Arc::new(Cache::new());
        let request = InterceptedRequest::new("GET", Url::parse("http://a.com/x").unwrap());
        cache.stage(&request);
        cache.commit(
            &CompletedResponse::new(request.id.clone(), 201)
                .with_header("content-type", "application/json")
                .with_body("{\"cached\":true}"),
        );

        let handler = Handler::Cache(CacheHandler::new(cache));
        let replay = InterceptedRequest::new("GET", Url::parse("http://a.com/x").unwrap());
        let Disposition::Respond(response) = handler.handle(&replay).await.unwrap() else {
            panic!("expected a cached response");
        };

        assert_eq!(response.status, 201);
        assert_eq!(response.body, b"{\"cached\":true}");
        assert_eq!(response.source, ResponseSource::Cache);
        assert_eq!(response.headers.get("content-type").unwrap(), "application/json");
        assert_eq!(
            response.headers.get(HASH_HEADER).unwrap(),
            CacheKey::of(&replay).as_str()
        );
    }

    #[tokio::test]
    async fn test_cache_handler_miss_is_an_error() {
        let handler = Handler::Cache(CacheHandler::new(Arc::new(Cache::new())));
        let request = InterceptedRequest::new("GET", Url::parse("http://a.com/x").unwrap());
        let err = handler.handle(&request).await.unwrap_err();
        assert!(matches!(err, JamboxError::CacheMiss(key) if key == CacheKey::of(&request).to_string()));
    }

    #[tokio::test]
    async fn test_passthrough_disposition() {
        let handler = Handler::PassThrough(PassThroughHandler::new(vec!["dev.local".into()]));
        let request = InterceptedRequest::new("GET", Url::parse("http://a.com/").unwrap());
        assert_eq!(handler.handle(&request).await.unwrap(), Disposition::PassThrough);
        assert_eq!(handler.trusted_hosts(), &["dev.local".to_string()]);
    }
}
