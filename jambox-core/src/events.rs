//! Traffic events: cache staging and fan-out to observers.
//!
//! [`EventRecorder`] listens to the engine's lifecycle stream, moves cache
//! entries through stage/commit/abort, and publishes a JSON event per step
//! on the [`Broadcaster`]. Nothing here can fail a proxied exchange.

use crate::cache::{Cache, CacheKey};
use crate::config::JamboxConfig;
use crate::engine::{LifecycleEvent, LifecycleListener};
use crate::exchange::{
    encode_body, serialize_headers, AbortedRequest, BodyEncoding, CompletedResponse, InterceptedRequest, TimingEvents,
};
use crate::filter::CacheScope;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use hudsucker::hyper::HeaderMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub id: String,
    pub method: String,
    pub url: String,
    #[serde(serialize_with = "serialize_headers")]
    pub headers: HeaderMap,
    pub body: String,
    pub body_encoding: BodyEncoding,
    pub timing_events: TimingEvents,
    pub hash: CacheKey,
    pub cached: bool,
    pub staged: bool,
}

impl RequestPayload {
    pub fn new(request: &InterceptedRequest, hash: CacheKey, cached: bool, staged: bool) -> Self {
        let (body, body_encoding) = encode_body(&request.body);
        Self {
            id: request.id.clone(),
            method: request.method.clone(),
            url: request.url.to_string(),
            headers: request.headers.clone(),
            body,
            body_encoding,
            timing_events: request.timing.clone(),
            hash,
            cached,
            staged,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub id: String,
    pub status_code: u16,
    pub status_message: Option<String>,
    #[serde(serialize_with = "serialize_headers")]
    pub headers: HeaderMap,
    pub body: String,
    pub body_encoding: BodyEncoding,
    pub timing_events: TimingEvents,
}

impl From<&CompletedResponse> for ResponsePayload {
    fn from(response: &CompletedResponse) -> Self {
        let (body, body_encoding) = encode_body(&response.body);
        Self {
            id: response.id.clone(),
            status_code: response.status_code,
            status_message: response.status_message.clone(),
            headers: response.headers.clone(),
            body,
            body_encoding,
            timing_events: response.timing.clone(),
        }
    }
}

/// Wire shape: `{"type": "request"|"response"|"abort", "payload": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum BroadcastEvent {
    Request(RequestPayload),
    Response(ResponsePayload),
    Abort(AbortedRequest),
}

/// Single logical channel every connected observer subscribes to.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    sender: broadcast::Sender<String>,
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Serialize and fan out. Returns how many observers received it.
    pub fn publish(&self, event: &BroadcastEvent) -> Result<usize> {
        let message = serde_json::to_string(event)?;
        // No observers connected is not an error
        Ok(self.sender.send(message).unwrap_or(0))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Lifecycle listener that stages/commits/aborts cache entries and
/// publishes every exchange step.
pub struct EventRecorder {
    cache: Arc<Cache>,
    broadcaster: Broadcaster,
    scope: CacheScope,
    block_network_requests: bool,
}

impl EventRecorder {
    pub fn new(cache: Arc<Cache>, broadcaster: Broadcaster, config: &JamboxConfig) -> Self {
        Self {
            cache,
            broadcaster,
            scope: CacheScope::new(config.stage_list(), config.ignore_list()),
            block_network_requests: config.block_network_requests,
        }
    }

    fn should_stage(&self, request: &InterceptedRequest) -> bool {
        if self.cache.bypass() || self.block_network_requests {
            return false;
        }
        self.scope.allows(&request.host_and_path())
    }

    pub fn on_request(&self, request: &InterceptedRequest) -> Result<()> {
        let hash = CacheKey::of(request);
        let cached = self.cache.has(&hash);
        let staged = !cached && self.should_stage(request) && self.cache.stage(request);

        debug!(
            "Request [{}] {} cached={} staged={}",
            request.id, hash, cached, staged
        );

        let payload = RequestPayload::new(request, hash, cached, staged);
        self.broadcaster.publish(&BroadcastEvent::Request(payload))?;
        Ok(())
    }

    pub fn on_response(&self, response: &CompletedResponse) -> Result<()> {
        if !self.cache.bypass() && self.cache.has_staged(&response.id) {
            self.cache.commit(response);
        }

        self.broadcaster
            .publish(&BroadcastEvent::Response(ResponsePayload::from(response)))?;
        Ok(())
    }

    pub fn on_abort(&self, aborted: &AbortedRequest) -> Result<()> {
        if self.cache.has_staged(&aborted.id) {
            self.cache.abort(&aborted.id);
        }

        self.broadcaster
            .publish(&BroadcastEvent::Abort(aborted.clone()))?;
        Ok(())
    }
}

#[async_trait]
impl LifecycleListener for EventRecorder {
    async fn on_event(&self, event: &LifecycleEvent) {
        let (kind, result) = match event {
            LifecycleEvent::Request(request) => ("Request", self.on_request(request)),
            LifecycleEvent::Response(response) => ("Response", self.on_response(response)),
            LifecycleEvent::Abort(aborted) => ("Abort", self.on_abort(aborted)),
        };

        if let Err(e) = result {
            warn!("{} Event Error [{}]: {}", kind, event.id(), e);
        }
    }
}
