use crate::admin::Metrics;
use crate::engine::{LifecycleEvent, RuleEngine};
use crate::error::JamboxError;
use crate::exchange::{CompletedResponse, InterceptedRequest, TimingEvents};
use crate::rules::{Disposition, Forwarding, ResponseSource, StaticResponse};
use crate::upstream::UpstreamClient;
use crate::Result;
use hudsucker::{
    hyper::{
        self, ext::ReasonPhrase, header, http::request::Parts, Body, HeaderMap, Method, Request, Response,
        StatusCode, Uri, Version,
    },
    HttpContext, HttpHandler, RequestOrResponse,
};
use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use url::Url;

/// hudsucker adapter: feeds every intercepted exchange through the
/// [`RuleEngine`] and reports its lifecycle.
///
/// hudsucker clones the handler for each request, so `exchange` always
/// belongs to the request currently in flight on this clone. Forwarded
/// requests are sent with `client` directly, since hudsucker's own request
/// path drops the Host header.
pub struct InterceptHandler {
    engine: Arc<RuleEngine>,
    metrics: Arc<Metrics>,
    client: UpstreamClient,
    body_timeout: Duration,
    exchange: Option<Exchange>,
}

impl Clone for InterceptHandler {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            metrics: self.metrics.clone(),
            client: self.client.clone(),
            body_timeout: self.body_timeout,
            exchange: None,
        }
    }
}

impl InterceptHandler {
    pub fn new(engine: Arc<RuleEngine>, metrics: Arc<Metrics>, client: UpstreamClient, body_timeout: Duration) -> Self {
        Self {
            engine,
            metrics,
            client,
            body_timeout,
            exchange: None,
        }
    }

/// Decide the fate of one request.
    pub async fn intercept(&mut self, req: Request<Body>) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return RequestOrResponse::Request(req);
        }

        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);

        if is_websocket_upgrade(req.headers()) {
            return self.intercept_websocket(req).await;
        }

        let timing = TimingEvents::starting_now();
        let (parts, body) = req.into_parts();
        let body = match read_body(body, self.body_timeout).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to read request body for {}: {}", parts.uri, e);
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                return RequestOrResponse::Response(into_response(StaticResponse::failure(&e)));
            }
        };

        let mut request = match to_intercepted(&parts, body.clone()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting request {}: {}", parts.uri, e);
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                return RequestOrResponse::Response(into_response(StaticResponse::failure(&e)));
            }
        };
        request.timing = timing;
        request.timing.body_received_timestamp = Some(request.timing.elapsed_ms());

        info!("Request [{}] {} {}", request.id, request.method, request.url);
        self.engine
            .emit(LifecycleEvent::Request(request.clone()))
            .await;

        let disposition = self.engine.dispatch(&request).await;
        let exchange = Exchange::new(self.engine.clone(), request);

        match disposition {
            Ok(Disposition::Respond(response)) => {
                let counter = match response.source {
                    ResponseSource::Cache => &self.metrics.cache_hits,
                    ResponseSource::Stub => &self.metrics.stubbed,
                    ResponseSource::Engine => &self.metrics.failures,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                RequestOrResponse::Response(exchange.respond(response).await)
            }
            Ok(Disposition::Forward(forwarding)) => {
                match forward(Request::from_parts(parts, Body::from(body)), &forwarding) {
                    Ok(req) => {
                        debug!("Request [{}] forwarded to {}", exchange.request.id, forwarding.target_host);
                        self.metrics.forwarded.fetch_add(1, Ordering::Relaxed);
                        self.exchange = Some(exchange);
                        RequestOrResponse::Response(self.send_upstream(req).await)
                    }
                    Err(e) => {
                        error!("Request [{}] could not be forwarded: {}", exchange.request.id, e);
                        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                        RequestOrResponse::Response(exchange.respond(StaticResponse::failure(&e)).await)
                    }
                }
            }
            Ok(Disposition::PassThrough) => {
                self.metrics.passed_through.fetch_add(1, Ordering::Relaxed);
                self.exchange = Some(exchange);
                RequestOrResponse::Request(Request::from_parts(parts, Body::from(body)))
            }
            Ok(Disposition::Unmatched) => {
                self.metrics.unmatched.fetch_add(1, Ordering::Relaxed);
                RequestOrResponse::Response(exchange.respond(StaticResponse::unmatched()).await)
            }
            Err(e) => {
                error!("Request [{}] handler failed: {}", exchange.request.id, e);
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                RequestOrResponse::Response(exchange.respond(StaticResponse::failure(&e)).await)
            }
        }
    }

    /// Upgrades only consult the WebSocket rules and are not recorded.
    async fn intercept_websocket(&mut self, req: Request<Body>) -> RequestOrResponse {
        self.metrics.websocket_upgrades.fetch_add(1, Ordering::Relaxed);

        let (parts, body) = req.into_parts();
        let request = match to_intercepted(&parts, Vec::new()) {
            Ok(request) => request,
            Err(e) => {
                warn!("Passing through unparseable upgrade {}: {}", parts.uri, e);
                return RequestOrResponse::Request(Request::from_parts(parts, body));
            }
        };

        let req = Request::from_parts(parts, body);
        match self.engine.dispatch_websocket(&request).await {
            Ok(Disposition::Forward(forwarding)) => match forward(req, &forwarding) {
                Ok(req) => {
                    info!("WebSocket [{}] {} forwarded to {}", request.id, request.url, forwarding.target_host);
                    RequestOrResponse::Request(req)
                }
                Err(e) => {
                    error!("WebSocket [{}] could not be forwarded: {}", request.id, e);
                    RequestOrResponse::Response(into_response(StaticResponse::failure(&e)))
                }
            },
            Ok(_) => RequestOrResponse::Request(req),
            Err(e) => {
                error!("WebSocket [{}] handler failed: {}", request.id, e);
                RequestOrResponse::Response(into_response(StaticResponse::failure(&e)))
            }
        }
    }

    async fn send_upstream(&mut self, req: Request<Body>) -> Response<Body> {
        match self.client.request(req).await {
            Ok(res) => self.complete(res).await,
            Err(e) => {
                let e = JamboxError::Network(e.to_string());
                if let Some(exchange) = self.exchange.take() {
                    // Dropping the exchange reports the abort
                    error!("Request [{}] upstream failed: {}", exchange.request.id, e);
                }
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                into_response(StaticResponse::bad_gateway(&e))
            }
        }
    }

    /// Record the upstream response of the exchange in flight.
    pub async fn complete(&mut self, res: Response<Body>) -> Response<Body> {
        let Some(exchange) = self.exchange.take() else {
            return res;
        };

        let (parts, body) = res.into_parts();
        let body = match read_body(body, self.body_timeout).await {
            Ok(body) => body,
            Err(e) => {
                // Dropping the exchange reports the abort
                warn!("Response [{}] body could not be read: {}", exchange.request.id, e);
                self.metrics.failures.fetch_add(1, Ordering::Relaxed);
                return into_response(StaticResponse::bad_gateway(&e));
            }
        };

        let mut completed = CompletedResponse::new(exchange.request.id.clone(), parts.status.as_u16())
            .with_body(body.clone());
        completed.status_message = reason_phrase(&parts.status, &parts.extensions);
        completed.headers = parts.headers.clone();

        info!("Response [{}] status: {}", completed.id, completed.status_code);
        exchange.complete(completed).await;

        Response::from_parts(parts, Body::from(body))
    }
}

#[async_trait::async_trait]
impl HttpHandler for InterceptHandler {
    async fn handle_request(&mut self, _ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        self.intercept(req).await
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        self.complete(res).await
    }
}

/// One request awaiting its outcome. Dropped without completing, it
/// reports the request as aborted.
struct Exchange {
    engine: Arc<RuleEngine>,
    request: InterceptedRequest,
    completed: bool,
}

impl Exchange {
    fn new(engine: Arc<RuleEngine>, request: InterceptedRequest) -> Self {
        Self {
            engine,
            request,
            completed: false,
        }
    }

    async fn complete(mut self, mut response: CompletedResponse) {
        self.completed = true;
        response.timing = self.request.timing.clone();
        response.timing.response_sent_timestamp = Some(response.timing.elapsed_ms());
        self.engine.emit(LifecycleEvent::Response(response)).await;
    }

    async fn respond(self, response: StaticResponse) -> Response<Body> {
        let mut completed = CompletedResponse::new(self.request.id.clone(), response.status)
            .with_body(response.body.clone());
        completed.status_message = response.status_message.clone();
        completed.headers = response.headers.clone();

        debug!("Request [{}] answered with {}", completed.id, completed.status_code);
        self.complete(completed).await;
        into_response(response)
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        let aborted = self.request.aborted();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let engine = self.engine.clone();
                runtime.spawn(async move {
                    engine.emit(LifecycleEvent::Abort(aborted)).await;
                });
            }
            Err(_) => warn!("Request [{}] aborted outside a runtime, not reported", aborted.id),
        }
    }
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

async fn read_body(body: Body, limit: Duration) -> Result<Vec<u8>> {
    match timeout(limit, hyper::body::to_bytes(body)).await {
        Ok(Ok(bytes)) => Ok(bytes.to_vec()),
        Ok(Err(e)) => Err(JamboxError::Http(format!("body read failed: {}", e))),
        Err(_) => Err(JamboxError::Http(format!("body not received within {:?}", limit))),
    }
}

/// The upstream's own reason phrase when it sent a non-canonical one.
fn reason_phrase(status: &StatusCode, extensions: &hyper::http::Extensions) -> Option<String> {
    extensions
        .get::<ReasonPhrase>()
        .map(|reason| String::from_utf8_lossy(reason.as_bytes()).into_owned())
        .or_else(|| status.canonical_reason().map(str::to_string))
}

/// Absolute URL of a request, rebuilt from the Host header for origin-form URIs.
fn request_url(parts: &Parts) -> Result<Url> {
    let uri = &parts.uri;
    if uri.scheme().is_some() {
        let raw = uri.to_string();
        return Url::parse(&raw).map_err(|e| JamboxError::invalid_url(raw, e));
    }

    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| JamboxError::Http(format!("no host for {}", uri)))?;
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let raw = format!("http://{}{}", host, path);
    Url::parse(&raw).map_err(|e| JamboxError::invalid_url(raw, e))
}

fn to_intercepted(parts: &Parts, body: Vec<u8>) -> Result<InterceptedRequest> {
    let mut request = InterceptedRequest::new(parts.method.as_str(), request_url(parts)?).with_body(body);
    request.headers = parts.headers.clone();
    Ok(request)
}

/// Point a request at `forwarding.target_host`, keeping path and query.
fn forward(mut req: Request<Body>, forwarding: &Forwarding) -> Result<Request<Body>> {
    let target: Uri = forwarding
        .target_host
        .parse()
        .map_err(|e| JamboxError::invalid_url(forwarding.target_host.clone(), e))?;

    let scheme = match target.scheme_str() {
        Some("ws") | Some("http") | None => "http",
        Some("wss") | Some("https") => "https",
        Some(other) => {
            return Err(JamboxError::invalid_url(
                forwarding.target_host.clone(),
                format!("unsupported scheme {}", other),
            ))
        }
    };
    let authority = target
        .authority()
        .ok_or_else(|| JamboxError::invalid_url(forwarding.target_host.clone(), "missing host"))?;
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let uri = Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path)
        .build()
        .map_err(|e| JamboxError::Http(e.to_string()))?;
    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;

    if let Some(host) = &forwarding.update_host_header {
        let value = host
            .parse()
            .map_err(|_| JamboxError::Http(format!("invalid host header {}", host)))?;
        req.headers_mut().insert(header::HOST, value);
    }

    Ok(req)
}

fn into_response(response: StaticResponse) -> Response<Body> {
    let mut res = Response::new(Body::from(response.body));
    *res.status_mut() = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    *res.headers_mut() = response.headers;

    if let Some(message) = response.status_message {
        match ReasonPhrase::try_from(message) {
            Ok(reason) => {
                res.extensions_mut().insert(reason);
            }
            Err(e) => warn!("Sending canonical reason instead of status message: {}", e),
        }
    }
    res
}
