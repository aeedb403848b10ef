use jambox_core::engine::{LifecycleEvent, RuleEngine};
use jambox_core::rules::{compile, Disposition, ResponseSource, HASH_HEADER};
use jambox_core::{Broadcaster, Cache, CacheKey, CompletedResponse, EntryState, InterceptedRequest, JamboxConfig};
use std::sync::Arc;
use url::Url;

const OVERLAPPING: &str = r#"{
    "cache": { "stage": ["a.com/**"] },
    "forward": { "http://a.com": { "target": "http://localhost:3000", "paths": ["/api/**"] } },
    "stub": { "**/health": 204 }
}"#;

async fn compiled(raw: &str) -> (Arc<RuleEngine>, Arc<Cache>, Broadcaster) {
    let engine = Arc::new(RuleEngine::new());
    let cache = Arc::new(Cache::new());
    let broadcaster = Broadcaster::new(32);
    let config = JamboxConfig::from_json(raw).unwrap();
    compile(engine.as_ref(), cache.clone(), broadcaster.clone(), &config)
        .await
        .unwrap();
    (engine, cache, broadcaster)
}

fn get(url: &str) -> InterceptedRequest {
    InterceptedRequest::new("GET", Url::parse(url).unwrap())
}

/// Drive one exchange through the engine the way the proxy adapter does.
async fn exchange(engine: &RuleEngine, request: &InterceptedRequest, upstream: Option<CompletedResponse>) -> Disposition {
    engine.emit(LifecycleEvent::Request(request.clone())).await;
    let disposition = engine.dispatch(request).await.unwrap();
    match (&disposition, upstream) {
        (Disposition::Respond(response), _) => {
            let completed = CompletedResponse::new(request.id.clone(), response.status);
            engine.emit(LifecycleEvent::Response(completed)).await;
        }
        (_, Some(response)) => engine.emit(LifecycleEvent::Response(response)).await,
        (_, None) => engine.emit(LifecycleEvent::Abort(request.aborted())).await,
    }
    disposition
}

#[tokio::test]
async fn test_forward_then_cache_takes_over() {
    let (engine, cache, _) = compiled(OVERLAPPING).await;

    let first = get("http://a.com/api/users");
    let upstream = CompletedResponse::new(first.id.clone(), 200).with_body("[1,2,3]");
    let Disposition::Forward(forwarding) = exchange(&engine, &first, Some(upstream)).await else {
        panic!("first request should be forwarded");
    };
    assert_eq!(forwarding.target_host, "http://localhost:3000");
    assert_eq!(forwarding.update_host_header.as_deref(), Some("a.com"));

    let key = CacheKey::of(&first);
    assert_eq!(cache.state(&key), Some(EntryState::Committed));

    let replay = get("http://a.com/api/users");
    let Disposition::Respond(response) = exchange(&engine, &replay, None).await else {
        panic!("replay should come from cache");
    };
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.body, b"[1,2,3]");
    assert_eq!(response.headers[HASH_HEADER], key.as_str());
}

#[tokio::test]
async fn test_stub_and_default_passthrough() {
    let (engine, _, _) = compiled(OVERLAPPING).await;

    let Disposition::Respond(response) = engine.dispatch(&get("http://b.com/status/health")).await.unwrap() else {
        panic!("stub expected");
    };
    assert_eq!(response.status, 204);
    assert_eq!(response.source, ResponseSource::Stub);

    assert_eq!(
        engine.dispatch(&get("http://a.com/about")).await.unwrap(),
        Disposition::PassThrough
    );
    assert_eq!(
        engine.dispatch(&get("http://other.com/api/users")).await.unwrap(),
        Disposition::PassThrough
    );
}

#[tokio::test]
async fn test_aborted_exchange_leaves_no_entry() {
    let (engine, cache, broadcaster) = compiled(OVERLAPPING).await;
    let mut events = broadcaster.subscribe();

    let request = get("http://a.com/about");
    assert_eq!(exchange(&engine, &request, None).await, Disposition::PassThrough);
    assert_eq!(cache.state(&CacheKey::of(&request)), None);
    assert_eq!(cache.staged_len(), 0);

    let kinds: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
        .map(|raw| {
            let event: serde_json::Value = serde_json::from_str(&raw).unwrap();
            event["type"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["request", "abort"]);
}

#[tokio::test]
async fn test_bypass_disables_replay_and_recording() {
    let (engine, cache, _) = compiled(OVERLAPPING).await;

    let first = get("http://a.com/about");
    let upstream = CompletedResponse::new(first.id.clone(), 200);
    exchange(&engine, &first, Some(upstream)).await;
    assert_eq!(cache.len(), 1);

    cache.set_bypass(true);
    assert_eq!(
        engine.dispatch(&get("http://a.com/about")).await.unwrap(),
        Disposition::PassThrough
    );

    let fresh = get("http://a.com/contact");
    let upstream = CompletedResponse::new(fresh.id.clone(), 200);
    exchange(&engine, &fresh, Some(upstream)).await;
    assert_eq!(cache.len(), 1);
}
