//! Turns a [`JamboxConfig`] into prioritised rules on an interception engine.

use super::{
    CacheHandler, CacheMatcher, GlobMatcher, Handler, MatchTarget, PassThroughHandler,
    ProxyHandler, Rule, StubHandler, WebSocketForwardHandler, CACHE_PRIORITY, FORWARD_PRIORITY,
    PASSTHROUGH_PRIORITY, STUB_PRIORITY,
};
use crate::cache::Cache;
use crate::config::JamboxConfig;
use crate::engine::InterceptionEngine;
use crate::events::{Broadcaster, EventRecorder};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

/// Default rule: anything nothing else claimed goes to the real network.
pub async fn passthrough<E>(engine: &E, config: &JamboxConfig) -> Result<()>
where
    E: InterceptionEngine + ?Sized,
{
    let handler = PassThroughHandler::new(config.trust.clone());
    engine
        .add_request_rule(Rule::new(
            PASSTHROUGH_PRIORITY,
            Vec::new(),
            Handler::PassThrough(handler),
        ))
        .await
}

/// Serve committed cache entries ahead of every other rule.
pub async fn record<E>(engine: &E, cache: Arc<Cache>, config: &JamboxConfig) -> Result<()>
where
    E: InterceptionEngine + ?Sized,
{
    let matcher = CacheMatcher::new(cache.clone(), config.cache.clone().unwrap_or_default());
    engine
        .add_request_rule(Rule::new(
            CACHE_PRIORITY,
            vec![matcher.into()],
            Handler::Cache(CacheHandler::new(cache)),
        ))
        .await
}

pub async fn forward<E>(engine: &E, config: &JamboxConfig) -> Result<()>
where
    E: InterceptionEngine + ?Sized,
{
    for rule in config.forward_rules()? {
        let matcher = GlobMatcher::new(MatchTarget::Origin(rule.original.clone()), rule.paths.clone());
        debug!("Forwarding {} -> {}", rule.original, rule.target);

        engine
            .add_request_rule(Rule::new(
                FORWARD_PRIORITY,
                vec![matcher.clone().into()],
                Handler::Proxy(ProxyHandler::for_rule(&rule)),
            ))
            .await?;

        if rule.websocket {
            engine
                .add_websocket_rule(Rule::new(
                    FORWARD_PRIORITY,
                    vec![matcher.into()],
                    Handler::WebSocketForward(WebSocketForwardHandler::for_rule(&rule)),
                ))
                .await?;
        }
    }
    Ok(())
}

pub async fn stub<E>(engine: &E, config: &JamboxConfig) -> Result<()>
where
    E: InterceptionEngine + ?Sized,
{
    for rule in config.stub_rules()? {
        if rule.prefer_network && !config.block_network_requests {
            debug!("Stub {} skipped, network preferred", rule.path);
            continue;
        }

        let handler = StubHandler::new(rule.status, rule.status_message.clone(), rule.load_body()?);
        engine
            .add_request_rule(Rule::new(
                STUB_PRIORITY,
                vec![GlobMatcher::new(MatchTarget::Any, vec![rule.path.clone()]).into()],
                Handler::Stub(handler),
            ))
            .await?;
    }
    Ok(())
}

/// Register every rule the configuration describes and start recording.
///
/// Forward and stub entries are validated before anything is registered,
/// so a malformed config leaves the engine untouched.
pub async fn compile<E>(
    engine: &E,
    cache: Arc<Cache>,
    broadcaster: Broadcaster,
    config: &JamboxConfig,
) -> Result<()>
where
    E: InterceptionEngine + ?Sized,
{
    config.forward_rules()?;
    config.stub_rules()?;

    if !config.block_network_requests {
        passthrough(engine, config).await?;
    }

    if config.paused {
        info!("Proxy paused, only passthrough rules registered");
        return Ok(());
    }

    let recorder = EventRecorder::new(cache.clone(), broadcaster, config);
    engine.subscribe(Arc::new(recorder)).await;

    record(engine, cache, config).await?;

    if config.forward.is_some() {
        forward(engine, config).await?;
    }

    if config.stub.is_some() {
        stub(engine, config).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RuleEngine;
    use crate::error::JamboxError;
    use crate::exchange::InterceptedRequest;
    use crate::rules::Disposition;
    use url::Url;

    async fn compiled(raw: &str) -> (RuleEngine, Arc<Cache>) {
        let engine = RuleEngine::new();
        let cache = Arc::new(Cache::new());
        let config = JamboxConfig::from_json(raw).unwrap();
        compile(&engine, cache.clone(), Broadcaster::new(8), &config)
            .await
            .unwrap();
        (engine, cache)
    }

    fn get(url: &str) -> InterceptedRequest {
        InterceptedRequest::new("GET", Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_forward_rule_explanations() {
        let engine = RuleEngine::new();
        let config = JamboxConfig::from_json(
            r#"{ "forward": { "http://google.com": { "target": "http://localhost:3000", "websocket": true } } }"#,
        )
        .unwrap();
        forward(&engine, &config).await.unwrap();

        assert_eq!(
            engine.explain_rules().await,
            vec![
                r#"GlobMatcher {"target":"http://google.com/","paths":["**"]}"#,
                r#"ProxyHandler {"ignoreHostHttpsErrors":["localhost:3000"],"forwarding":{"targetHost":"http://localhost:3000","updateHostHeader":"google.com"}}"#,
            ]
        );
        assert_eq!(
            engine.explain_websocket_rules().await,
            vec![
                r#"GlobMatcher {"target":"http://google.com/","paths":["**"]}"#,
                "forward the websocket to ws://localhost:3000",
            ]
        );
    }

    #[tokio::test]
    async fn test_forward_without_websocket_registers_http_only() {
        let engine = RuleEngine::new();
        let config =
            JamboxConfig::from_json(r#"{ "forward": { "http://a.com": "http://localhost:3000" } }"#).unwrap();
        forward(&engine, &config).await.unwrap();

        assert_eq!(engine.rule_count().await, 1);
        assert!(engine.explain_websocket_rules().await.is_empty());
    }

    #[tokio::test]
    async fn test_record_rule_explanations() {
        let engine = RuleEngine::new();
        let config = JamboxConfig::from_json(r#"{ "cache": { "stage": ["**"] } }"#).unwrap();
        record(&engine, Arc::new(Cache::new()), &config).await.unwrap();

        assert_eq!(
            engine.explain_rules().await,
            vec![
                r#"CacheMatcher {"stage":["**"]}"#,
                "CacheHandler return a response from cache",
            ]
        );
    }

    #[tokio::test]
    async fn test_stub_rule_explanations() {
        let engine = RuleEngine::new();
        let config = JamboxConfig::from_json(r#"{ "stub": { "**.jpg": 204 } }"#).unwrap();
        stub(&engine, &config).await.unwrap();

        assert_eq!(
            engine.explain_rules().await,
            vec![
                r#"GlobMatcher {"target":"*","paths":["**.jpg"]}"#,
                "respond with status 204 (jambox stub)",
            ]
        );
    }

    #[tokio::test]
    async fn test_stub_responses() {
        let (engine, _) = compiled(
            r#"{ "blockNetworkRequests": true, "stub": { "**.jpg": 204, "**/api": { "status": 200 } } }"#,
        )
        .await;

        let Disposition::Respond(image) = engine.dispatch(&get("http://a.com/img/cat.jpg")).await.unwrap() else {
            panic!("expected stub response");
        };
        assert_eq!(image.status, 204);
        assert_eq!(image.status_message.as_deref(), Some("jambox stub"));
        assert!(image.body.is_empty());

        let Disposition::Respond(api) = engine.dispatch(&get("http://b.com/v1/api")).await.unwrap() else {
            panic!("expected stub response");
        };
        assert_eq!(api.status, 200);

        assert_eq!(
            engine.dispatch(&get("http://b.com/other")).await.unwrap(),
            Disposition::Unmatched
        );
    }

    #[tokio::test]
    async fn test_prefer_network_stub_only_when_blocked() {
        let raw = r#"{ "stub": { "**/api": { "status": 200, "preferNetwork": true } } }"#;
        let (engine, _) = compiled(raw).await;
        assert_eq!(
            engine.dispatch(&get("http://a.com/api")).await.unwrap(),
            Disposition::PassThrough
        );

        let raw = r#"{ "blockNetworkRequests": true, "stub": { "**/api": { "status": 200, "preferNetwork": true } } }"#;
        let (engine, _) = compiled(raw).await;
        assert!(matches!(
            engine.dispatch(&get("http://a.com/api")).await.unwrap(),
            Disposition::Respond(_)
        ));
    }

    #[tokio::test]
    async fn test_compile_order_and_priorities() {
        let (engine, _) = compiled(
            r#"{
                "trust": ["dev.local"],
                "cache": { "stage": ["**"] },
                "forward": { "http://a.com": "http://localhost:3000" },
                "stub": { "**.jpg": 204 }
            }"#,
        )
        .await;

        assert_eq!(engine.priorities().await, vec![100, 99, 99, 98]);
        assert_eq!(engine.listener_count().await, 1);
        assert_eq!(engine.trusted_hosts().await, vec!["dev.local", "localhost:3000"]);
    }

    #[tokio::test]
    async fn test_blocked_network_has_no_passthrough() {
        let (engine, _) = compiled(r#"{ "blockNetworkRequests": true }"#).await;
        assert_eq!(engine.priorities().await, vec![CACHE_PRIORITY]);
        assert_eq!(
            engine.dispatch(&get("http://a.com/")).await.unwrap(),
            Disposition::Unmatched
        );
    }

    #[tokio::test]
    async fn test_paused_registers_passthrough_only() {
        let (engine, _) = compiled(
            r#"{ "paused": true, "cache": { "stage": ["**"] }, "stub": { "**": 204 } }"#,
        )
        .await;

        assert_eq!(engine.priorities().await, vec![PASSTHROUGH_PRIORITY]);
        assert_eq!(engine.listener_count().await, 0);
    }

    #[tokio::test]
    async fn test_invalid_config_registers_nothing() {
        let engine = RuleEngine::new();
        let config = JamboxConfig::from_json(
            r#"{ "forward": { "http://a.com": "http://localhost:3000" }, "stub": { "**": 7 } }"#,
        )
        .unwrap();

        let err = compile(&engine, Arc::new(Cache::new()), Broadcaster::new(8), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, JamboxError::Configuration(_)));
        assert_eq!(engine.rule_count().await, 0);
        assert_eq!(engine.listener_count().await, 0);
    }
}
