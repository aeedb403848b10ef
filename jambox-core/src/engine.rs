//! Interception engine contract and the in-process rule engine.
//!
//! Rules are kept in descending priority order (registration order within
//! a priority). For a request the first rule whose matchers all accept
//! decides its [`Disposition`].

use crate::exchange::{AbortedRequest, CompletedResponse, InterceptedRequest};
use crate::rules::{Disposition, Rule};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Lifecycle of one intercepted exchange. A `Request` is always followed by
/// exactly one of `Response` or `Abort` for the same id.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Request(InterceptedRequest),
    Response(CompletedResponse),
    Abort(AbortedRequest),
}

impl LifecycleEvent {
    pub fn id(&self) -> &str {
        match self {
            LifecycleEvent::Request(request) => &request.id,
            LifecycleEvent::Response(response) => &response.id,
            LifecycleEvent::Abort(aborted) => &aborted.id,
        }
    }
}

/// Observer of lifecycle events. Listeners handle their own failures.
#[async_trait]
pub trait LifecycleListener: Send + Sync {
    async fn on_event(&self, event: &LifecycleEvent);
}

/// What the rule compiler needs from an interception engine.
#[async_trait]
pub trait InterceptionEngine: Send + Sync {
    async fn add_request_rule(&self, rule: Rule) -> Result<()>;

    async fn add_websocket_rule(&self, rule: Rule) -> Result<()>;

    async fn subscribe(&self, listener: Arc<dyn LifecycleListener>);
}

#[derive(Default)]
pub struct RuleEngine {
    request_rules: RwLock<Vec<Arc<Rule>>>,
    websocket_rules: RwLock<Vec<Arc<Rule>>>,
    listeners: RwLock<Vec<Arc<dyn LifecycleListener>>>,
}

impl RuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide what to do with an HTTP request.
    pub async fn dispatch(&self, request: &InterceptedRequest) -> Result<Disposition> {
        let rules = self.request_rules.read().await.clone();
        match first_match(&rules, request).await {
            Some(rule) => rule.handler.handle(request).await,
            None => {
                debug!("No rule matched [{}] {}", request.id, request.url);
                Ok(Disposition::Unmatched)
            }
        }
    }

    /// Decide what to do with a WebSocket upgrade. Unmatched upgrades pass through.
    pub async fn dispatch_websocket(&self, request: &InterceptedRequest) -> Result<Disposition> {
        let rules = self.websocket_rules.read().await.clone();
        match first_match(&rules, request).await {
            Some(rule) => rule.handler.handle(request).await,
            None => Ok(Disposition::PassThrough),
        }
    }

    /// Deliver an event to every listener, in subscription order.
    pub async fn emit(&self, event: LifecycleEvent) {
        let listeners = self.listeners.read().await.clone();
        for listener in listeners {
            listener.on_event(&event).await;
        }
    }

    /// Each HTTP rule flattened into matcher explanations then handler explanation.
    pub async fn explain_rules(&self) -> Vec<String> {
        explain(&self.request_rules.read().await)
    }

    pub async fn explain_websocket_rules(&self) -> Vec<String> {
        explain(&self.websocket_rules.read().await)
    }

    pub async fn priorities(&self) -> Vec<i32> {
        self.request_rules
            .read()
            .await
            .iter()
            .map(|rule| rule.priority)
            .collect()
    }

    pub async fn rule_count(&self) -> usize {
        self.request_rules.read().await.len() + self.websocket_rules.read().await.len()
    }

    pub async fn listener_count(&self) -> usize {
        self.listeners.read().await.len()
    }

    /// Every host some registered rule tolerates self-signed certificates for.
    pub async fn trusted_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .request_rules
            .read()
            .await
            .iter()
            .flat_map(|rule| rule.handler.trusted_hosts().iter().cloned())
            .collect();
        hosts.sort();
        hosts.dedup();
        hosts
    }
}

async fn first_match<'a>(rules: &'a [Arc<Rule>], request: &InterceptedRequest) -> Option<&'a Rule> {
    for rule in rules {
        if rule.matches(request).await {
            debug!(
                "Rule (priority {}) matched [{}]: {}",
                rule.priority,
                request.id,
                rule.handler.explain()
            );
            return Some(rule.as_ref());
        }
    }
    None
}

fn explain(rules: &[Arc<Rule>]) -> Vec<String> {
    rules.iter().flat_map(|rule| rule.explain()).collect()
}

fn insert_by_priority(rules: &mut Vec<Arc<Rule>>, rule: Rule) {
    let position = rules
        .iter()
        .position(|existing| existing.priority < rule.priority)
        .unwrap_or(rules.len());
    rules.insert(position, Arc::new(rule));
}

#[async_trait]
impl InterceptionEngine for RuleEngine {
    async fn add_request_rule(&self, rule: Rule) -> Result<()> {
        insert_by_priority(&mut *self.request_rules.write().await, rule);
        Ok(())
    }

    async fn add_websocket_rule(&self, rule: Rule) -> Result<()> {
        insert_by_priority(&mut *self.websocket_rules.write().await, rule);
        Ok(())
    }

    async fn subscribe(&self, listener: Arc<dyn LifecycleListener>) {
        self.listeners.write().await.push(listener);
    }
}
