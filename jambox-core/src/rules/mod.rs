//! Prioritised matcher + handler rules and their compilation from config

pub mod compile;
pub mod handlers;
pub mod matchers;

pub use compile::{compile, forward, passthrough, record, stub};
pub use handlers::{
    CacheHandler, Disposition, Forwarding, Handler, PassThroughHandler, ProxyHandler,
    ResponseSource, StaticResponse, StubHandler, WebSocketForwardHandler, HASH_HEADER,
};
pub use matchers::{CacheMatcher, GlobMatcher, MatchTarget, Matcher};

use crate::exchange::InterceptedRequest;

/// Cache hits win over everything else.
pub const CACHE_PRIORITY: i32 = 100;
pub const FORWARD_PRIORITY: i32 = 99;
pub const STUB_PRIORITY: i32 = 99;
/// Default passthrough, only consulted when nothing more specific matched.
pub const PASSTHROUGH_PRIORITY: i32 = 98;

#[derive(Debug, Clone)]
pub struct Rule {
    pub priority: i32,
    pub matchers: Vec<Matcher>,
    pub handler: Handler,
}

impl Rule {
    pub fn new(priority: i32, matchers: Vec<Matcher>, handler: Handler) -> Self {
        Self {
            priority,
            matchers,
            handler,
        }
    }

    /// All matchers must accept, evaluated in order.
    pub async fn matches(&self, request: &InterceptedRequest) -> bool {
        for matcher in &self.matchers {
            if !matcher.matches(request).await {
                return false;
            }
        }
        true
    }

    /// Matcher explanations followed by the handler explanation.
    pub fn explain(&self) -> Vec<String> {
        self.matchers
            .iter()
            .map(Matcher::explain)
            .chain(std::iter::once(self.handler.explain()))
            .collect()
    }
}
