//! Request predicates deciding whether a rule applies

use crate::cache::{Cache, CacheKey};
use crate::config::CacheConfig;
use crate::exchange::InterceptedRequest;
use crate::filter::{CacheScope, PathGlobs};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Host condition of a [`GlobMatcher`].
#[derive(Debug, Clone, PartialEq)]
pub enum MatchTarget {
    /// Any host
    Any,
    /// Only requests whose hostname equals this URL's hostname
    Origin(Url),
}

impl MatchTarget {
    fn accepts(&self, request: &InterceptedRequest) -> bool {
        match self {
            MatchTarget::Any => true,
            MatchTarget::Origin(url) => url.host_str() == Some(request.hostname()),
        }
    }
}

impl fmt::Display for MatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchTarget::Any => f.write_str("*"),
            MatchTarget::Origin(url) => f.write_str(url.as_str()),
        }
    }
}

/// Matches on host and a conjunctive path glob list.
#[derive(Debug, Clone)]
pub struct GlobMatcher {
    target: MatchTarget,
    paths: PathGlobs,
}

impl GlobMatcher {
    pub fn new(target: MatchTarget, paths: Vec<String>) -> Self {
        Self {
            target,
            paths: PathGlobs::new(paths),
        }
    }

    pub fn matches(&self, request: &InterceptedRequest) -> bool {
        self.target.accepts(request) && self.paths.matches(request.path())
    }

    pub fn explain(&self) -> String {
        #[derive(Serialize)]
        struct Explained<'a> {
            target: String,
            paths: &'a PathGlobs,
        }

        let explained = Explained {
            target: self.target.to_string(),
            paths: &self.paths,
        };
        format!(
            "GlobMatcher {}",
            serde_json::to_string(&explained).unwrap_or_default()
        )
    }
}

/// Matches requests that are in cache scope and already committed.
#[derive(Debug, Clone)]
pub struct CacheMatcher {
    cache: Arc<Cache>,
    options: CacheConfig,
    scope: CacheScope,
}

impl CacheMatcher {
    pub fn new(cache: Arc<Cache>, options: CacheConfig) -> Self {
        let scope = CacheScope::new(
            options.stage.clone().unwrap_or_default(),
            options.ignore.clone().unwrap_or_default(),
        );
        Self {
            cache,
            options,
            scope,
        }
    }

    pub async fn matches(&self, request: &InterceptedRequest) -> bool {
        if self.cache.bypass() {
            return false;
        }

        if !self.scope.allows(&request.host_and_path()) {
            return false;
        }

        self.cache.has(&CacheKey::of(request))
    }

    pub fn explain(&self) -> String {
        format!(
            "CacheMatcher {}",
            serde_json::to_string(&self.options).unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Glob(GlobMatcher),
    Cache(CacheMatcher),
}

impl Matcher {
    pub async fn matches(&self, request: &InterceptedRequest) -> bool {
        match self {
            Matcher::Glob(matcher) => matcher.matches(request),
            Matcher::Cache(matcher) => matcher.matches(request).await,
        }
    }

    pub fn explain(&self) -> String {
        match self {
            Matcher::Glob(matcher) => matcher.explain(),
            Matcher::Cache(matcher) => matcher.explain(),
        }
    }
}

impl From<GlobMatcher> for Matcher {
    fn from(matcher: GlobMatcher) -> Self {
        Matcher::Glob(matcher)
    }
}

impl From<CacheMatcher> for Matcher {
    fn from(matcher: CacheMatcher) -> Self {
        Matcher::Cache(matcher)
    }
}
