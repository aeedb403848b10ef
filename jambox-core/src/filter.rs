//! Glob matching over request paths and `host/path` strings.
//!
//! Patterns use wildmatch semantics (`*` matches any run of characters,
//! including `/`, and `?` a single character). A `/**/` segment may also
//! collapse to a single `/`, so `/**/*` matches `/index.html`.

use serde::Serialize;
use wildmatch::WildMatch;

/// Marker that turns a path pattern into an exclusion.
pub const NEGATION: char = '!';

/// Report whether `value` matches the glob `pattern`.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if WildMatch::new(pattern).matches(value) {
        return true;
    }

    if pattern.contains("/**/") {
        let collapsed = pattern.replace("/**/", "/");
        return WildMatch::new(&collapsed).matches(value);
    }

    false
}

/// A single entry of a path list: either the path must match it, or
/// (with a leading `!`) it must not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Include(String),
    Exclude(String),
}

impl PathPattern {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(NEGATION) {
            Some(rest) => PathPattern::Exclude(rest.to_string()),
            None => PathPattern::Include(raw.to_string()),
        }
    }

    pub fn is_satisfied_by(&self, path: &str) -> bool {
        match self {
            PathPattern::Include(pattern) => glob_match(pattern, path),
            PathPattern::Exclude(pattern) => !glob_match(pattern, path),
        }
    }
}

/// Ordered path list combined conjunctively: every entry must be satisfied.
#[derive(Debug, Clone, Default)]
pub struct PathGlobs {
    raw: Vec<String>,
    patterns: Vec<PathPattern>,
}

impl PathGlobs {
    pub fn new(raw: Vec<String>) -> Self {
        let patterns = raw.iter().map(|p| PathPattern::parse(p)).collect();
        Self { raw, patterns }
    }

    pub fn matches(&self, path: &str) -> bool {
        self.patterns.iter().all(|p| p.is_satisfied_by(path))
    }

    /// The patterns exactly as configured (including `!` markers).
    pub fn raw(&self) -> &[String] {
        &self.raw
    }
}

impl Serialize for PathGlobs {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

/// Stage/ignore scope for caching, tested against `host + path`.
///
/// Logic:
/// 1. If any ignore pattern matches, the value is out of scope.
/// 2. Otherwise it is in scope only if some stage pattern matches.
#[derive(Debug, Clone, Default)]
pub struct CacheScope {
    stage: Vec<String>,
    ignore: Vec<String>,
}

impl CacheScope {
    pub fn new(stage: Vec<String>, ignore: Vec<String>) -> Self {
        Self { stage, ignore }
    }

    pub fn is_ignored(&self, value: &str) -> bool {
        self.ignore.iter().any(|glob| glob_match(glob, value))
    }

    pub fn is_staged(&self, value: &str) -> bool {
        self.stage.iter().any(|glob| glob_match(glob, value))
    }

    pub fn allows(&self, value: &str) -> bool {
        !self.is_ignored(value) && self.is_staged(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_glob_basics() {
        assert!(glob_match("**", "/anything/at/all"));
        assert!(glob_match("**.jpg", "/images/cat.jpg"));
        assert!(!glob_match("**.jpg", "/images/cat.png"));
        assert!(glob_match("**/api", "/v1/api"));
        assert!(!glob_match("**/api", "/v1/api/users"));
    }

    #[test]
    fn test_globstar_collapses_to_single_separator() {
        assert!(glob_match("/**/*", "/index.html"));
        assert!(glob_match("/**/*", "/a/b/c"));
        assert!(glob_match("/**/graphql", "/graphql"));
        assert!(glob_match("/**/graphql", "/api/v2/graphql"));
    }

    #[test]
    fn test_path_pattern_polarity() {
        assert_eq!(
            PathPattern::parse("!/**/graphql"),
            PathPattern::Exclude("/**/graphql".to_string())
        );
        assert_eq!(
            PathPattern::parse("/**"),
            PathPattern::Include("/**".to_string())
        );
    }

    #[test]
    fn test_path_globs_include_but_exclude() {
        let globs = PathGlobs::new(vec!["/**/*".to_string(), "!/**/graphql".to_string()]);
        assert!(globs.matches("/users/1"));
        assert!(!globs.matches("/api/graphql"));
        assert!(!globs.matches("/graphql"));
        assert_eq!(globs.raw(), &["/**/*".to_string(), "!/**/graphql".to_string()]);
    }

    #[test]
    fn test_cache_scope() {
        let scope = CacheScope::new(
            vec!["api.example.com/**".to_string()],
            vec!["api.example.com/health".to_string()],
        );
        assert!(scope.allows("api.example.com/users"));
        assert!(!scope.allows("api.example.com/health"));
        assert!(!scope.allows("cdn.example.com/users"));

        // Empty stage list stages nothing
        let scope = CacheScope::new(vec![], vec![]);
        assert!(!scope.allows("api.example.com/users"));
    }

    proptest! {
        #[test]
        fn prop_path_globs_are_conjunctive(
            entries in proptest::collection::vec(
                (any::<bool>(), prop::sample::select(vec!["/**", "/api/**", "**.json", "**/v1/*", "/static/*"])),
                0..5,
            ),
            path in prop::sample::select(vec!["/", "/api/users", "/api/v1/x.json", "/static/app.js", "/v1/a"]),
        ) {
            let raw: Vec<String> = entries
                .iter()
                .map(|(negated, p)| if *negated { format!("!{p}") } else { p.to_string() })
                .collect();
            let expected = entries.iter().all(|(negated, p)| glob_match(p, path) != *negated);
            prop_assert_eq!(PathGlobs::new(raw).matches(path), expected);
        }
    }
}
