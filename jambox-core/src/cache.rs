//! Content-addressable request/response cache.
//!
//! Entries are keyed by a hash of method, URL and body. An entry is staged
//! when its request is seen, committed when the response completes, and
//! dropped if the request aborts first. Staged entries are also indexed by
//! request id, since completion and abort events only carry that id.

use crate::exchange::{CompletedResponse, InterceptedRequest};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Stable identity of a request for cache lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Hash a request. Pure function of method, URL and body.
    pub fn of(request: &InterceptedRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(request.method.to_ascii_uppercase().as_bytes());
        hasher.update([0u8]);
        hasher.update(request.url.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(&request.body);
        CacheKey(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Staged,
    Committed,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub request: InterceptedRequest,
    pub response: Option<CompletedResponse>,
    pub state: EntryState,
}

#[derive(Debug, Default)]
pub struct Cache {
    entries: DashMap<CacheKey, CacheEntry>,
    /// Request id -> key of the entry that request staged
    staged: DashMap<String, CacheKey>,
    bypass: AtomicBool,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether all cache reads and writes are disabled.
    pub fn bypass(&self) -> bool {
        self.bypass.load(Ordering::Relaxed)
    }

    pub fn set_bypass(&self, bypass: bool) {
        self.bypass.store(bypass, Ordering::Relaxed);
    }

    /// True if a committed entry exists for `key`.
    pub fn has(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .map_or(false, |entry| entry.state == EntryState::Committed)
    }

    /// The committed response stored under `key`.
    pub fn get(&self, key: &CacheKey) -> Option<CompletedResponse> {
        let entry = self.entries.get(key)?;
        match entry.state {
            EntryState::Committed => entry.response.clone(),
            EntryState::Staged => None,
        }
    }

    /// Begin staging `request`. Returns false if an entry (staged or
    /// committed) already exists for its key; the existing entry is kept.
    pub fn stage(&self, request: &InterceptedRequest) -> bool {
        let key = CacheKey::of(request);
        match self.entries.entry(key.clone()) {
            Entry::Occupied(_) => {
                debug!("Not staging [{}], key {} already present", request.id, key);
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CacheEntry {
                    request: request.clone(),
                    response: None,
                    state: EntryState::Staged,
                });
                self.staged.insert(request.id.clone(), key);
                true
            }
        }
    }

    /// True if the request with this id staged an entry still awaiting its response.
    pub fn has_staged(&self, request_id: &str) -> bool {
        self.staged.contains_key(request_id)
    }

    /// Pair the staged entry of `response.id` with `response`.
    /// No-op (returns false) when nothing is staged for that id.
    pub fn commit(&self, response: &CompletedResponse) -> bool {
        let Some((_, key)) = self.staged.remove(&response.id) else {
            return false;
        };

        match self.entries.get_mut(&key) {
            Some(mut entry) if entry.state == EntryState::Staged => {
                entry.response = Some(response.clone());
                entry.state = EntryState::Committed;
                debug!("Committed [{}] under {}", response.id, key);
                true
            }
            _ => false,
        }
    }

    /// Discard the staged entry of `request_id`. No-op when nothing is staged.
    pub fn abort(&self, request_id: &str) -> bool {
        let Some((_, key)) = self.staged.remove(request_id) else {
            return false;
        };

        let removed = self
            .entries
            .remove_if(&key, |_, entry| entry.state == EntryState::Staged)
            .is_some();
        if removed {
            debug!("Aborted staged [{}] under {}", request_id, key);
        }
        removed
    }

    pub fn state(&self, key: &CacheKey) -> Option<EntryState> {
        self.entries.get(key).map(|entry| entry.state)
    }

    /// Number of committed entries.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == EntryState::Committed)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }

    pub fn committed_keys(&self) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|entry| entry.state == EntryState::Committed)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Drop every entry, staged or committed.
    pub fn clear(&self) {
        self.staged.clear();
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use url::Url;

    fn request(method: &str, url: &str, body: &str) -> InterceptedRequest {
        InterceptedRequest::new(method, Url::parse(url).unwrap()).with_body(body)
    }

    #[test]
    fn test_key_is_deterministic() {
        let a = request("GET", "http://a.com/x", "");
        let b = request("GET", "http://a.com/x", "");
        assert_ne!(a.id, b.id);
        assert_eq!(CacheKey::of(&a), CacheKey::of(&b));
        assert_eq!(CacheKey::of(&a).as_str().len(), 64);
    }

    #[test]
    fn test_key_covers_method_url_and_body() {
        let base = CacheKey::of(&request("POST", "http://a.com/x", "{}"));
        assert_ne!(base, CacheKey::of(&request("PUT", "http://a.com/x", "{}")));
        assert_ne!(base, CacheKey::of(&request("POST", "http://a.com/y", "{}")));
        assert_ne!(base, CacheKey::of(&request("POST", "http://a.com/x", "[]")));
        // headers are not part of the identity
        let with_header = request("POST", "http://a.com/x", "{}").with_header("x-trace", "1");
        assert_eq!(base, CacheKey::of(&with_header));
    }

    #[test]
    fn test_stage_then_commit() {
        let cache = Cache::new();
        let req = request("GET", "http://a.com/x", "");
        let key = CacheKey::of(&req);

        assert_eq!(cache.state(&key), None);
        assert!(cache.stage(&req));
        assert_eq!(cache.state(&key), Some(EntryState::Staged));
        assert!(cache.has_staged(&req.id));
        assert!(!cache.has(&key));
        assert!(cache.get(&key).is_none());

        let res = CompletedResponse::new(req.id.clone(), 200).with_body("hello");
        assert!(cache.commit(&res));
        assert_eq!(cache.state(&key), Some(EntryState::Committed));
        assert!(!cache.has_staged(&req.id));
        assert!(cache.has(&key));
        assert_eq!(cache.get(&key).unwrap().body, b"hello");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stage_then_abort() {
        let cache = Cache::new();
        let req = request("GET", "http://a.com/x", "");
        let key = CacheKey::of(&req);

        assert!(cache.stage(&req));
        assert!(cache.abort(&req.id));
        assert_eq!(cache.state(&key), None);
        assert!(!cache.has_staged(&req.id));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_commit_and_abort_without_staging_are_noops() {
        let cache = Cache::new();
        assert!(!cache.commit(&CompletedResponse::new("missing", 200)));
        assert!(!cache.abort("missing"));

        let req = request("GET", "http://a.com/x", "");
        cache.stage(&req);
        let res = CompletedResponse::new(req.id.clone(), 200);
        assert!(cache.commit(&res));
        // double delivery
        assert!(!cache.commit(&res));
        assert!(!cache.abort(&req.id));
        assert!(cache.has(&CacheKey::of(&req)));
    }

    #[test]
    fn test_second_request_for_staged_key_is_not_restaged() {
        let cache = Cache::new();
        let first = request("GET", "http://a.com/x", "");
        let second = request("GET", "http://a.com/x", "");

        assert!(cache.stage(&first));
        assert!(!cache.stage(&second));
        assert!(!cache.has_staged(&second.id));

        // the second exchange finishing first does not commit anything
        assert!(!cache.commit(&CompletedResponse::new(second.id.clone(), 500)));
        assert!(cache.commit(&CompletedResponse::new(first.id.clone(), 200)));
        assert_eq!(cache.get(&CacheKey::of(&first)).unwrap().status_code, 200);
    }

    #[test]
    fn test_clear_and_keys() {
        let cache = Cache::new();
        let a = request("GET", "http://a.com/a", "");
        let b = request("GET", "http://a.com/b", "");
        cache.stage(&a);
        cache.stage(&b);
        cache.commit(&CompletedResponse::new(a.id.clone(), 200));

        assert_eq!(cache.committed_keys(), vec![CacheKey::of(&a)]);
        assert_eq!(cache.staged_len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.staged_len(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_exchanges_on_distinct_keys() {
        let cache = Arc::new(Cache::new());
        let mut handles = Vec::new();

        for i in 0..32 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let req = request("GET", &format!("http://a.com/{i}"), "");
                assert!(cache.stage(&req));
                if i % 2 == 0 {
                    cache.commit(&CompletedResponse::new(req.id.clone(), 200))
                } else {
                    cache.abort(&req.id)
                }
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap());
        }
        assert_eq!(cache.len(), 16);
        assert_eq!(cache.staged_len(), 0);
    }
}
