//! TTL-keyed response cache shared by every controller in a session.

use crate::coordinator::ClassTag;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;
use url::form_urlencoded;

/// Default TTL for data classes without an explicit policy.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub payload: V,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// An entry is fresh iff `now - stored_at < ttl`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.stored_at) < self.ttl
    }
}

/// TTL per data class. Slow-changing or expensive classes get a longer TTL than fast ones.
#[derive(Debug, Clone)]
pub struct TtlPolicy {
    default_ttl: Duration,
    per_class: HashMap<ClassTag, Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            per_class: HashMap::new(),
        }
    }
}

impl TtlPolicy {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            per_class: HashMap::new(),
        }
    }

    pub fn with_ttl(mut self, class: ClassTag, ttl: Duration) -> Self {
        self.per_class.insert(class, ttl);
        self
    }

    pub fn ttl_for(&self, class: &ClassTag) -> Duration {
        self.per_class
            .get(class)
            .copied()
            .unwrap_or(self.default_ttl)
    }
}

/// Canonical cache key for an upstream request. Parameters are ordered by the `BTreeMap` and
/// form-urlencoded, so the same logical request always yields the same key and distinct requests
/// never collide.
pub fn cache_key(endpoint: &str, params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return endpoint.to_string();
    }
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params.iter())
        .finish();
    format!("{endpoint}?{query}")
}

/// Session-scoped payload cache. Cheap to clone, clones share entries.
#[derive(Debug, Clone)]
pub struct ResponseCache<V> {
    policy: Arc<TtlPolicy>,
    entries: Arc<Mutex<HashMap<String, CacheEntry<V>>>>,
}

impl<V> Default for ResponseCache<V> {
    fn default() -> Self {
        Self::new(TtlPolicy::default())
    }
}

impl<V> ResponseCache<V> {
    pub fn new(policy: TtlPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    /// Store `payload` under `key`, overwriting any previous entry.
    pub fn set(&self, key: impl Into<String>, payload: V, ttl: Duration) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            payload,
            stored_at: Instant::now(),
            ttl,
        };
        self.entries.lock().insert(key, entry);
    }

    /// Store `payload` with the TTL of its data class.
    pub fn set_for_class(&self, class: &ClassTag, key: impl Into<String>, payload: V) {
        let ttl = self.policy.ttl_for(class);
        self.set(key, payload, ttl);
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Evict every stale entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_fresh(now));
        let purged = before - entries.len();
        if purged > 0 {
            debug!(purged, remaining = entries.len(), "purged expired cache entries");
        }
        purged
    }

    /// Number of stored entries, stale ones included until they are evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<V: Clone> ResponseCache<V> {
    /// Fresh payload for `key`, evicting the entry if it has gone stale.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.is_fresh(now) => Some(entry.payload.clone()),
            Some(entry) => {
                debug!(
                    key,
                    age_ms = now.saturating_duration_since(entry.stored_at).as_millis() as u64,
                    "evicting stale cache entry"
                );
                entries.remove(key);
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn test_entry_fresh_strictly_before_ttl() {
        let cache = ResponseCache::default();
        cache.set("oi?symbol=BTCUSDT", 1u32, Duration::from_secs(10));

        advance(Duration::from_millis(9_999)).await;
        assert_eq!(cache.get("oi?symbol=BTCUSDT"), Some(1));

        advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("oi?symbol=BTCUSDT"), None);

        // Stale read evicted the entry
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_restarts_ttl() {
        let cache = ResponseCache::default();
        cache.set("basis", "old", Duration::from_secs(5));

        advance(Duration::from_secs(4)).await;
        cache.set("basis", "new", Duration::from_secs(5));

        advance(Duration::from_secs(4)).await;
        assert_eq!(cache.get("basis"), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_is_per_class() {
        let slow = ClassTag::new("term-structure");
        let fast = ClassTag::new("liquidations");
        let cache = ResponseCache::new(
            TtlPolicy::new(Duration::from_secs(10)).with_ttl(slow.clone(), Duration::from_secs(300)),
        );

        cache.set_for_class(&slow, "curve", 1);
        cache.set_for_class(&fast, "liqs", 2);

        advance(Duration::from_secs(60)).await;
        assert_eq!(cache.get("curve"), Some(1));
        assert_eq!(cache.get("liqs"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = ResponseCache::default();
        cache.set("a", 1, Duration::from_secs(1));
        cache.set("b", 2, Duration::from_secs(1));
        cache.set("c", 3, Duration::from_secs(60));

        advance(Duration::from_secs(2)).await;
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_cache_key_is_order_independent() {
        let mut params = BTreeMap::new();
        params.insert("period".to_string(), "5m".to_string());
        params.insert("symbol".to_string(), "BTCUSDT".to_string());

        assert_eq!(
            cache_key("/futures/data/openInterestHist", &params),
            "/futures/data/openInterestHist?period=5m&symbol=BTCUSDT"
        );
        assert_eq!(cache_key("/fapi/v1/time", &BTreeMap::new()), "/fapi/v1/time");
    }

    #[test]
    fn test_cache_key_escapes_reserved_characters() {
        let mut smuggled = BTreeMap::new();
        smuggled.insert("symbol".to_string(), "BTCUSDT&period=5m".to_string());

        let mut split = BTreeMap::new();
        split.insert("period".to_string(), "5m".to_string());
        split.insert("symbol".to_string(), "BTCUSDT".to_string());

        let smuggled_key = cache_key("/futures/data/openInterestHist", &smuggled);
        assert_eq!(
            smuggled_key,
            "/futures/data/openInterestHist?symbol=BTCUSDT%26period%3D5m"
        );
        assert_ne!(smuggled_key, cache_key("/futures/data/openInterestHist", &split));
    }
}
