//! Process-local TTL map.
//!
//! This module provides a typed key/value store with per-entry absolute
//! expiration. Expired entries are purged in two ways:
//!
//! - **Lazily**: `get` and `has` delete any expired entry they encounter.
//! - **Eagerly**: `sweep` walks all entries and deletes those past their
//!   expiry. The cleanup scheduler drives this on a configured interval.
//!
//! # Thread Safety
//!
//! All operations are safe under concurrent callers. Reads take a shared
//! lock; mutations (including lazy eviction) take the writer lock.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

/// Default time-to-live for entries: 1 hour.
pub const DEFAULT_TTL_SECS: u64 = 3600;

/// Default eager-sweep interval: 5 minutes.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

// =============================================================================
// Entry
// =============================================================================

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// =============================================================================
// TTL Store
// =============================================================================

/// Mapping from opaque string keys to typed values with per-entry expiry.
///
/// # Example
///
/// ```ignore
/// use imgopt::store::TtlStore;
/// use std::time::Duration;
///
/// let store: TtlStore<String> = TtlStore::new();
/// store.set("k", "v".to_string()).await;
/// assert_eq!(store.get("k").await, Some("v".to_string()));
/// ```
pub struct TtlStore<T: Clone> {
    entries: RwLock<HashMap<String, Entry<T>>>,
    default_ttl: Duration,
}

impl<T: Clone> Default for TtlStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TtlStore<T> {
    /// Create a store with the default TTL (1 hour).
    pub fn new() -> Self {
        Self::with_default_ttl(Duration::from_secs(DEFAULT_TTL_SECS))
    }

    /// Create a store with a custom default TTL.
    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// The default TTL applied by [`TtlStore::set`].
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Insert or replace a value under the default TTL.
    pub async fn set(&self, key: impl Into<String>, value: T) {
        self.set_with_ttl(key, value, self.default_ttl).await;
    }

    /// Insert or replace a value with an explicit TTL.
    pub async fn set_with_ttl(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.into(), entry);
    }

    /// Get a value. Returns `None` for absent or expired keys; an expired
    /// entry is deleted on the way out.
    pub async fn get(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        // Entry was expired: re-check under the writer lock and purge it.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(key) {
            if entry.is_expired(Instant::now()) {
                entries.remove(key);
                return None;
            }
            return Some(entry.value.clone());
        }
        None
    }

    /// Check for a live entry, purging it if expired.
    pub async fn has(&self, key: &str) -> bool {
        self.get(key).await.is_some()
    }

    /// Delete an entry. Returns `true` if a live entry was removed.
    pub async fn delete(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.entries.write().await.remove(key) {
            Some(entry) => !entry.is_expired(now),
            None => false,
        }
    }

    /// Reset the TTL of a live entry. Returns `false` for absent or expired
    /// keys (an expired entry is purged, not revived).
    pub async fn update_ttl(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.expires_at = now + ttl;
                true
            }
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// All unexpired keys. No ordering guarantee.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| !e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of unexpired entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .await
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }

    /// Whether the store holds no unexpired entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remove every entry, expired or not.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }

    /// Eagerly delete all expired entries, reporting how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    /// Eagerly delete all expired entries, returning the removed pairs so the
    /// caller can release associated resources (e.g. temp files).
    pub async fn sweep_collect(&self) -> Vec<(String, T)> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| entries.remove(&k).map(|e| (k, e.value)))
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let store: TtlStore<String> = TtlStore::new();
        store.set("k", "v".to_string()).await;

        assert_eq!(store.get("k").await, Some("v".to_string()));
        assert!(store.has("k").await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store: TtlStore<u32> = TtlStore::new();
        assert_eq!(store.get("missing").await, None);
        assert!(!store.has("missing").await);
    }

    #[tokio::test]
    async fn test_set_replaces() {
        let store: TtlStore<u32> = TtlStore::new();
        store.set("k", 1).await;
        store.set("k", 2).await;
        assert_eq!(store.get("k").await, Some(2));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_expiry_is_lazy_on_get() {
        let store: TtlStore<String> = TtlStore::new();
        store
            .set_with_ttl("k", "v".to_string(), Duration::from_millis(10))
            .await;

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.get("k").await, None);
        // The expired entry must be gone, not just hidden.
        assert!(!store.entries.read().await.contains_key("k"));
    }

    #[tokio::test]
    async fn test_expired_key_absent_from_keys_and_len() {
        let store: TtlStore<u32> = TtlStore::new();
        store.set_with_ttl("gone", 1, Duration::from_millis(5)).await;
        store.set("kept", 2).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let keys = store.keys().await;
        assert_eq!(keys, vec!["kept".to_string()]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let store: TtlStore<u32> = TtlStore::new();
        store.set("k", 1).await;

        assert!(store.delete("k").await);
        assert!(!store.delete("k").await);
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn test_update_ttl_extends_life() {
        let store: TtlStore<u32> = TtlStore::new();
        store.set_with_ttl("k", 1, Duration::from_millis(30)).await;

        assert!(store.update_ttl("k", Duration::from_secs(60)).await);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await, Some(1));
    }

    #[tokio::test]
    async fn test_update_ttl_does_not_revive_expired() {
        let store: TtlStore<u32> = TtlStore::new();
        store.set_with_ttl("k", 1, Duration::from_millis(5)).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!store.update_ttl("k", Duration::from_secs(60)).await);
        assert_eq!(store.get("k").await, None);
    }

    #[tokio::test]
    async fn test_sweep_reports_count() {
        let store: TtlStore<u32> = TtlStore::new();
        store.set_with_ttl("a", 1, Duration::from_millis(5)).await;
        store.set_with_ttl("b", 2, Duration::from_millis(5)).await;
        store.set("c", 3).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.sweep().await, 2);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.sweep().await, 0);
    }

    #[tokio::test]
    async fn test_sweep_collect_returns_values() {
        let store: TtlStore<String> = TtlStore::new();
        store
            .set_with_ttl("a", "one".to_string(), Duration::from_millis(5))
            .await;
        store.set("b", "two".to_string()).await;

        tokio::time::sleep(Duration::from_millis(20)).await;

        let removed = store.sweep_collect().await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "a");
        assert_eq!(removed[0].1, "one");
        assert!(store.has("b").await);
    }

    #[tokio::test]
    async fn test_clear() {
        let store: TtlStore<u32> = TtlStore::new();
        store.set("a", 1).await;
        store.set("b", 2).await;

        store.clear().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_concurrent_access() {
        use std::sync::Arc;

        let store: Arc<TtlStore<u64>> = Arc::new(TtlStore::new());
        let mut handles = Vec::new();

        for i in 0..8u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for j in 0..50u64 {
                    let key = format!("k{}-{}", i, j);
                    store.set(key.clone(), i * 100 + j).await;
                    assert_eq!(store.get(&key).await, Some(i * 100 + j));
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.len().await, 8 * 50);
    }
}
