//! Process-local TTL cache for read-only reference data.
//!
//! The cache fronts adapter reads whose results change slowly (label lists,
//! channel rosters, profile data). It is not authoritative: cold starts miss,
//! writes neither populate nor invalidate it, and staleness is bounded only
//! by the per-method TTL.

use chrono::{DateTime, Duration, Utc};
use patchbay_core::{AppName, UserId};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Key for a cached read: one slot per (app, user, method).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The app the method belongs to.
    pub app: AppName,
    /// The calling user.
    pub user_id: UserId,
    /// The adapter method name.
    pub method: String,
}

#[derive(Debug, Clone)]
struct CacheSlot {
    stored_at: DateTime<Utc>,
    ttl: Duration,
    value: JsonValue,
}

/// Returns the TTL for a cacheable (app, method) pair, or `None` when the
/// method must never be cached.
///
/// This is the closed cacheable list; everything else, including every write
/// operation, bypasses the cache.
#[must_use]
pub fn cache_ttl(app: AppName, method: &str) -> Option<Duration> {
    let minutes = match (app, method) {
        (AppName::Gmail, "listLabels") => 5,
        (AppName::Gmail, "getProfile") => 10,
        (AppName::Slack, "listChannels" | "listUsers") => 5,
        (AppName::Slack, "getWorkspaceInfo" | "getCurrentUser") => 10,
        (AppName::Github, "listRepos") => 5,
        (AppName::Github, "getCurrentUser") => 10,
        _ => return None,
    };
    Some(Duration::minutes(minutes))
}

/// A concurrent expiring key/value store.
///
/// Shared by every dispatcher call in the process; cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ResponseCache {
    slots: Arc<RwLock<HashMap<CacheKey, CacheSlot>>>,
}

impl ResponseCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `key` if present and within TTL.
    ///
    /// Expired entries are dropped on access.
    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<JsonValue> {
        let now = Utc::now();

        {
            let slots = self.slots.read().unwrap();
            match slots.get(key) {
                Some(slot) if now - slot.stored_at < slot.ttl => {
                    return Some(slot.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Entry exists but is stale; evict it.
        self.slots.write().unwrap().remove(key);
        None
    }

    /// Stores `value` under `key` for `ttl`.
    pub fn put(&self, key: CacheKey, value: JsonValue, ttl: Duration) {
        let slot = CacheSlot {
            stored_at: Utc::now(),
            ttl,
            value,
        };
        self.slots.write().unwrap().insert(key, slot);
    }

    /// Number of live and stale entries currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    /// Returns whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(method: &str) -> CacheKey {
        CacheKey {
            app: AppName::Slack,
            user_id: UserId::new(),
            method: method.to_string(),
        }
    }

    #[test]
    fn hit_within_ttl() {
        let cache = ResponseCache::new();
        let k = key("listChannels");
        cache.put(k.clone(), json!(["C1"]), Duration::minutes(5));

        assert_eq!(cache.get(&k), Some(json!(["C1"])));
    }

    #[test]
    fn expired_entry_misses_and_evicts() {
        let cache = ResponseCache::new();
        let k = key("listChannels");
        // Zero TTL: immediately stale.
        cache.put(k.clone(), json!(["C1"]), Duration::zero());

        assert_eq!(cache.get(&k), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn distinct_users_do_not_share_slots() {
        let cache = ResponseCache::new();
        let a = key("listUsers");
        let b = CacheKey {
            user_id: UserId::new(),
            ..a.clone()
        };
        cache.put(a.clone(), json!("a"), Duration::minutes(5));

        assert_eq!(cache.get(&a), Some(json!("a")));
        assert_eq!(cache.get(&b), None);
    }

    #[test]
    fn cacheable_list_is_closed() {
        assert_eq!(
            cache_ttl(AppName::Gmail, "listLabels"),
            Some(Duration::minutes(5))
        );
        assert_eq!(
            cache_ttl(AppName::Slack, "getWorkspaceInfo"),
            Some(Duration::minutes(10))
        );
        assert_eq!(
            cache_ttl(AppName::Github, "getCurrentUser"),
            Some(Duration::minutes(10))
        );
        // Writes and unlisted reads are never cached.
        assert_eq!(cache_ttl(AppName::Slack, "postMessage"), None);
        assert_eq!(cache_ttl(AppName::Gmail, "listMessages"), None);
        assert_eq!(cache_ttl(AppName::Webhook, "send"), None);
    }
}
