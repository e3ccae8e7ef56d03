//! Upstream model-list cache
//!
//! The upstream model list changes rarely; it is cached with a staleness
//! window so the listing endpoint does not hammer the upstream.

use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::RwLock;

/// Model ids served when the upstream list is unavailable.
pub const DEFAULT_MODELS: &[&str] = &[
    "claude-sonnet-4-5-20250929",
    "claude-haiku-4-5-20251001",
    "claude-opus-4-1-20250805",
    "claude-3-7-sonnet-20250219",
];

struct CacheEntry {
    models: Vec<Value>,
    fetched_at: Instant,
}

/// Cached upstream model list with a staleness policy.
pub struct ModelsCache {
    entry: RwLock<Option<CacheEntry>>,
    ttl: Duration,
}

impl ModelsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            ttl,
        }
    }

    /// Whether the cache needs an upstream fetch.
    pub async fn needs_refresh(&self) -> bool {
        match self.entry.read().await.as_ref() {
            None => true,
            Some(entry) => entry.fetched_at.elapsed() >= self.ttl,
        }
    }

    pub async fn update(&self, models: Vec<Value>) {
        *self.entry.write().await = Some(CacheEntry {
            models,
            fetched_at: Instant::now(),
        });
    }

    /// Cached upstream model entries, if any.
    pub async fn models(&self) -> Option<Vec<Value>> {
        self.entry
            .read()
            .await
            .as_ref()
            .map(|entry| entry.models.clone())
    }

    /// Model ids to advertise: cached upstream ids when available, the
    /// static defaults otherwise.
    pub async fn model_ids(&self) -> Vec<String> {
        if let Some(models) = self.models().await {
            let ids: Vec<String> = models
                .iter()
                .filter_map(|model| {
                    model
                        .get("modelId")
                        .or_else(|| model.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .collect();
            if !ids.is_empty() {
                return ids;
            }
        }
        DEFAULT_MODELS.iter().map(|id| id.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn empty_cache_needs_refresh() {
        let cache = ModelsCache::new(Duration::from_secs(300));
        assert!(cache.needs_refresh().await);
        assert_eq!(cache.model_ids().await, DEFAULT_MODELS);
    }

    #[tokio::test]
    async fn update_fills_cache_until_ttl() {
        let cache = ModelsCache::new(Duration::from_secs(300));
        cache
            .update(vec![json!({"modelId": "claude-sonnet-4-5-20250929"})])
            .await;
        assert!(!cache.needs_refresh().await);
        assert_eq!(
            cache.model_ids().await,
            vec!["claude-sonnet-4-5-20250929".to_string()]
        );
    }

    #[tokio::test]
    async fn zero_ttl_is_always_stale() {
        let cache = ModelsCache::new(Duration::ZERO);
        cache.update(vec![json!({"modelId": "m"})]).await;
        assert!(cache.needs_refresh().await);
        // Stale entries still serve until replaced
        assert_eq!(cache.model_ids().await, vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn entries_without_ids_fall_back_to_defaults() {
        let cache = ModelsCache::new(Duration::from_secs(300));
        cache.update(vec![json!({"unexpected": true})]).await;
        assert_eq!(cache.model_ids().await, DEFAULT_MODELS);
    }
}
