//! Read-through caching layer for Driftbox Core.
//!
//! The cache wraps arbitrary fetch operations: a hit returns the
//! stored value without invoking the fetcher; a miss computes, stores
//! with an explicit TTL, and returns. Cached entries are opportunistic
//! accelerators over the system of record: their absence is never an
//! error, and a store outage degrades to calling the fetcher directly.
//!
//! Mutation endpoints evict with [`Cache::invalidate`], which sweeps
//! all keys matching a glob-style pattern. The sweep is not atomic
//! with respect to concurrent writers; a stale entry may briefly
//! survive a concurrent update, bounded by its TTL.
//!
//! # Usage
//!
//! ```rust,ignore
//! use driftbox_core::cache::Cache;
//!
//! let files = cache
//!     .get_or_fetch("files:user:42", Duration::from_secs(300), || async {
//!         db.list_files(42).await
//!     })
//!     .await?;
//!
//! // After an upload or delete:
//! cache.invalidate("files:user:42*").await;
//! ```

use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::CounterStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Default TTL for entries stored via [`Cache::get_or_fetch_default`]
    pub default_ttl: Duration,

    /// Namespace prefix applied to every key and invalidation pattern
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            key_prefix: "driftbox:cache:".to_string(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Read-through cache over the shared counter store.
pub struct Cache {
    store: Arc<dyn CounterStore>,
    config: CacheConfig,
}

impl Cache {
    /// Create a cache with the default configuration.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    /// Create a cache with an explicit configuration.
    pub fn with_config(store: Arc<dyn CounterStore>, config: CacheConfig) -> Self {
        Self { store, config }
    }

    /// Get a cached value, or compute and store it.
    ///
    /// The fetcher runs only on a miss. A corrupt stored payload and a
    /// store read error both count as misses; a store write error is
    /// logged and the freshly computed value is returned anyway. Only
    /// fetcher errors propagate.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let full_key = self.full_key(key);

        match self.store.get(&full_key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    counter!("cache_hits_total", "backend" => self.store.name()).increment(1);
                    debug!(key = %full_key, "Cache hit");
                    return Ok(value);
                }
                Err(e) => {
                    // Corrupt payload reads as a miss; the fresh value
                    // overwrites it below.
                    warn!(key = %full_key, error = %e, "Discarding undecodable cache entry");
                    counter!("cache_misses_total", "backend" => self.store.name(), "reason" => "corrupt")
                        .increment(1);
                }
            },
            Ok(None) => {
                counter!("cache_misses_total", "backend" => self.store.name(), "reason" => "not_found")
                    .increment(1);
                debug!(key = %full_key, "Cache miss");
            }
            Err(e) => {
                warn!(key = %full_key, error = %e, "Cache read failed, bypassing cache");
                counter!("cache_misses_total", "backend" => self.store.name(), "reason" => "store_error")
                    .increment(1);
            }
        }

        let value = fetcher().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.store.set_ex(&full_key, &raw, ttl.as_secs()).await {
                    warn!(key = %full_key, error = %e, "Cache write failed");
                } else {
                    counter!("cache_sets_total", "backend" => self.store.name()).increment(1);
                    debug!(key = %full_key, ttl_secs = ttl.as_secs(), "Cache set");
                }
            }
            Err(e) => {
                warn!(key = %full_key, error = %e, "Value not serializable, skipping cache write");
            }
        }

        Ok(value)
    }

    /// [`Cache::get_or_fetch`] with the configured default TTL.
    pub async fn get_or_fetch_default<T, F, Fut>(&self, key: &str, fetcher: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.get_or_fetch(key, self.config.default_ttl, fetcher).await
    }

    /// Delete every cache entry matching a glob-style pattern.
    ///
    /// Returns the number of entries deleted. Store errors are logged
    /// and reported as zero deletions; the affected entries age out by
    /// TTL instead.
    pub async fn invalidate(&self, pattern: &str) -> u64 {
        let full_pattern = self.full_key(pattern);

        let keys = match self.store.keys(&full_pattern).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern = %full_pattern, error = %e, "Cache invalidation enumeration failed");
                return 0;
            }
        };

        if keys.is_empty() {
            return 0;
        }

        match self.store.del(&keys).await {
            Ok(deleted) => {
                counter!("cache_invalidations_total", "backend" => self.store.name())
                    .increment(deleted);
                debug!(pattern = %full_pattern, deleted, "Cache invalidated");
                deleted
            }
            Err(e) => {
                warn!(pattern = %full_pattern, error = %e, "Cache invalidation delete failed");
                0
            }
        }
    }

    /// Build the full key with the namespace prefix.
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

impl Clone for Cache {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
