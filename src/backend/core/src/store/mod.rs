//! Shared counter store abstraction.
//!
//! The rate limiter and the cache both run against the same remote
//! key-value + sorted-set store. This module provides:
//!
//! - **CounterStore**: the trait exposing the atomic primitives both
//!   engines rely on (score-ordered sets with range removal, plain
//!   values with expiry, glob key enumeration)
//! - **RedisStore**: production backend over a multiplexed async Redis
//!   connection, with connect and per-command timeouts
//! - **MemoryStore**: in-process backend for development and tests
//!
//! Correctness of callers depends only on each primitive being atomic
//! per key; no cross-command transactionality is promised.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::AsyncCommands;
use std::time::{Duration, Instant};
use tracing::info;

use crate::error::{DriftboxError, ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Counter Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Atomic key-value + sorted-set primitives of the shared counter store.
///
/// Scores are epoch milliseconds throughout the crate.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add a member with the given score, replacing any previous score.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Count the members of a sorted set.
    async fn zcard(&self, key: &str) -> Result<u64>;

    /// Remove all members with `min <= score <= max`; returns the count removed.
    async fn zrembyscore(&self, key: &str, min: i64, max: i64) -> Result<u64>;

    /// Remove a single member; returns the count removed (0 or 1).
    async fn zrem(&self, key: &str, member: &str) -> Result<u64>;

    /// Members and scores in rank order, `start..=stop`, negative
    /// indices counting from the end.
    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, i64)>>;

    /// Set the key's time-to-live in seconds.
    async fn expire(&self, key: &str, seconds: i64) -> Result<()>;

    /// Get a plain value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a plain value with a time-to-live in seconds.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    /// Delete the given keys; returns the count deleted.
    async fn del(&self, keys: &[String]) -> Result<u64>;

    /// Enumerate keys matching a glob-style pattern (`*` and `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Round-trip health check.
    async fn ping(&self) -> Result<()>;

    /// Get the backend name.
    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the Redis-backed counter store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Redis connection URL
    pub url: String,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// Per-command timeout
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(2),
        }
    }
}

/// Redis-backed counter store.
pub struct RedisStore {
    client: redis::Client,
    config: RedisStoreConfig,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn connect(config: RedisStoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(DriftboxError::from)?;

        let mut conn = match tokio::time::timeout(
            config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(res) => res.map_err(DriftboxError::from)?,
            Err(_) => {
                return Err(DriftboxError::with_internal(
                    ErrorCode::StoreTimeout,
                    "Counter store unavailable",
                    format!("connect exceeded {:?}", config.connect_timeout),
                ))
            }
        };

        let ping = redis::cmd("PING");
        let _: String = ping.query_async(&mut conn).await.map_err(DriftboxError::from)?;

        info!(url = %config.url, "Counter store connected");

        Ok(Self { client, config })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        match tokio::time::timeout(
            self.config.connect_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(res) => res.map_err(DriftboxError::from),
            Err(_) => Err(DriftboxError::with_internal(
                ErrorCode::StoreTimeout,
                "Counter store unavailable",
                format!("connect exceeded {:?}", self.config.connect_timeout),
            )),
        }
    }

    /// Run a command future under the configured command timeout.
    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(res) => res.map_err(DriftboxError::from),
            Err(_) => Err(DriftboxError::with_internal(
                ErrorCode::StoreTimeout,
                "Counter store operation failed",
                format!("command exceeded {:?}", self.config.command_timeout),
            )),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = self.with_timeout(conn.zadd(key, member, score)).await?;
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = self.with_timeout(conn.zcard(key)).await?;
        Ok(count)
    }

    async fn zrembyscore(&self, key: &str, min: i64, max: i64) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = self.with_timeout(conn.zrembyscore(key, min, max)).await?;
        Ok(removed)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let removed: u64 = self.with_timeout(conn.zrem(key, member)).await?;
        Ok(removed)
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, i64)>> {
        let mut conn = self.conn().await?;
        // Scores come back as doubles; the crate only ever stores
        // integral millisecond timestamps.
        let raw: Vec<(String, f64)> = self
            .with_timeout(conn.zrange_withscores(key, start, stop))
            .await?;
        Ok(raw.into_iter().map(|(m, s)| (m, s as i64)).collect())
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: bool = self.with_timeout(conn.expire(key, seconds)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = self.with_timeout(conn.get(key)).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn().await?;
        let _: () = self.with_timeout(conn.set_ex(key, value, ttl_secs)).await?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let deleted: u64 = self.with_timeout(conn.del(keys.to_vec())).await?;
        Ok(deleted)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = self.with_timeout(conn.keys(pattern)).await?;
        Ok(keys)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        let ping = redis::cmd("PING");
        let _: String = self.with_timeout(ping.query_async(&mut conn)).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

struct SortedSetEntry {
    /// (member, score), ordered by score then member.
    members: Vec<(String, i64)>,
    expires_at: Option<Instant>,
}

impl SortedSetEntry {
    fn sort(&mut self) {
        self.members
            .sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    }
}

/// In-process counter store for development and tests.
#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, ValueEntry>,
    sorted_sets: DashMap<String, SortedSetEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn drop_if_expired(&self, key: &str) {
        let now = Instant::now();
        if let Some(entry) = self.values.get(key) {
            if entry.expires_at.is_some_and(|at| at <= now) {
                drop(entry);
                self.values.remove(key);
            }
        }
        if let Some(entry) = self.sorted_sets.get(key) {
            if entry.expires_at.is_some_and(|at| at <= now) {
                drop(entry);
                self.sorted_sets.remove(key);
            }
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        self.drop_if_expired(key);
        let mut entry = self
            .sorted_sets
            .entry(key.to_string())
            .or_insert_with(|| SortedSetEntry {
                members: Vec::new(),
                expires_at: None,
            });
        match entry.members.iter_mut().find(|(m, _)| m == member) {
            Some(existing) => existing.1 = score,
            None => entry.members.push((member.to_string(), score)),
        }
        entry.sort();
        Ok(())
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.drop_if_expired(key);
        Ok(self
            .sorted_sets
            .get(key)
            .map(|e| e.members.len() as u64)
            .unwrap_or(0))
    }

    async fn zrembyscore(&self, key: &str, min: i64, max: i64) -> Result<u64> {
        self.drop_if_expired(key);
        let Some(mut entry) = self.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = entry.members.len();
        entry.members.retain(|(_, s)| *s < min || *s > max);
        Ok((before - entry.members.len()) as u64)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<u64> {
        self.drop_if_expired(key);
        let Some(mut entry) = self.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = entry.members.len();
        entry.members.retain(|(m, _)| m != member);
        Ok((before - entry.members.len()) as u64)
    }

    async fn zrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, i64)>> {
        self.drop_if_expired(key);
        let Some(entry) = self.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        let len = entry.members.len() as isize;
        let normalize = |idx: isize| -> isize {
            if idx < 0 {
                (len + idx).max(0)
            } else {
                idx
            }
        };
        let from = normalize(start).min(len);
        let to = (normalize(stop) + 1).min(len);
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(entry.members[from as usize..to as usize].to_vec())
    }

    async fn expire(&self, key: &str, seconds: i64) -> Result<()> {
        self.drop_if_expired(key);
        let deadline = Instant::now() + Duration::from_secs(seconds.max(0) as u64);
        if let Some(mut entry) = self.values.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        if let Some(mut entry) = self.sorted_sets.get_mut(key) {
            entry.expires_at = Some(deadline);
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.drop_if_expired(key);
        Ok(self.values.get(key).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64> {
        let mut deleted = 0;
        for key in keys {
            if self.values.remove(key).is_some() {
                deleted += 1;
            } else if self.sorted_sets.remove(key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let live = |expires_at: Option<Instant>| expires_at.map_or(true, |at| at > now);

        let mut matched: Vec<String> = self
            .values
            .iter()
            .filter(|e| live(e.value().expires_at) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        matched.extend(
            self.sorted_sets
                .iter()
                .filter(|e| live(e.value().expires_at) && glob_match(pattern, e.key()))
                .map(|e| e.key().clone()),
        );
        Ok(matched)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Glob Matching
// ═══════════════════════════════════════════════════════════════════════════════

/// Match `text` against a glob-style `pattern`. Supports `*` and `?`.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("files:user:*", "files:user:42"));
        assert!(glob_match("files:user:*", "files:user:"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("files:?:x", "files:a:x"));
        assert!(glob_match("a*b*c", "axxbyyc"));
        assert!(!glob_match("files:user:*", "files:group:42"));
        assert!(!glob_match("files:?:x", "files:ab:x"));
        assert!(!glob_match("abc", "abcd"));
    }

    #[tokio::test]
    async fn test_memory_store_sorted_set_basics() {
        let store = MemoryStore::new();

        store.zadd("w", "m1", 100).await.unwrap();
        store.zadd("w", "m2", 50).await.unwrap();
        store.zadd("w", "m3", 200).await.unwrap();

        assert_eq!(store.zcard("w").await.unwrap(), 3);

        // Rank order is by score.
        let range = store.zrange_withscores("w", 0, 0).await.unwrap();
        assert_eq!(range, vec![("m2".to_string(), 50)]);

        // Re-adding an existing member updates its score.
        store.zadd("w", "m2", 300).await.unwrap();
        assert_eq!(store.zcard("w").await.unwrap(), 3);
        let range = store.zrange_withscores("w", 0, 0).await.unwrap();
        assert_eq!(range, vec![("m1".to_string(), 100)]);
    }

    #[tokio::test]
    async fn test_memory_store_zrembyscore_is_inclusive() {
        let store = MemoryStore::new();
        store.zadd("w", "a", 10).await.unwrap();
        store.zadd("w", "b", 20).await.unwrap();
        store.zadd("w", "c", 30).await.unwrap();

        let removed = store.zrembyscore("w", 0, 20).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.zcard("w").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_zrem_specific_member() {
        let store = MemoryStore::new();
        store.zadd("w", "a", 10).await.unwrap();
        store.zadd("w", "b", 10).await.unwrap();

        assert_eq!(store.zrem("w", "a").await.unwrap(), 1);
        assert_eq!(store.zrem("w", "a").await.unwrap(), 0);
        assert_eq!(store.zcard("w").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_value_ttl() {
        let store = MemoryStore::new();
        store.set_ex("k", "v", 60).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        store.set_ex("short", "v", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_store_keys_and_del() {
        let store = MemoryStore::new();
        store.set_ex("files:user:42:list", "[]", 60).await.unwrap();
        store.set_ex("files:user:42:count", "5", 60).await.unwrap();
        store.set_ex("files:user:7:list", "[]", 60).await.unwrap();

        let mut matched = store.keys("files:user:42:*").await.unwrap();
        matched.sort();
        assert_eq!(
            matched,
            vec![
                "files:user:42:count".to_string(),
                "files:user:42:list".to_string()
            ]
        );

        let deleted = store.del(&matched).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.get("files:user:42:list").await.unwrap(), None);
        assert_eq!(
            store.get("files:user:7:list").await.unwrap(),
            Some("[]".to_string())
        );
    }

    #[tokio::test]
    async fn test_memory_store_key_expiry_covers_sorted_sets() {
        let store = MemoryStore::new();
        store.zadd("w", "a", 10).await.unwrap();
        store.expire("w", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(store.zcard("w").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_del_empty_is_noop() {
        let store = MemoryStore::new();
        assert_eq!(store.del(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_memory_store_ping_always_succeeds() {
        let store = MemoryStore::new();
        assert_ok!(store.ping().await);
    }
}
