//! Shared test fixtures.

use async_trait::async_trait;
use driftbox_core::error::{DriftboxError, Result};
use driftbox_core::store::CounterStore;

/// A counter store that errors on every operation, for exercising the
/// fail-open paths.
pub struct FailingStore;

#[async_trait]
impl CounterStore for FailingStore {
    async fn zadd(&self, _: &str, _: &str, _: i64) -> Result<()> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn zcard(&self, _: &str) -> Result<u64> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn zrembyscore(&self, _: &str, _: i64, _: i64) -> Result<u64> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn zrem(&self, _: &str, _: &str) -> Result<u64> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn zrange_withscores(&self, _: &str, _: isize, _: isize) -> Result<Vec<(String, i64)>> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn expire(&self, _: &str, _: i64) -> Result<()> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn get(&self, _: &str) -> Result<Option<String>> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn set_ex(&self, _: &str, _: &str, _: u64) -> Result<()> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn del(&self, _: &[String]) -> Result<u64> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn keys(&self, _: &str) -> Result<Vec<String>> {
        Err(DriftboxError::store("injected failure"))
    }

    async fn ping(&self) -> Result<()> {
        Err(DriftboxError::store("injected failure"))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}
