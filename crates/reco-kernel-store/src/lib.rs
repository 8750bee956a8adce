//! Key-value persistence for catalog-aligned structures.
//!
//! Everything the kernel persists lives behind [`KvStore`]: plain byte values
//! and hashes of byte fields. [`MemoryKvStore`] backs tests and one-shot CLI
//! runs, [`SqliteKvStore`] backs the service.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

pub mod catalog;
pub mod keys;
mod memory;
mod sqlite;

pub use catalog::{ItemCatalog, KvItemCatalog, LoadSummary};
pub use memory::MemoryKvStore;
pub use sqlite::{SchemaStatus, SqliteKvStore};

/// Byte-oriented key-value store with hash support.
///
/// Absent keys and fields are not errors: reads return `None` or an empty
/// map, deletes of missing entries succeed.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a plain value or a whole hash.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Read several fields at once; the result is aligned with `fields`.
    async fn hmget(&self, key: &str, fields: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>>;

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<Vec<u8>, Vec<u8>>>;

    async fn hset(&self, key: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()>;

    async fn hdel(&self, key: &str, fields: &[Vec<u8>]) -> Result<()>;

    /// Replace a hash wholesale so no stale field survives.
    async fn replace_hash(&self, key: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.delete(key).await?;
        if entries.is_empty() {
            return Ok(());
        }
        self.hset(key, entries).await
    }
}
