use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::KvStore;

#[derive(Debug, Default)]
struct Tables {
    values: BTreeMap<String, Vec<u8>>,
    hashes: BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
}

/// Process-local store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    tables: RwLock<Tables>,
}

impl MemoryKvStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.read().values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.tables.write().values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut tables = self.tables.write();
        tables.values.remove(key);
        tables.hashes.remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.tables.read().hashes.get(key).and_then(|hash| hash.get(field)).cloned())
    }

    async fn hmget(&self, key: &str, fields: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let tables = self.tables.read();
        let hash = tables.hashes.get(key);
        Ok(fields
            .iter()
            .map(|field| hash.and_then(|hash| hash.get(field)).cloned())
            .collect())
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        Ok(self.tables.read().hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hset(&self, key: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        self.tables.write().hashes.entry(key.to_string()).or_default().extend(entries);
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[Vec<u8>]) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(hash) = tables.hashes.get_mut(key) {
            for field in fields {
                hash.remove(field);
            }
            if hash.is_empty() {
                tables.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn replace_hash(&self, key: &str, entries: Vec<(Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut tables = self.tables.write();
        tables.values.remove(key);
        if entries.is_empty() {
            tables.hashes.remove(key);
        } else {
            tables.hashes.insert(key.to_string(), entries.into_iter().collect());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract;

    #[tokio::test]
    async fn memory_store_honours_the_kv_contract() -> Result<()> {
        contract::exercise(&MemoryKvStore::new()).await
    }
}
