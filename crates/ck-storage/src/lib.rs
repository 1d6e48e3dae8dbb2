use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[cfg(feature = "rocksdb")]
mod rocks;

#[cfg(feature = "rocksdb")]
pub use rocks::RocksDbStore;

/// Encrypted key material for key-backed wallets, addressed by slot name.
#[async_trait]
pub trait Keystore: Send + Sync {
    async fn save_encrypted_key(&self, slot: &str, encrypted_key: Vec<u8>) -> Result<()>;
    async fn load_encrypted_key(&self, slot: &str) -> Result<Option<Vec<u8>>>;
    async fn delete_encrypted_key(&self, slot: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastConnectedRecord {
    pub wallet_id: String,
    pub chain_id: u64,
    pub connected_at_epoch_ms: u128,
}

/// Remembers which wallet was last connected so it can be restored on startup.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save_last_connected(&self, record: &LastConnectedRecord) -> Result<()>;
    async fn load_last_connected(&self) -> Result<Option<LastConnectedRecord>>;
    async fn clear_last_connected(&self) -> Result<()>;
}

#[derive(Default)]
pub struct NoopKeystore;

#[async_trait]
impl Keystore for NoopKeystore {
    async fn save_encrypted_key(&self, _slot: &str, _encrypted_key: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn load_encrypted_key(&self, _slot: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn delete_encrypted_key(&self, _slot: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryKeystore {
    keys: RwLock<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl Keystore for InMemoryKeystore {
    async fn save_encrypted_key(&self, slot: &str, encrypted_key: Vec<u8>) -> Result<()> {
        let mut guard = self.keys.write().await;
        guard.insert(slot.to_owned(), encrypted_key);
        Ok(())
    }

    async fn load_encrypted_key(&self, slot: &str) -> Result<Option<Vec<u8>>> {
        let guard = self.keys.read().await;
        Ok(guard.get(slot).cloned())
    }

    async fn delete_encrypted_key(&self, slot: &str) -> Result<()> {
        let mut guard = self.keys.write().await;
        guard.remove(slot);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    last: RwLock<Option<LastConnectedRecord>>,
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn save_last_connected(&self, record: &LastConnectedRecord) -> Result<()> {
        *self.last.write().await = Some(record.clone());
        Ok(())
    }

    async fn load_last_connected(&self) -> Result<Option<LastConnectedRecord>> {
        Ok(self.last.read().await.clone())
    }

    async fn clear_last_connected(&self) -> Result<()> {
        *self.last.write().await = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_keystore_slots() -> Result<()> {
        let keystore = InMemoryKeystore::default();
        assert!(keystore.load_encrypted_key("local").await?.is_none());

        keystore.save_encrypted_key("local", vec![1, 2, 3]).await?;
        assert_eq!(keystore.load_encrypted_key("local").await?, Some(vec![1, 2, 3]));

        keystore.delete_encrypted_key("local").await?;
        assert!(keystore.load_encrypted_key("local").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn session_store_overwrites_and_clears() -> Result<()> {
        let store = InMemorySessionStore::default();
        let first = LastConnectedRecord {
            wallet_id: "metamask".to_owned(),
            chain_id: 1,
            connected_at_epoch_ms: 1_700_000_000_000,
        };
        let second = LastConnectedRecord {
            wallet_id: "local".to_owned(),
            ..first.clone()
        };

        store.save_last_connected(&first).await?;
        store.save_last_connected(&second).await?;
        assert_eq!(store.load_last_connected().await?, Some(second));

        store.clear_last_connected().await?;
        assert_eq!(store.load_last_connected().await?, None);
        Ok(())
    }
}
