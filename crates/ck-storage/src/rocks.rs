use anyhow::Result;
use async_trait::async_trait;
use rocksdb::{DB, Options};
use std::sync::Arc;

use crate::{Keystore, LastConnectedRecord, SessionStore};

const LAST_CONNECTED_KEY: &str = "session:last-connected";

/// Durable store for desktop hosts; one database serves both traits.
pub struct RocksDbStore {
    db: Arc<DB>,
}

impl RocksDbStore {
    pub fn open_default(path: &str) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn key_for_slot(slot: &str) -> String {
        format!("wallet-key:{slot}")
    }
}

#[async_trait]
impl Keystore for RocksDbStore {
    async fn save_encrypted_key(&self, slot: &str, encrypted_key: Vec<u8>) -> Result<()> {
        let key = Self::key_for_slot(slot);
        self.db.put(key.as_bytes(), encrypted_key)?;
        Ok(())
    }

    async fn load_encrypted_key(&self, slot: &str) -> Result<Option<Vec<u8>>> {
        let key = Self::key_for_slot(slot);
        let value = self.db.get(key.as_bytes())?;
        Ok(value.map(|v| v.to_vec()))
    }

    async fn delete_encrypted_key(&self, slot: &str) -> Result<()> {
        let key = Self::key_for_slot(slot);
        self.db.delete(key.as_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for RocksDbStore {
    async fn save_last_connected(&self, record: &LastConnectedRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.db.put(LAST_CONNECTED_KEY.as_bytes(), value)?;
        Ok(())
    }

    async fn load_last_connected(&self) -> Result<Option<LastConnectedRecord>> {
        match self.db.get(LAST_CONNECTED_KEY.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice::<LastConnectedRecord>(&raw)?)),
            None => Ok(None),
        }
    }

    async fn clear_last_connected(&self) -> Result<()> {
        self.db.delete(LAST_CONNECTED_KEY.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rocksdb_store_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().to_string_lossy().to_string();

        let record = LastConnectedRecord {
            wallet_id: "coinbase".to_owned(),
            chain_id: 8453,
            connected_at_epoch_ms: 1_700_000_000_123,
        };

        {
            let store = RocksDbStore::open_default(&path)?;
            store.save_encrypted_key("local", vec![9; 80]).await?;
            store.save_last_connected(&record).await?;
        }

        let store = RocksDbStore::open_default(&path)?;
        assert_eq!(store.load_encrypted_key("local").await?, Some(vec![9; 80]));
        assert_eq!(store.load_last_connected().await?, Some(record));

        store.clear_last_connected().await?;
        assert!(store.load_last_connected().await?.is_none());
        Ok(())
    }
}
