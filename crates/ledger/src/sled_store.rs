use super::{LedgerEntry, LedgerError, MarkerStore};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use sled::Db;
use std::path::Path;

const TREE_NAME: &str = "fired_events";

/// Markers persisted in a sled tree; they survive restarts until they expire.
#[derive(Clone)]
pub struct SledMarkerStore {
    tree: sled::Tree,
    retention: Duration,
}

impl SledMarkerStore {
    pub fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self, LedgerError> {
        let db = sled::open(path)?;
        Self::from_db(&db, retention)
    }

    pub fn from_db(db: &Db, retention: Duration) -> Result<Self, LedgerError> {
        Ok(Self {
            tree: db.open_tree(TREE_NAME)?,
            retention,
        })
    }

    /// Number of markers on disk, expired or not.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn read_entry(&self, key: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MarkerStore for SledMarkerStore {
    async fn has(&self, key: &str) -> Result<bool, LedgerError> {
        let Some(entry) = self.read_entry(key)? else {
            return Ok(false);
        };
        if entry.is_expired(Utc::now(), self.retention) {
            self.tree.remove(key.as_bytes())?;
            tracing::debug!(key, "expired ledger entry dropped on read");
            return Ok(false);
        }
        Ok(entry.fired)
    }

    async fn mark(&self, key: &str) -> Result<(), LedgerError> {
        let entry = LedgerEntry::now();
        self.tree
            .insert(key.as_bytes(), serde_json::to_vec(&entry)?)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, LedgerError> {
        let now = Utc::now();
        let mut expired = Vec::new();
        for item in self.tree.iter() {
            let (k, v) = item?;
            // Unreadable entries are dropped with the expired ones
            let stale = serde_json::from_slice::<LedgerEntry>(&v)
                .map(|e| e.is_expired(now, self.retention))
                .unwrap_or(true);
            if stale {
                expired.push(k);
            }
        }
        for k in &expired {
            self.tree.remove(k)?;
        }
        Ok(expired.len())
    }
}
