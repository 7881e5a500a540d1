//! At-most-once bookkeeping for conversion events.
//!
//! A key is marked *before* the event is dispatched. Markers expire after the
//! retention window so storage stays bounded. The guarantee is local to one
//! device; cross-device duplicates are left to the ad network's own event-id
//! matching.

mod memory;
mod sled_store;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

pub use memory::MemoryMarkerStore;
pub use sled_store::SledMarkerStore;

pub const DEFAULT_RETENTION_HOURS: i64 = 24;
const KEY_PREFIX: &str = "lead_event_fired_";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("corrupt ledger entry: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub fired: bool,
    pub written_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn now() -> Self {
        Self {
            fired: true,
            written_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        now - self.written_at >= retention
    }
}

/// Durable presence markers with implicit expiry.
#[async_trait]
pub trait MarkerStore: Send + Sync {
    async fn has(&self, key: &str) -> Result<bool, LedgerError>;
    async fn mark(&self, key: &str) -> Result<(), LedgerError>;

    /// Drops expired markers, returning how many were removed.
    async fn purge_expired(&self) -> Result<usize, LedgerError> {
        Ok(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Lead(String),
    /// No lead id reached the thank-you view. Scoped to the session only.
    Generic,
}

impl DedupKey {
    pub fn from_lead_id(lead_id: Option<&str>) -> Self {
        match lead_id.map(str::trim) {
            Some(id) if !id.is_empty() => DedupKey::Lead(id.to_string()),
            _ => DedupKey::Generic,
        }
    }

    pub fn storage_key(&self) -> String {
        match self {
            DedupKey::Lead(id) => format!("{KEY_PREFIX}{id}"),
            DedupKey::Generic => format!("{KEY_PREFIX}generic"),
        }
    }

    pub fn lead_id(&self) -> Option<&str> {
        match self {
            DedupKey::Lead(id) => Some(id),
            DedupKey::Generic => None,
        }
    }
}

/// Routes lead-scoped keys to the durable store and the generic fallback key
/// to the session store.
pub struct DedupLedger {
    durable: Arc<dyn MarkerStore>,
    session: Arc<dyn MarkerStore>,
    retention: Duration,
}

impl DedupLedger {
    pub fn new(durable: Arc<dyn MarkerStore>, session: Arc<dyn MarkerStore>) -> Self {
        Self {
            durable,
            session,
            retention: Duration::hours(DEFAULT_RETENTION_HOURS),
        }
    }

    /// Sets the window reported by [`DedupLedger::retention`]. It should match
    /// the retention the stores were built with.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn open(path: impl AsRef<Path>, retention: Duration) -> Result<Self, LedgerError> {
        let durable = SledMarkerStore::open(path, retention)?;
        let ledger = Self::new(
            Arc::new(durable),
            Arc::new(MemoryMarkerStore::new(retention)),
        );
        Ok(ledger.with_retention(retention))
    }

    pub fn in_memory(retention: Duration) -> Self {
        Self::new(
            Arc::new(MemoryMarkerStore::new(retention)),
            Arc::new(MemoryMarkerStore::new(retention)),
        )
        .with_retention(retention)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn store_for(&self, key: &DedupKey) -> &Arc<dyn MarkerStore> {
        match key {
            DedupKey::Lead(_) => &self.durable,
            DedupKey::Generic => &self.session,
        }
    }

    pub async fn has_fired(&self, key: &DedupKey) -> Result<bool, LedgerError> {
        self.store_for(key).has(&key.storage_key()).await
    }

    pub async fn mark_fired(&self, key: &DedupKey) -> Result<(), LedgerError> {
        self.store_for(key).mark(&key.storage_key()).await
    }

    pub async fn purge_expired(&self) -> Result<usize, LedgerError> {
        let durable = self.durable.purge_expired().await?;
        let session = self.session.purge_expired().await?;
        Ok(durable + session)
    }

    /// Periodically purges expired markers for as long as the runtime lives.
    pub fn spawn_sweeper(self: Arc<Self>, interval: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "expired ledger entries purged"),
                    Err(e) => tracing::warn!(error=%e, "ledger sweep failed"),
                }
            }
        })
    }
}
