use super::{LedgerError, MarkerStore};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Markers that live as long as the process, the equivalent of a browser
/// session's storage.
pub struct MemoryMarkerStore {
    retention: Duration,
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryMarkerStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            retention,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of markers held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, DateTime<Utc>>>, LedgerError> {
        self.entries
            .lock()
            .map_err(|_| LedgerError::Unavailable("session store lock poisoned".to_string()))
    }
}

#[async_trait]
impl MarkerStore for MemoryMarkerStore {
    async fn has(&self, key: &str) -> Result<bool, LedgerError> {
        let mut entries = self.lock()?;
        let fresh = entries
            .get(key)
            .map(|written_at| Utc::now() - *written_at < self.retention);
        match fresh {
            Some(true) => Ok(true),
            Some(false) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn mark(&self, key: &str) -> Result<(), LedgerError> {
        self.lock()?.insert(key.to_string(), Utc::now());
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, LedgerError> {
        let now = Utc::now();
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, written_at| now - *written_at < self.retention);
        Ok(before - entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mark_then_has() {
        let store = MemoryMarkerStore::new(Duration::hours(24));
        assert!(!store.has("k").await.expect("has"));
        store.mark("k").await.expect("mark");
        assert!(store.has("k").await.expect("has"));
    }

    #[tokio::test]
    async fn test_expired_markers_are_absent() {
        let store = MemoryMarkerStore::new(Duration::zero());
        store.mark("k").await.expect("mark");
        assert!(!store.has("k").await.expect("has"));

        store.mark("a").await.expect("mark");
        store.mark("b").await.expect("mark");
        assert_eq!(store.purge_expired().await.expect("purge"), 2);
    }
}
