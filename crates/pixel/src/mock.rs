use super::{PixelError, PixelNetwork};
use anyhow::anyhow;
use async_trait::async_trait;
use bf_core::{ConversionEvent, Network};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Shared, ordered record of collaborator calls.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// In-process pixel that records every event instead of sending it.
/// Used for dry runs and as a test double.
pub struct RecordingPixel {
    network: Network,
    available: AtomicBool,
    failing: AtomicBool,
    calls: Mutex<Vec<ConversionEvent>>,
    log: Option<CallLog>,
}

impl RecordingPixel {
    pub fn new(network: Network) -> Arc<Self> {
        Arc::new(Self {
            network,
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            log: None,
        })
    }

    /// Also appends `dispatch:<network>` to `log` on each call.
    pub fn with_log(network: Network, log: CallLog) -> Arc<Self> {
        Arc::new(Self {
            network,
            available: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            log: Some(log),
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ConversionEvent> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PixelNetwork for RecordingPixel {
    fn network(&self) -> Network {
        self.network
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn dispatch(&self, event: &ConversionEvent) -> Result<(), PixelError> {
        if let Some(log) = &self.log {
            if let Ok(mut entries) = log.lock() {
                entries.push(format!("dispatch:{}", self.network));
            }
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("{} global is malformed", self.network).into());
        }
        tracing::info!(
            network=%self.network,
            event=%event.kind.wire_name(self.network),
            event_id=?event.event_id,
            has_matching=event.matching.is_some(),
            "recorded pixel event"
        );
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(event.clone());
        }
        Ok(())
    }
}
