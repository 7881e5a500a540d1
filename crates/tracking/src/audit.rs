use anyhow::Result;
use bf_core::Network;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event_type: String,
    pub dedup_key: Option<String>,
    pub lead_id: Option<String>,
    pub networks: Vec<String>,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(event_type: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type: event_type.to_string(),
            dedup_key: None,
            lead_id: None,
            networks: Vec::new(),
            error: None,
        }
    }

    pub fn with_key(mut self, dedup_key: String, lead_id: Option<&str>) -> Self {
        self.dedup_key = Some(dedup_key);
        self.lead_id = lead_id.map(str::to_owned);
        self
    }

    pub fn with_networks(mut self, networks: &[Network]) -> Self {
        self.networks = networks.iter().map(|n| n.as_str().to_string()).collect();
        self
    }

    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

pub fn write_audit_event(path: &Path, event: &AuditEvent) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    let json = serde_json::to_string(event)?;
    writeln!(file, "{}", json)?;
    tracing::debug!(
        event_type=%event.event_type,
        dedup_key=?event.dedup_key,
        "Audit event written"
    );
    Ok(())
}
