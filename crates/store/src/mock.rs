use super::{phone_digits, LeadStore};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bf_core::{
    default_segments, CrmSegment, Lead, LeadForm, LeadStatus, NewSegment, SegmentPatch,
};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Unconfigured-store fallback: keeps leads in memory and hands out UUIDs.
pub struct MockLeadStore {
    leads: RwLock<Vec<Lead>>,
    segments: RwLock<Vec<CrmSegment>>,
    next_id: RwLock<Option<String>>,
}

impl Default for MockLeadStore {
    fn default() -> Self {
        Self {
            leads: RwLock::new(Vec::new()),
            segments: RwLock::new(default_segments()),
            next_id: RwLock::new(None),
        }
    }
}

impl MockLeadStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes the next `create_lead` use `id` instead of a random UUID.
    pub async fn set_next_id(&self, id: &str) {
        *self.next_id.write().await = Some(id.to_string());
    }
}

#[async_trait]
impl LeadStore for MockLeadStore {
    async fn create_lead(&self, form: &LeadForm) -> Result<Lead> {
        let id = self
            .next_id
            .write()
            .await
            .take()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let lead = Lead {
            id,
            created_at: Utc::now(),
            user_name: form.user_name.clone(),
            user_phone: form.user_phone.clone(),
            friend_name: form.friend_name.clone(),
            friend_phone: form.friend_phone.clone(),
            status: LeadStatus::New,
            segment_id: None,
        };
        self.leads.write().await.push(lead.clone());
        tracing::info!(lead_id=%lead.id, "mock lead created");
        Ok(lead)
    }

    async fn list_leads(&self) -> Result<Vec<Lead>> {
        let mut out = self.leads.read().await.clone();
        out.sort_by_key(|l| l.created_at);
        out.reverse();
        Ok(out)
    }

    async fn search_leads(&self, phone: &str) -> Result<Vec<Lead>> {
        let phone = phone_digits(phone);
        let phone = phone.as_str();
        Ok(self
            .list_leads()
            .await?
            .into_iter()
            .filter(|l| l.user_phone.contains(phone) || l.friend_phone.contains(phone))
            .collect())
    }

    async fn update_status(&self, id: &str, status: LeadStatus) -> Result<Lead> {
        let mut leads = self.leads.write().await;
        let lead = leads
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| anyhow!("lead not found: {id}"))?;
        lead.status = status;
        Ok(lead.clone())
    }

    async fn update_status_batch(&self, ids: &[String], status: LeadStatus) -> Result<Vec<Lead>> {
        let mut leads = self.leads.write().await;
        let mut updated = Vec::new();
        for lead in leads.iter_mut().filter(|l| ids.contains(&l.id)) {
            lead.status = status;
            updated.push(lead.clone());
        }
        Ok(updated)
    }

    async fn delete_leads(&self, ids: &[String]) -> Result<()> {
        self.leads.write().await.retain(|l| !ids.contains(&l.id));
        Ok(())
    }

    async fn delete_all_leads(&self) -> Result<()> {
        let mut leads = self.leads.write().await;
        tracing::warn!(count = leads.len(), "mock store wiped");
        leads.clear();
        Ok(())
    }

    async fn list_segments(&self) -> Result<Vec<CrmSegment>> {
        let mut out = self.segments.read().await.clone();
        out.sort_by_key(|s| s.order_index);
        Ok(out)
    }

    async fn create_segment(&self, segment: &NewSegment) -> Result<CrmSegment> {
        let created = CrmSegment {
            id: uuid::Uuid::new_v4().to_string(),
            name: segment.name.clone(),
            color: segment.color.clone(),
            order_index: segment.order_index,
            created_at: Some(Utc::now()),
        };
        self.segments.write().await.push(created.clone());
        Ok(created)
    }

    async fn update_segment(&self, id: &str, patch: &SegmentPatch) -> Result<CrmSegment> {
        let mut segments = self.segments.write().await;
        let segment = segments
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| anyhow!("segment not found: {id}"))?;
        patch.apply(segment);
        Ok(segment.clone())
    }

    async fn delete_segment(&self, id: &str, move_to: Option<&str>) -> Result<()> {
        if let Some(target) = move_to {
            for lead in self.leads.write().await.iter_mut() {
                if lead.segment_id.as_deref() == Some(id) {
                    lead.segment_id = Some(target.to_string());
                }
            }
        }
        self.segments.write().await.retain(|s| s.id != id);
        Ok(())
    }

    async fn update_lead_segment(&self, lead_id: &str, segment_id: &str) -> Result<Lead> {
        let mut leads = self.leads.write().await;
        let lead = leads
            .iter_mut()
            .find(|l| l.id == lead_id)
            .ok_or_else(|| anyhow!("lead not found: {lead_id}"))?;
        lead.segment_id = Some(segment_id.to_string());
        Ok(lead.clone())
    }

    async fn update_segment_batch(&self, ids: &[String], segment_id: &str) -> Result<Vec<Lead>> {
        let mut leads = self.leads.write().await;
        let mut updated = Vec::new();
        for lead in leads.iter_mut().filter(|l| ids.contains(&l.id)) {
            lead.segment_id = Some(segment_id.to_string());
            updated.push(lead.clone());
        }
        Ok(updated)
    }
}
