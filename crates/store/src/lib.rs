use anyhow::Result;
use async_trait::async_trait;
use bf_core::{CrmSegment, Lead, LeadForm, LeadStatus, ManualLead, NewSegment, SegmentPatch};

pub mod export;
pub mod mock;
pub mod supabase;

/// The hosted row store holding registrations and the CRM pipeline.
#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Inserts a lead; the store assigns `id`, `created_at` and `status`.
    async fn create_lead(&self, form: &LeadForm) -> Result<Lead>;
    async fn create_lead_manually(&self, lead: ManualLead) -> Result<Lead> {
        self.create_lead(&lead.into_form()).await
    }
    /// Newest first.
    async fn list_leads(&self) -> Result<Vec<Lead>>;
    /// Leads where either phone contains the digits of `phone`.
    async fn search_leads(&self, phone: &str) -> Result<Vec<Lead>>;
    async fn update_status(&self, id: &str, status: LeadStatus) -> Result<Lead>;
    async fn update_status_batch(&self, ids: &[String], status: LeadStatus) -> Result<Vec<Lead>>;
    async fn delete_leads(&self, ids: &[String]) -> Result<()>;
    async fn delete_all_leads(&self) -> Result<()>;

    /// Ordered by `order_index`.
    async fn list_segments(&self) -> Result<Vec<CrmSegment>>;
    async fn create_segment(&self, segment: &NewSegment) -> Result<CrmSegment>;
    async fn update_segment(&self, id: &str, patch: &SegmentPatch) -> Result<CrmSegment>;
    /// Removes a segment, first refiling its leads under `move_to` if given.
    async fn delete_segment(&self, id: &str, move_to: Option<&str>) -> Result<()>;
    async fn update_lead_segment(&self, lead_id: &str, segment_id: &str) -> Result<Lead>;
    async fn update_segment_batch(&self, ids: &[String], segment_id: &str) -> Result<Vec<Lead>>;
}

/// Digits only, so "010-1234" and "0101234" search alike on every backend.
pub(crate) fn phone_digits(phone: &str) -> String {
    phone.chars().filter(char::is_ascii_digit).collect()
}
