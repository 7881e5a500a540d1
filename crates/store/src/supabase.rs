use super::{phone_digits, LeadStore};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bf_core::{
    default_segments, CrmSegment, Lead, LeadForm, LeadStatus, NewSegment, SegmentPatch,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

const LEADS_TABLE: &str = "leads";
const SEGMENTS_TABLE: &str = "crm_segments";
// PostgREST refuses an unfiltered DELETE; no row has the nil UUID.
const NIL_ID_FILTER: &str = "neq.00000000-0000-0000-0000-000000000000";

/// Lead rows over the Supabase PostgREST interface.
#[derive(Clone)]
pub struct SupabaseLeadStore {
    pub base_url: String,
    api_key: String,
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct StatusPatch {
    status: LeadStatus,
}

#[derive(Debug, Serialize)]
struct SegmentAssignment<'a> {
    segment_id: &'a str,
}

impl SupabaseLeadStore {
    pub fn new(base_url: String, api_key: String) -> Arc<Self> {
        Arc::new(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            http_client: reqwest::Client::new(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn table(&self, table: &str, method: reqwest::Method) -> reqwest::RequestBuilder {
        self.http_client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        self.table(LEADS_TABLE, method)
    }

    async fn expect_success(resp: reqwest::Response, what: &str) -> Result<()> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Supabase {} failed: {} - {}", what, status, body);
        }
        Ok(())
    }

    async fn single<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T> {
        Self::rows(resp, what)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Supabase {} returned no row", what))
    }

    async fn rows<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<Vec<T>> {
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Supabase {} failed: {} - {}", what, status, body);
        }
        resp.json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }
}

/// PostgREST `in.(...)` list with each id quoted.
fn in_filter(ids: &[String]) -> String {
    let quoted: Vec<String> = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('"', "")))
        .collect();
    format!("in.({})", quoted.join(","))
}

#[async_trait]
impl LeadStore for SupabaseLeadStore {
    async fn create_lead(&self, form: &LeadForm) -> Result<Lead> {
        let resp = self
            .request(reqwest::Method::POST)
            .header("Prefer", "return=representation")
            .json(&[form])
            .send()
            .await
            .context("Failed to insert lead")?;

        let lead: Lead = Self::single(resp, "insert").await?;
        tracing::info!(lead_id = %lead.id, "Lead created");
        Ok(lead)
    }

    async fn list_leads(&self) -> Result<Vec<Lead>> {
        let resp = self
            .request(reqwest::Method::GET)
            .query(&[("select", "*"), ("order", "created_at.desc")])
            .send()
            .await
            .context("Failed to list leads")?;
        Self::rows(resp, "select").await
    }

    async fn search_leads(&self, phone: &str) -> Result<Vec<Lead>> {
        let digits = phone_digits(phone);
        let filter = format!(
            "(user_phone.ilike.*{0}*,friend_phone.ilike.*{0}*)",
            digits
        );
        let resp = self
            .request(reqwest::Method::GET)
            .query(&[
                ("select", "*"),
                ("or", filter.as_str()),
                ("order", "created_at.desc"),
            ])
            .send()
            .await
            .context("Failed to search leads")?;
        Self::rows(resp, "search").await
    }

    async fn update_status(&self, id: &str, status: LeadStatus) -> Result<Lead> {
        let id_filter = format!("eq.{}", id);
        let resp = self
            .request(reqwest::Method::PATCH)
            .header("Prefer", "return=representation")
            .query(&[("id", id_filter.as_str())])
            .json(&StatusPatch { status })
            .send()
            .await
            .context("Failed to update lead status")?;
        Self::rows(resp, "update")
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("lead not found: {id}"))
    }

    async fn update_status_batch(&self, ids: &[String], status: LeadStatus) -> Result<Vec<Lead>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .request(reqwest::Method::PATCH)
            .header("Prefer", "return=representation")
            .query(&[("id", in_filter(ids))])
            .json(&StatusPatch { status })
            .send()
            .await
            .context("Failed to update lead statuses")?;
        Self::rows(resp, "batch update").await
    }

    async fn delete_leads(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let resp = self
            .request(reqwest::Method::DELETE)
            .query(&[("id", in_filter(ids))])
            .send()
            .await
            .context("Failed to delete leads")?;
        Self::expect_success(resp, "delete").await?;
        tracing::info!(count = ids.len(), "Leads deleted");
        Ok(())
    }

    async fn delete_all_leads(&self) -> Result<()> {
        let resp = self
            .request(reqwest::Method::DELETE)
            .query(&[("id", NIL_ID_FILTER)])
            .send()
            .await
            .context("Failed to delete all leads")?;
        Self::expect_success(resp, "delete all").await?;
        tracing::warn!("All leads deleted");
        Ok(())
    }

    async fn list_segments(&self) -> Result<Vec<CrmSegment>> {
        let resp = self
            .table(SEGMENTS_TABLE, reqwest::Method::GET)
            .query(&[("select", "*"), ("order", "order_index.asc")])
            .send()
            .await;
        let segments: Result<Vec<CrmSegment>> = match resp {
            Ok(resp) => Self::rows(resp, "segments").await,
            Err(e) => Err(e.into()),
        };
        // The pipeline is still usable with the built-in columns.
        Ok(segments.unwrap_or_else(|e| {
            tracing::warn!(error=%e, "Failed to fetch segments, using defaults");
            default_segments()
        }))
    }

    async fn create_segment(&self, segment: &NewSegment) -> Result<CrmSegment> {
        let resp = self
            .table(SEGMENTS_TABLE, reqwest::Method::POST)
            .header("Prefer", "return=representation")
            .json(&[segment])
            .send()
            .await
            .context("Failed to create segment")?;
        Self::single(resp, "segment insert").await
    }

    async fn update_segment(&self, id: &str, patch: &SegmentPatch) -> Result<CrmSegment> {
        let id_filter = format!("eq.{}", id);
        let resp = self
            .table(SEGMENTS_TABLE, reqwest::Method::PATCH)
            .header("Prefer", "return=representation")
            .query(&[("id", id_filter.as_str())])
            .json(patch)
            .send()
            .await
            .context("Failed to update segment")?;
        Self::single(resp, "segment update").await
    }

    async fn delete_segment(&self, id: &str, move_to: Option<&str>) -> Result<()> {
        let id_filter = format!("eq.{}", id);
        if let Some(target) = move_to {
            let resp = self
                .request(reqwest::Method::PATCH)
                .query(&[("segment_id", id_filter.as_str())])
                .json(&SegmentAssignment { segment_id: target })
                .send()
                .await
                .context("Failed to move leads out of segment")?;
            Self::expect_success(resp, "segment move").await?;
        }
        let resp = self
            .table(SEGMENTS_TABLE, reqwest::Method::DELETE)
            .query(&[("id", id_filter.as_str())])
            .send()
            .await
            .context("Failed to delete segment")?;
        Self::expect_success(resp, "segment delete").await?;
        tracing::info!(segment_id = id, "Segment deleted");
        Ok(())
    }

    async fn update_lead_segment(&self, lead_id: &str, segment_id: &str) -> Result<Lead> {
        let id_filter = format!("eq.{}", lead_id);
        let resp = self
            .request(reqwest::Method::PATCH)
            .header("Prefer", "return=representation")
            .query(&[("id", id_filter.as_str())])
            .json(&SegmentAssignment { segment_id })
            .send()
            .await
            .context("Failed to update lead segment")?;
        Self::single(resp, "segment assignment").await
    }

    async fn update_segment_batch(&self, ids: &[String], segment_id: &str) -> Result<Vec<Lead>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let resp = self
            .request(reqwest::Method::PATCH)
            .header("Prefer", "return=representation")
            .query(&[("id", in_filter(ids))])
            .json(&SegmentAssignment { segment_id })
            .send()
            .await
            .context("Failed to update lead segments")?;
        Self::rows(resp, "batch segment assignment").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_filter_quotes_ids() {
        let ids = vec!["a1".to_string(), "b\"2".to_string()];
        assert_eq!(in_filter(&ids), "in.(\"a1\",\"b2\")");
    }

    #[test]
    fn test_table_url_trims_trailing_slash() {
        let store = SupabaseLeadStore::new("https://x.supabase.co/".into(), "key".into());
        assert_eq!(
            store.table_url(LEADS_TABLE),
            "https://x.supabase.co/rest/v1/leads"
        );
        assert_eq!(
            store.table_url(SEGMENTS_TABLE),
            "https://x.supabase.co/rest/v1/crm_segments"
        );
    }
}
