use crate::orchestrator::ConversionOrchestrator;
use bf_core::validation::validate_lead_form;
use bf_core::LeadForm;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use store::LeadStore;
use thiserror::Error;
use url::form_urlencoded;

pub const THANK_YOU_PATH: &str = "/thank-you";
pub const LEAD_ID_PARAM: &str = "lead_id";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("a submission is already in progress")]
    AlreadySubmitting,
    #[error("invalid registration: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("failed to save lead: {0}")]
    Store(#[source] anyhow::Error),
}

/// Where the visitor lands after a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThankYouRedirect {
    pub lead_id: String,
}

impl ThankYouRedirect {
    pub fn to_path(&self) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair(LEAD_ID_PARAM, &self.lead_id)
            .finish();
        format!("{THANK_YOU_PATH}?{query}")
    }

    /// Reads `lead_id` from a query string. Missing or empty means the visitor
    /// navigated to the thank-you view directly.
    pub fn parse_lead_id(query: &str) -> Option<String> {
        let query = query.split_once('?').map_or(query, |(_, q)| q);
        form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == LEAD_ID_PARAM)
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

/// Resets the in-progress flag however the submission ends.
struct SubmittingGuard<'a>(&'a AtomicBool);

impl Drop for SubmittingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The registration form: validate, fire the matching event, save the lead.
pub struct SubmissionFlow {
    orchestrator: Arc<ConversionOrchestrator>,
    store: Arc<dyn LeadStore>,
    submitting: AtomicBool,
}

impl SubmissionFlow {
    pub fn new(orchestrator: Arc<ConversionOrchestrator>, store: Arc<dyn LeadStore>) -> Self {
        Self {
            orchestrator,
            store,
            submitting: AtomicBool::new(false),
        }
    }

    pub async fn submit(&self, form: &LeadForm) -> Result<ThankYouRedirect, SubmitError> {
        if self
            .submitting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SubmitError::AlreadySubmitting);
        }
        let _guard = SubmittingGuard(&self.submitting);

        validate_lead_form(form).map_err(SubmitError::Invalid)?;

        // Hashing is awaited so the event carries matching data; delivery
        // itself is detached and never holds up the save.
        self.orchestrator.track_matched_lead(form).await;

        let lead = self
            .store
            .create_lead(form)
            .await
            .map_err(SubmitError::Store)?;
        tracing::info!(lead_id=%lead.id, "registration saved");

        Ok(ThankYouRedirect { lead_id: lead.id })
    }
}
