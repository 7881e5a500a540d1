//! Decides, once per lead, whether and how the ad pixels hear about a
//! conversion.
//!
//! Two entry points match two moments of the funnel:
//!
//! * [`ConversionOrchestrator::track_matched_lead`] runs before the lead is
//!   saved and sends a `Lead` to Meta enriched with hashed identity data.
//! * [`ConversionOrchestrator::confirm_conversion`] runs on the thank-you view
//!   and fires the conversion to every available network at most once per
//!   dedup key, even if the view is mounted repeatedly.
//!
//! Both events reach Meta as `Lead` without a shared event id, so Meta may
//! count one registration twice. That matches the live funnel and is kept.
//!
//! Nothing here returns an error to the caller: tracking failures are logged
//! and never block the visitor.

use crate::audit::{write_audit_event, AuditEvent};
use async_trait::async_trait;
use bf_core::hashing::{self, HashError};
use bf_core::{ConversionEvent, CustomData, EventKind, LeadForm, MatchingPayload, Network};
use ledger::{DedupKey, DedupLedger};
use pixel::{DispatchReport, PixelRegistry};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Produces advanced-matching data for a submitter.
#[async_trait]
pub trait MatchingEnricher: Send + Sync {
    async fn enrich(&self, form: &LeadForm) -> Result<MatchingPayload, HashError>;
}

pub struct Sha256Enricher;

#[async_trait]
impl MatchingEnricher for Sha256Enricher {
    async fn enrich(&self, form: &LeadForm) -> Result<MatchingPayload, HashError> {
        hashing::matching_for_form(form).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Dispatched(DispatchReport),
    /// Another invocation in this process already took the key.
    AlreadyClaimed,
    /// The ledger remembers an earlier dispatch for the key.
    AlreadyFired,
}

pub struct ConversionOrchestrator {
    pixels: Arc<PixelRegistry>,
    ledger: Arc<DedupLedger>,
    enricher: Arc<dyn MatchingEnricher>,
    // Checked synchronously before the ledger, whose reads can suspend.
    // Claims lapse with the ledger's retention window.
    claimed: Mutex<HashMap<DedupKey, DateTime<Utc>>>,
    audit_log: Option<PathBuf>,
}

impl ConversionOrchestrator {
    pub fn new(pixels: Arc<PixelRegistry>, ledger: Arc<DedupLedger>) -> Self {
        Self {
            pixels,
            ledger,
            enricher: Arc::new(Sha256Enricher),
            claimed: Mutex::new(HashMap::new()),
            audit_log: None,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn MatchingEnricher>) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_audit_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.audit_log = Some(path.into());
        self
    }

    fn audit(&self, event: AuditEvent) {
        if let Some(path) = &self.audit_log {
            if let Err(e) = write_audit_event(path, &event) {
                tracing::debug!(error=%e, "audit write failed");
            }
        }
    }

    /// Returns false when the key was already claimed in this process and
    /// the claim is still inside the retention window.
    fn claim(&self, key: &DedupKey) -> bool {
        let now = Utc::now();
        let retention = self.ledger.retention();
        let mut claimed = match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        claimed.retain(|_, at| now - *at < retention);
        if claimed.contains_key(key) {
            return false;
        }
        claimed.insert(key.clone(), now);
        true
    }

    pub fn track_page_view(&self) -> DispatchReport {
        let event = ConversionEvent::new(EventKind::PageView);
        self.pixels.dispatch_all(&event, &Network::ALL)
    }

    /// The visitor started filling in the registration form.
    pub fn track_initiate_checkout(&self) -> DispatchReport {
        let event = ConversionEvent::new(EventKind::InitiateCheckout)
            .with_custom_data(CustomData::checkout_started());
        self.pixels.dispatch_all(&event, &[Network::Facebook])
    }

    /// Pre-submission `Lead` with advanced matching. Only the submitter's
    /// name and phone are hashed; the buddy contributes referral counters.
    /// If hashing fails the event still goes out, just without matching data.
    pub async fn track_matched_lead(&self, form: &LeadForm) -> DispatchReport {
        let matching = match self.enricher.enrich(form).await {
            Ok(payload) => {
                tracing::info!(
                    has_phone = !payload.hashed_phone.is_empty(),
                    has_first_name = !payload.hashed_first_name.is_empty(),
                    has_last_name = payload.hashed_last_name.is_some(),
                    "advanced matching prepared"
                );
                Some(payload)
            }
            Err(e) => {
                tracing::warn!(error=%e, "advanced matching unavailable, sending lead without it");
                None
            }
        };
        let enriched = matching.is_some();

        let event = ConversionEvent::new(EventKind::Lead)
            .with_custom_data(CustomData::registration(form))
            .with_matching(matching);
        let report = self.pixels.dispatch_all(&event, &[Network::Facebook]);

        let mut audit = AuditEvent::new("matched_lead_dispatched").with_networks(&report.fired);
        if !enriched {
            audit = audit.with_error("advanced matching unavailable".to_string());
        }
        self.audit(audit);
        report
    }

    /// Thank-you view conversion. Safe to call on every mount: for a given
    /// lead id (or the session fallback when there is none) only the first
    /// call dispatches.
    pub async fn confirm_conversion(&self, lead_id: Option<&str>) -> ConfirmOutcome {
        let key = DedupKey::from_lead_id(lead_id);
        let storage_key = key.storage_key();

        if !self.claim(&key) {
            tracing::info!(dedup_key=%storage_key, "conversion already claimed, skipping");
            self.audit(
                AuditEvent::new("conversion_skipped_claimed").with_key(storage_key, key.lead_id()),
            );
            return ConfirmOutcome::AlreadyClaimed;
        }

        match self.ledger.has_fired(&key).await {
            Ok(true) => {
                tracing::info!(dedup_key=%storage_key, "conversion already fired, skipping");
                let audit = AuditEvent::new("conversion_skipped_fired");
                self.audit(audit.with_key(storage_key, key.lead_id()));
                return ConfirmOutcome::AlreadyFired;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    dedup_key=%storage_key,
                    error=%e,
                    "ledger read failed, firing anyway"
                );
            }
        }

        // Mark before sending so a remount racing this dispatch sees the key.
        let mut ledger_error = None;
        if let Err(e) = self.ledger.mark_fired(&key).await {
            tracing::warn!(dedup_key=%storage_key, error=%e, "ledger write failed, firing anyway");
            ledger_error = Some(e.to_string());
        }

        let event = ConversionEvent::new(EventKind::Lead)
            .with_custom_data(CustomData::venue_fee())
            .with_event_id(key.lead_id().map(str::to_owned))
            .with_dedup_key(storage_key.clone());
        let report = self.pixels.dispatch_all(&event, &Network::ALL);

        tracing::info!(
            dedup_key=%storage_key,
            fired=report.fired.len(),
            unavailable=report.unavailable.len(),
            "conversion dispatched"
        );
        let mut audit = AuditEvent::new("conversion_dispatched")
            .with_key(storage_key, key.lead_id())
            .with_networks(&report.fired);
        if let Some(e) = ledger_error {
            audit = audit.with_error(e);
        }
        self.audit(audit);

        ConfirmOutcome::Dispatched(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ledger::{LedgerError, MarkerStore, MemoryMarkerStore};
    use pixel::mock::{CallLog, RecordingPixel};
    use std::time::Duration as StdDuration;

    /// Marker store double that logs calls, can be slow, and can fail.
    struct ScriptedStore {
        inner: MemoryMarkerStore,
        log: CallLog,
        read_delay: Option<StdDuration>,
        broken: bool,
    }

    impl ScriptedStore {
        fn new(log: CallLog) -> Self {
            Self {
                inner: MemoryMarkerStore::new(Duration::hours(24)),
                log,
                read_delay: None,
                broken: false,
            }
        }

        fn push(&self, entry: String) {
            self.log.lock().expect("log lock").push(entry);
        }
    }

    #[async_trait]
    impl MarkerStore for ScriptedStore {
        async fn has(&self, key: &str) -> Result<bool, LedgerError> {
            self.push(format!("has:{key}"));
            if let Some(delay) = self.read_delay {
                tokio::time::sleep(delay).await;
            }
            if self.broken {
                return Err(LedgerError::Unavailable("storage disabled".into()));
            }
            self.inner.has(key).await
        }

        async fn mark(&self, key: &str) -> Result<(), LedgerError> {
            self.push(format!("mark:{key}"));
            if self.broken {
                return Err(LedgerError::Unavailable("storage disabled".into()));
            }
            self.inner.mark(key).await
        }
    }

    struct FailingEnricher;

    #[async_trait]
    impl MatchingEnricher for FailingEnricher {
        async fn enrich(&self, _form: &LeadForm) -> Result<MatchingPayload, HashError> {
            let join_err = tokio::spawn(async { panic!("subtle crypto missing"); })
                .await
                .expect_err("task panics");
            Err(HashError::Digest(join_err))
        }
    }

    struct Harness {
        log: CallLog,
        fb: Arc<RecordingPixel>,
        tt: Arc<RecordingPixel>,
        snap: Arc<RecordingPixel>,
        pixels: Arc<PixelRegistry>,
    }

    impl Harness {
        fn new() -> Self {
            let log: CallLog = Arc::new(Mutex::new(Vec::new()));
            let fb = RecordingPixel::with_log(Network::Facebook, log.clone());
            let tt = RecordingPixel::with_log(Network::TikTok, log.clone());
            let snap = RecordingPixel::with_log(Network::Snapchat, log.clone());
            let pixels = Arc::new(PixelRegistry::new());
            pixels.install(fb.clone());
            pixels.install(tt.clone());
            pixels.install(snap.clone());
            Self {
                log,
                fb,
                tt,
                snap,
                pixels,
            }
        }

        fn orchestrator(&self, store: ScriptedStore) -> ConversionOrchestrator {
            let ledger = DedupLedger::new(
                Arc::new(store),
                Arc::new(MemoryMarkerStore::new(Duration::hours(24))),
            );
            ConversionOrchestrator::new(self.pixels.clone(), Arc::new(ledger))
        }

        async fn settle(&self) {
            tokio::time::timeout(StdDuration::from_secs(2), self.pixels.wait_idle())
                .await
                .expect("pixel deliveries settle");
        }

        fn total_calls(&self) -> usize {
            self.fb.calls().len() + self.tt.calls().len() + self.snap.calls().len()
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().expect("log lock").clone()
        }
    }

    fn form() -> LeadForm {
        LeadForm {
            user_name: "Ahmed Ali".into(),
            user_phone: "01012345678".into(),
            friend_name: "Omar Said".into(),
            friend_phone: "01112345678".into(),
        }
    }

    #[tokio::test]
    async fn test_second_mount_does_not_dispatch() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(ScriptedStore::new(h.log.clone()));

        let first = orchestrator.confirm_conversion(Some("abc123")).await;
        assert!(matches!(first, ConfirmOutcome::Dispatched(ref r) if r.fired.len() == 3));
        let second = orchestrator.confirm_conversion(Some("abc123")).await;
        assert_eq!(second, ConfirmOutcome::AlreadyClaimed);
        h.settle().await;

        assert_eq!(h.fb.calls().len(), 1);
        assert_eq!(h.tt.calls().len(), 1);
        assert_eq!(h.snap.calls().len(), 1);
        assert_eq!(h.fb.calls()[0].event_id.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_remount_in_new_view_hits_ledger() {
        let h = Harness::new();
        let log = h.log.clone();
        let durable: Arc<dyn MarkerStore> = Arc::new(ScriptedStore::new(log));
        let session = || Arc::new(MemoryMarkerStore::new(Duration::hours(24)));

        let first = ConversionOrchestrator::new(
            h.pixels.clone(),
            Arc::new(DedupLedger::new(durable.clone(), session())),
        );
        first.confirm_conversion(Some("abc123")).await;

        // A fresh orchestrator has an empty in-memory guard
        let second = ConversionOrchestrator::new(
            h.pixels.clone(),
            Arc::new(DedupLedger::new(durable, session())),
        );
        assert_eq!(
            second.confirm_conversion(Some("abc123")).await,
            ConfirmOutcome::AlreadyFired
        );
        h.settle().await;
        assert_eq!(h.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_mark_happens_before_dispatch() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(ScriptedStore::new(h.log.clone()));
        orchestrator.confirm_conversion(Some("abc123")).await;
        h.settle().await;

        let log = h.log();
        assert_eq!(
            log[..2],
            ["has:lead_event_fired_abc123", "mark:lead_event_fired_abc123"]
        );
        // Deliveries run concurrently, so only their set is fixed
        let mut dispatches = log[2..].to_vec();
        dispatches.sort();
        assert_eq!(
            dispatches,
            vec!["dispatch:facebook", "dispatch:snapchat", "dispatch:tiktok"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_double_invoke_dispatches_once() {
        let h = Harness::new();
        let mut store = ScriptedStore::new(h.log.clone());
        store.read_delay = Some(StdDuration::from_millis(20));
        let orchestrator = h.orchestrator(store);

        let (a, b) = tokio::join!(
            orchestrator.confirm_conversion(Some("abc123")),
            orchestrator.confirm_conversion(Some("abc123")),
        );
        let dispatched = [&a, &b]
            .iter()
            .filter(|o| matches!(o, ConfirmOutcome::Dispatched(_)))
            .count();
        assert_eq!(dispatched, 1);
        h.settle().await;
        assert_eq!(h.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_generic_fallback_fires_once_per_session() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(ScriptedStore::new(h.log.clone()));

        orchestrator.confirm_conversion(None).await;
        orchestrator.confirm_conversion(Some("")).await;
        orchestrator.confirm_conversion(None).await;
        h.settle().await;

        assert_eq!(h.fb.calls().len(), 1);
        assert!(h.fb.calls()[0].event_id.is_none());
        // The generic key never touches the durable store
        assert!(h.log().iter().all(|e| !e.starts_with("has:") && !e.starts_with("mark:")));
    }

    #[tokio::test]
    async fn test_broken_ledger_fails_open() {
        let h = Harness::new();
        let mut store = ScriptedStore::new(h.log.clone());
        store.broken = true;
        let orchestrator = h.orchestrator(store);

        let outcome = orchestrator.confirm_conversion(Some("abc123")).await;
        assert!(matches!(outcome, ConfirmOutcome::Dispatched(_)));
        h.settle().await;
        assert_eq!(h.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_no_networks_loaded_is_not_an_error() {
        let ledger = DedupLedger::in_memory(Duration::hours(24));
        let orchestrator =
            ConversionOrchestrator::new(Arc::new(PixelRegistry::new()), Arc::new(ledger));
        let outcome = orchestrator.confirm_conversion(Some("abc123")).await;
        match outcome {
            ConfirmOutcome::Dispatched(report) => {
                assert!(report.none_fired());
                assert_eq!(report.unavailable.len(), 3);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_matched_lead_carries_hashed_identity() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(ScriptedStore::new(h.log.clone()));

        let report = orchestrator.track_matched_lead(&form()).await;
        assert_eq!(report.fired, vec![Network::Facebook]);
        h.settle().await;
        assert_eq!(h.tt.calls().len(), 0);

        let sent = &h.fb.calls()[0];
        assert_eq!(sent.kind, EventKind::Lead);
        assert!(sent.event_id.is_none());
        let matching = sent.matching.as_ref().expect("matching payload");
        assert_eq!(matching.hashed_first_name, hashing::compute_sha256_hex("ahmed"));
        assert_eq!(
            matching.hashed_last_name.as_deref(),
            Some(hashing::compute_sha256_hex("ali").as_str())
        );
        assert_eq!(matching.hashed_phone, hashing::compute_sha256_hex("01012345678"));
        let data = sent.custom_data.as_ref().expect("custom data");
        assert_eq!(data.value, 100.0);
        assert_eq!(data.currency, "EGP");
    }

    #[tokio::test]
    async fn test_matched_lead_survives_hashing_failure() {
        let h = Harness::new();
        let orchestrator = h
            .orchestrator(ScriptedStore::new(h.log.clone()))
            .with_enricher(Arc::new(FailingEnricher));

        let report = orchestrator.track_matched_lead(&form()).await;
        assert_eq!(report.fired, vec![Network::Facebook]);
        h.settle().await;
        assert!(h.fb.calls()[0].matching.is_none());
    }

    #[tokio::test]
    async fn test_page_view_and_checkout() {
        let h = Harness::new();
        let orchestrator = h.orchestrator(ScriptedStore::new(h.log.clone()));

        let report = orchestrator.track_page_view();
        assert_eq!(report.fired.len(), 3);
        h.settle().await;
        let report = orchestrator.track_initiate_checkout();
        assert_eq!(report.fired, vec![Network::Facebook]);
        h.settle().await;
        assert_eq!(h.fb.calls()[1].kind, EventKind::InitiateCheckout);
    }

    #[tokio::test]
    async fn test_claim_lapses_with_ledger_retention() {
        let h = Harness::new();
        let ledger = DedupLedger::in_memory(Duration::zero());
        let orchestrator = ConversionOrchestrator::new(h.pixels.clone(), Arc::new(ledger));

        let first = orchestrator.confirm_conversion(Some("abc123")).await;
        let second = orchestrator.confirm_conversion(Some("abc123")).await;
        assert!(matches!(first, ConfirmOutcome::Dispatched(_)));
        assert!(matches!(second, ConfirmOutcome::Dispatched(_)));
        h.settle().await;
        assert_eq!(h.tt.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_claims_are_evicted() {
        let h = Harness::new();
        let ledger = DedupLedger::in_memory(Duration::zero());
        let orchestrator = ConversionOrchestrator::new(h.pixels.clone(), Arc::new(ledger));

        for id in ["a1", "b2", "c3"] {
            orchestrator.confirm_conversion(Some(id)).await;
        }
        assert_eq!(orchestrator.claimed.lock().expect("claims").len(), 1);
        h.settle().await;
    }

    /// A library whose call never returns.
    struct StuckPixel;

    #[async_trait]
    impl pixel::PixelNetwork for StuckPixel {
        fn network(&self) -> Network {
            Network::Facebook
        }

        fn is_available(&self) -> bool {
            true
        }

        async fn dispatch(&self, _event: &ConversionEvent) -> Result<(), pixel::PixelError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_stuck_network_does_not_block_confirmation() {
        let tt = RecordingPixel::new(Network::TikTok);
        let pixels = Arc::new(PixelRegistry::new());
        pixels.install(Arc::new(StuckPixel));
        pixels.install(tt.clone());
        let ledger = DedupLedger::in_memory(Duration::hours(24));
        let orchestrator = ConversionOrchestrator::new(pixels.clone(), Arc::new(ledger));

        let outcome = tokio::time::timeout(
            StdDuration::from_secs(2),
            orchestrator.confirm_conversion(Some("abc123")),
        )
        .await
        .expect("confirmation returns");
        assert!(matches!(outcome, ConfirmOutcome::Dispatched(ref r) if r.fired.len() == 2));

        for _ in 0..200 {
            if !tt.calls().is_empty() {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        assert_eq!(tt.calls().len(), 1);
    }
}
