//! Registration to thank-you view, end to end.
//!
//! A buddy registration is submitted, the matching event is checked for
//! hashed identity data, the lead is saved, and the thank-you view is
//! mounted twice with the redirect's `lead_id`. Only the first mount may
//! reach the pixels.

use bf_core::hashing::compute_sha256_hex;
use bf_core::{EventKind, LeadForm, Network};
use chrono::Duration;
use ledger::{DedupLedger, MemoryMarkerStore, SledMarkerStore};
use pixel::mock::RecordingPixel;
use pixel::PixelRegistry;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use store::mock::MockLeadStore;
use tracking::{ConfirmOutcome, ConversionOrchestrator, SubmissionFlow, ThankYouRedirect};

fn temp_ledger(db: &sled::Db) -> DedupLedger {
    let durable = SledMarkerStore::from_db(db, Duration::hours(24)).expect("sled store");
    DedupLedger::new(
        Arc::new(durable),
        Arc::new(MemoryMarkerStore::new(Duration::hours(24))),
    )
}

async fn settle(pixels: &PixelRegistry) {
    tokio::time::timeout(StdDuration::from_secs(2), pixels.wait_idle())
        .await
        .expect("pixel deliveries settle");
}

#[tokio::test]
async fn registration_fires_each_conversion_once() {
    let fb = RecordingPixel::new(Network::Facebook);
    let tt = RecordingPixel::new(Network::TikTok);
    let snap = RecordingPixel::new(Network::Snapchat);
    let pixels = Arc::new(PixelRegistry::new());
    pixels.install(fb.clone());
    pixels.install(tt.clone());
    pixels.install(snap.clone());

    let db = sled::Config::new()
        .temporary(true)
        .open()
        .expect("open temporary sled");
    let orchestrator = Arc::new(ConversionOrchestrator::new(
        pixels.clone(),
        Arc::new(temp_ledger(&db)),
    ));

    let store = MockLeadStore::new();
    store.set_next_id("abc123").await;
    let flow = SubmissionFlow::new(orchestrator.clone(), store.clone());

    let form = LeadForm {
        user_name: "Ahmed Ali".into(),
        user_phone: "01012345678".into(),
        friend_name: "Omar Said".into(),
        friend_phone: "01112345678".into(),
    };
    let redirect = flow.submit(&form).await.expect("submit");
    settle(&pixels).await;

    // Pre-submission matching event
    let matched = fb.calls();
    assert_eq!(matched.len(), 1);
    let matching = matched[0].matching.clone().expect("advanced matching");
    assert_eq!(matching.hashed_first_name, compute_sha256_hex("ahmed"));
    assert_eq!(matching.hashed_last_name, Some(compute_sha256_hex("ali")));
    assert_eq!(matching.hashed_phone, compute_sha256_hex("01012345678"));
    assert!(tt.calls().is_empty());

    // Thank-you view, first mount
    let lead_id = ThankYouRedirect::parse_lead_id(&redirect.to_path());
    assert_eq!(lead_id.as_deref(), Some("abc123"));
    let outcome = orchestrator.confirm_conversion(lead_id.as_deref()).await;
    assert!(matches!(outcome, ConfirmOutcome::Dispatched(ref r) if r.fired.len() == 3));
    settle(&pixels).await;

    let fb_calls = fb.calls();
    assert_eq!(fb_calls.len(), 2);
    assert_eq!(fb_calls[1].kind, EventKind::Lead);
    assert_eq!(fb_calls[1].event_id.as_deref(), Some("abc123"));
    assert_eq!(tt.calls()[0].kind, EventKind::SubmitForm);
    assert_eq!(snap.calls()[0].kind, EventKind::SignUp);

    // Second mount in the same process
    orchestrator.confirm_conversion(lead_id.as_deref()).await;

    // A new visit re-reading the durable ledger
    let revisit = ConversionOrchestrator::new(pixels.clone(), Arc::new(temp_ledger(&db)));
    assert_eq!(
        revisit.confirm_conversion(lead_id.as_deref()).await,
        ConfirmOutcome::AlreadyFired
    );
    settle(&pixels).await;

    assert_eq!(fb.calls().len(), 2);
    assert_eq!(tt.calls().len(), 1);
    assert_eq!(snap.calls().len(), 1);
}

#[tokio::test]
async fn direct_navigation_uses_session_fallback() {
    let snap = RecordingPixel::new(Network::Snapchat);
    let pixels = Arc::new(PixelRegistry::new());
    pixels.install(snap.clone());

    let db = sled::Config::new()
        .temporary(true)
        .open()
        .expect("open temporary sled");
    let orchestrator = ConversionOrchestrator::new(pixels.clone(), Arc::new(temp_ledger(&db)));

    for _ in 0..3 {
        orchestrator
            .confirm_conversion(ThankYouRedirect::parse_lead_id("").as_deref())
            .await;
    }
    settle(&pixels).await;
    assert_eq!(snap.calls().len(), 1);

    // New session: the generic key is not durable
    let next_session = ConversionOrchestrator::new(pixels.clone(), Arc::new(temp_ledger(&db)));
    next_session.confirm_conversion(None).await;
    settle(&pixels).await;
    assert_eq!(snap.calls().len(), 2);
}
