use anyhow::{bail, Context, Result};
use bf_core::{Lead, LeadForm, LeadStatus, ManualLead, NewSegment, SegmentPatch};
use bf_core::Network;
use clap::{Subcommand, ValueEnum};
use config::{AppConfig, PixelConfig};
use pixel::DispatchReport;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use store::LeadStore;
use tracking::{ConfirmOutcome, ConversionOrchestrator, SubmissionFlow};

use crate::{open_ledger, NetworkArg};

const WHATSAPP_MESSAGE: &str = "مرحباً! أريد تأكيد حجزي في دورة الإسعافات الأولية.";

#[derive(Subcommand)]
pub enum LeadsAction {
    List,
    Search { phone: String },
    /// Add a lead by hand; email and source fill the buddy columns
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        source: Option<String>,
    },
    Status {
        #[arg(long)]
        status: LeadStatus,
        ids: Vec<String>,
    },
    /// File leads under a CRM segment
    Assign {
        #[arg(long)]
        segment: String,
        ids: Vec<String>,
    },
    Delete { ids: Vec<String> },
    /// Delete every lead
    DeleteAll {
        #[arg(long)]
        yes: bool,
    },
    /// Write all leads as CSV (stdout when no path is given)
    Export {
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Segments {
        #[command(subcommand)]
        action: SegmentsAction,
    },
}

#[derive(Subcommand)]
pub enum SegmentsAction {
    List,
    Create {
        name: String,
        #[arg(long)]
        color: String,
        #[arg(long)]
        order: i32,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        color: Option<String>,
        #[arg(long)]
        order: Option<i32>,
    },
    /// Remove a segment, optionally moving its leads elsewhere first
    Delete {
        id: String,
        #[arg(long)]
        move_to: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum SecretArg {
    AdminPin,
    StoreKey,
    FacebookToken,
    TiktokToken,
    SnapchatToken,
}

impl SecretArg {
    fn keychain_key(self) -> String {
        match self {
            SecretArg::AdminPin => config::ADMIN_PIN_SECRET.to_string(),
            SecretArg::StoreKey => config::STORE_KEY_SECRET.to_string(),
            SecretArg::FacebookToken => config::pixel_token_secret(Network::Facebook).1,
            SecretArg::TiktokToken => config::pixel_token_secret(Network::TikTok).1,
            SecretArg::SnapchatToken => config::pixel_token_secret(Network::Snapchat).1,
        }
    }
}

#[derive(Subcommand)]
pub enum LedgerAction {
    /// Drop expired markers once
    Purge,
    /// Keep purging on the configured interval
    Watch,
}

#[derive(Subcommand)]
pub enum SettingsAction {
    Show,
    SetPixel {
        network: NetworkArg,
        #[arg(long)]
        pixel_id: String,
        #[arg(long)]
        endpoint: String,
    },
    ClearPixel {
        network: NetworkArg,
    },
    SetStore {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Save a secret in the OS keychain
    SetSecret {
        secret: SecretArg,
        #[arg(long)]
        value: String,
    },
    ClearSecret {
        secret: SecretArg,
    },
}

#[derive(Debug, Serialize)]
struct DispatchSummary {
    fired: Vec<String>,
    unavailable: Vec<String>,
}

impl From<&DispatchReport> for DispatchSummary {
    fn from(report: &DispatchReport) -> Self {
        Self {
            fired: report.fired.iter().map(|n| n.to_string()).collect(),
            unavailable: report.unavailable.iter().map(|n| n.to_string()).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ThankYouView {
    outcome: String,
    dispatch: Option<DispatchSummary>,
    whatsapp_link: String,
}

#[derive(Debug, Serialize)]
struct LeadRow {
    id: String,
    user_name: String,
    user_phone: String,
    friend_name: String,
    friend_phone: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    segment_id: Option<String>,
    created_at: String,
}

impl From<Lead> for LeadRow {
    fn from(l: Lead) -> Self {
        Self {
            id: l.id,
            user_name: l.user_name,
            user_phone: l.user_phone,
            friend_name: l.friend_name,
            friend_phone: l.friend_phone,
            status: l.status.to_string(),
            segment_id: l.segment_id,
            created_at: l.created_at.to_rfc3339(),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn whatsapp_link(number: &str) -> Result<String> {
    let url = url::Url::parse_with_params(
        &format!("https://wa.me/{}", number),
        &[("text", WHATSAPP_MESSAGE)],
    )
    .context("Invalid WhatsApp number")?;
    Ok(url.to_string())
}

pub fn page_view(orchestrator: &ConversionOrchestrator) -> Result<()> {
    let report = orchestrator.track_page_view();
    print_json(&DispatchSummary::from(&report))
}

pub fn checkout(orchestrator: &ConversionOrchestrator) -> Result<()> {
    let report = orchestrator.track_initiate_checkout();
    print_json(&DispatchSummary::from(&report))
}

pub async fn submit(
    orchestrator: Arc<ConversionOrchestrator>,
    store: Arc<dyn LeadStore>,
    form: &LeadForm,
    cfg: &AppConfig,
) -> Result<()> {
    let flow = SubmissionFlow::new(orchestrator.clone(), store);
    let redirect = flow.submit(form).await?;
    tracing::info!(path=%redirect.to_path(), "redirecting to thank-you view");
    thank_you(&orchestrator, Some(&redirect.lead_id), cfg).await
}

pub async fn thank_you(
    orchestrator: &ConversionOrchestrator,
    lead_id: Option<&str>,
    cfg: &AppConfig,
) -> Result<()> {
    let outcome = orchestrator.confirm_conversion(lead_id).await;
    let (label, dispatch) = match &outcome {
        ConfirmOutcome::Dispatched(report) => ("dispatched", Some(DispatchSummary::from(report))),
        ConfirmOutcome::AlreadyClaimed => ("already_claimed", None),
        ConfirmOutcome::AlreadyFired => ("already_fired", None),
    };
    // The confirmation page renders whatever happened to tracking
    let link = whatsapp_link(&cfg.business.whatsapp_number).unwrap_or_default();
    print_json(&ThankYouView {
        outcome: label.to_string(),
        dispatch,
        whatsapp_link: link,
    })
}

pub async fn leads(store: &dyn LeadStore, action: LeadsAction) -> Result<()> {
    let rows: Vec<Lead> = match action {
        LeadsAction::List => store.list_leads().await?,
        LeadsAction::Search { phone } => store.search_leads(&phone).await?,
        LeadsAction::Add {
            name,
            phone,
            email,
            source,
        } => {
            let lead = ManualLead {
                user_name: name,
                user_phone: phone,
                email,
                source,
            };
            vec![store.create_lead_manually(lead).await?]
        }
        LeadsAction::Status { status, ids } => match ids.as_slice() {
            [id] => vec![store.update_status(id, status).await?],
            _ => store.update_status_batch(&ids, status).await?,
        },
        LeadsAction::Assign { segment, ids } => match ids.as_slice() {
            [id] => vec![store.update_lead_segment(id, &segment).await?],
            _ => store.update_segment_batch(&ids, &segment).await?,
        },
        LeadsAction::Delete { ids } => {
            store.delete_leads(&ids).await?;
            tracing::info!(count = ids.len(), "leads deleted");
            Vec::new()
        }
        LeadsAction::DeleteAll { yes } => {
            if !yes {
                bail!("refusing to delete every lead without --yes");
            }
            store.delete_all_leads().await?;
            Vec::new()
        }
        LeadsAction::Export { output } => {
            let csv = store::export::leads_to_csv(&store.list_leads().await?);
            match output {
                Some(path) => {
                    std::fs::write(&path, csv)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    tracing::info!(path=%path.display(), "leads exported");
                }
                None => print!("{csv}"),
            }
            return Ok(());
        }
        LeadsAction::Segments { action } => return segments(store, action).await,
    };
    let rows: Vec<LeadRow> = rows.into_iter().map(LeadRow::from).collect();
    print_json(&rows)
}

async fn segments(store: &dyn LeadStore, action: SegmentsAction) -> Result<()> {
    match action {
        SegmentsAction::List => print_json(&store.list_segments().await?),
        SegmentsAction::Create { name, color, order } => {
            let segment = NewSegment {
                name,
                color,
                order_index: order,
            };
            print_json(&store.create_segment(&segment).await?)
        }
        SegmentsAction::Update {
            id,
            name,
            color,
            order,
        } => {
            let patch = SegmentPatch {
                name,
                color,
                order_index: order,
            };
            print_json(&store.update_segment(&id, &patch).await?)
        }
        SegmentsAction::Delete { id, move_to } => {
            store.delete_segment(&id, move_to.as_deref()).await?;
            tracing::info!(segment_id=%id, "segment deleted");
            Ok(())
        }
    }
}

pub async fn ledger(cfg: &AppConfig, action: LedgerAction) -> Result<()> {
    let ledger = open_ledger(cfg)?;
    match action {
        LedgerAction::Purge => {
            let removed = ledger.purge_expired().await?;
            tracing::info!(removed, "ledger purged");
            Ok(())
        }
        LedgerAction::Watch => {
            let interval = std::time::Duration::from_secs(cfg.ledger.sweep_interval_secs.max(1));
            ledger.spawn_sweeper(interval).await?;
            Ok(())
        }
    }
}

pub fn settings(action: SettingsAction) -> Result<()> {
    let mut cfg = config::load().unwrap_or_default();
    match action {
        SettingsAction::Show => return print_json(&cfg),
        SettingsAction::SetPixel {
            network,
            pixel_id,
            endpoint,
        } => cfg
            .pixels
            .set(network.into(), Some(PixelConfig { pixel_id, endpoint })),
        SettingsAction::ClearPixel { network } => cfg.pixels.set(network.into(), None),
        SettingsAction::SetStore { kind, base_url } => {
            cfg.store.kind = kind;
            cfg.store.base_url = base_url;
        }
        SettingsAction::SetSecret { secret, value } => {
            config::store_secret(&secret.keychain_key(), value.trim())?;
            tracing::info!("Secret saved to keychain");
            return Ok(());
        }
        SettingsAction::ClearSecret { secret } => {
            config::delete_secret(&secret.keychain_key())?;
            tracing::info!("Secret removed from keychain");
            return Ok(());
        }
    }
    config::store(&cfg)?;
    tracing::info!("Settings updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_keys_match_lookup_names() {
        assert_eq!(SecretArg::AdminPin.keychain_key(), config::ADMIN_PIN_SECRET);
        assert_eq!(SecretArg::StoreKey.keychain_key(), config::STORE_KEY_SECRET);
        assert_eq!(
            SecretArg::TiktokToken.keychain_key(),
            config::pixel_token_secret(Network::TikTok).1
        );
    }

    #[tokio::test]
    async fn test_export_writes_csv_file() {
        let store = store::mock::MockLeadStore::new();
        store
            .create_lead(&LeadForm {
                user_name: "Ahmed Ali".into(),
                user_phone: "01012345678".into(),
                friend_name: "Omar Said".into(),
                friend_phone: "01112345678".into(),
            })
            .await
            .expect("create");
        let path = std::env::temp_dir().join(format!("bf-export-{}.csv", std::process::id()));
        leads(
            store.as_ref(),
            LeadsAction::Export {
                output: Some(path.clone()),
            },
        )
        .await
        .expect("export");
        let csv = std::fs::read_to_string(&path).expect("read");
        assert_eq!(csv.lines().count(), 2);
        assert!(csv.contains("\"Ahmed Ali\""));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_delete_all_requires_confirmation() {
        let store = store::mock::MockLeadStore::new();
        let err = leads(store.as_ref(), LeadsAction::DeleteAll { yes: false }).await;
        assert!(err.is_err());
    }

    #[test]
    fn test_whatsapp_link_encodes_message() {
        let link = whatsapp_link("201234567890").expect("link");
        assert!(link.starts_with("https://wa.me/201234567890?text="));
        assert!(!link.contains(' '));
    }
}
