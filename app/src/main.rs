mod commands;

use bf_core::Network;
use chrono::Duration;
use clap::{Parser, Subcommand, ValueEnum};
use ledger::DedupLedger;
use pixel::{http::HttpPixel, mock::RecordingPixel, PixelRegistry};
use std::sync::Arc;
use store::{mock::MockLeadStore, supabase::SupabaseLeadStore, LeadStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracking::ConversionOrchestrator;

#[derive(Parser)]
#[command(name = "buddy-funnel", about = "Buddy registration funnel and conversion tracking")]
struct Cli {
    /// Record pixel events locally instead of relaying them
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum NetworkArg {
    Facebook,
    Tiktok,
    Snapchat,
}

impl From<NetworkArg> for Network {
    fn from(arg: NetworkArg) -> Self {
        match arg {
            NetworkArg::Facebook => Network::Facebook,
            NetworkArg::Tiktok => Network::TikTok,
            NetworkArg::Snapchat => Network::Snapchat,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Landing page view
    PageView,
    /// Visitor started filling in the form
    Checkout,
    /// Submit a buddy registration, then land on the thank-you view
    Submit {
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        friend_name: String,
        #[arg(long)]
        friend_phone: String,
    },
    /// Arrive at the thank-you view
    ThankYou {
        #[arg(long, conflicts_with = "query")]
        lead_id: Option<String>,
        /// Raw query string of the thank-you URL
        #[arg(long)]
        query: Option<String>,
    },
    /// Admin lead management, behind the PIN gate
    Leads {
        #[arg(long)]
        pin: String,
        #[command(subcommand)]
        action: commands::LeadsAction,
    },
    /// Dedup ledger maintenance
    Ledger {
        #[command(subcommand)]
        action: commands::LedgerAction,
    },
    /// Show or change settings
    Settings {
        #[command(subcommand)]
        action: commands::SettingsAction,
    },
}

fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(env_filter))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn create_lead_store(cfg: &config::AppConfig) -> anyhow::Result<Arc<dyn LeadStore>> {
    match cfg.store.kind.as_str() {
        "supabase" => {
            let base_url = cfg
                .store
                .base_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("Supabase base_url not configured"))?;
            let api_key = config::secret_from_env_or_keychain(
                "SUPABASE_ANON_KEY",
                config::STORE_KEY_SECRET,
            )?;
            tracing::info!("Using Supabase lead store");
            Ok(SupabaseLeadStore::new(base_url, api_key))
        }
        _ => {
            tracing::warn!("Lead store not configured, leads are kept in memory only");
            Ok(MockLeadStore::new())
        }
    }
}

fn create_pixel_registry(cfg: &config::AppConfig, dry_run: bool) -> Arc<PixelRegistry> {
    let registry = Arc::new(PixelRegistry::new());
    for network in Network::ALL {
        if dry_run {
            registry.install(RecordingPixel::new(network));
            continue;
        }
        let Some(pixel) = cfg.pixels.get(network) else {
            tracing::debug!(%network, "no pixel configured");
            continue;
        };
        let (env_var, secret) = config::pixel_token_secret(network);
        let token = config::secret_from_env_or_keychain(env_var, &secret).ok();
        registry.install(HttpPixel::new(
            network,
            pixel.pixel_id.clone(),
            pixel.endpoint.clone(),
            token,
        ));
    }
    registry
}

pub(crate) fn open_ledger(cfg: &config::AppConfig) -> anyhow::Result<Arc<DedupLedger>> {
    let retention = Duration::hours(cfg.ledger.retention_hours);
    let ledger = DedupLedger::open(&cfg.ledger.path, retention)?;
    Ok(Arc::new(ledger))
}

/// Upper bound on waiting for detached pixel deliveries before exit.
const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = config::load().unwrap_or_else(|e| {
        tracing::warn!(error=%e, "falling back to default config");
        config::AppConfig::default()
    });

    let pixels = create_pixel_registry(&cfg, cli.dry_run);
    let build_orchestrator = || -> anyhow::Result<Arc<ConversionOrchestrator>> {
        let mut orchestrator = ConversionOrchestrator::new(pixels.clone(), open_ledger(&cfg)?);
        if let Some(path) = &cfg.audit_log {
            orchestrator = orchestrator.with_audit_log(path);
        }
        Ok(Arc::new(orchestrator))
    };

    match cli.command {
        Command::PageView => {
            let orchestrator = build_orchestrator()?;
            commands::page_view(&orchestrator)?
        }
        Command::Checkout => {
            let orchestrator = build_orchestrator()?;
            commands::checkout(&orchestrator)?
        }
        Command::Submit {
            name,
            phone,
            friend_name,
            friend_phone,
        } => {
            let form = bf_core::LeadForm {
                user_name: name,
                user_phone: phone,
                friend_name,
                friend_phone,
            };
            let orchestrator = build_orchestrator()?;
            let store = create_lead_store(&cfg)?;
            commands::submit(orchestrator, store, &form, &cfg).await?
        }
        Command::ThankYou { lead_id, query } => {
            let lead_id = lead_id.or_else(|| {
                query
                    .as_deref()
                    .and_then(tracking::ThankYouRedirect::parse_lead_id)
            });
            let orchestrator = build_orchestrator()?;
            commands::thank_you(&orchestrator, lead_id.as_deref(), &cfg).await?
        }
        Command::Leads { pin, action } => {
            if !config::verify_admin_pin(&pin)? {
                anyhow::bail!("wrong PIN");
            }
            let store = create_lead_store(&cfg)?;
            commands::leads(store.as_ref(), action).await?
        }
        Command::Ledger { action } => commands::ledger(&cfg, action).await?,
        Command::Settings { action } => commands::settings(action)?,
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, pixels.wait_idle())
        .await
        .is_err()
    {
        tracing::warn!(
            pending = pixels.in_flight(),
            "pixel deliveries still running at exit"
        );
    }
    Ok(())
}
