use anyhow::{Context, Result};
use bf_core::Network;
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "buddy-funnel";
const KEYCHAIN_SERVICE: &str = "buddy.funnel.credentials";

pub const STORE_KEY_SECRET: &str = "supabase_anon_key";
pub const ADMIN_PIN_SECRET: &str = "admin_pin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub pixels: PixelsConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default = "default_audit_log")]
    pub audit_log: Option<String>,
    #[serde(default)]
    pub business: BusinessConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            pixels: PixelsConfig::default(),
            store: StoreConfig::default(),
            ledger: LedgerConfig::default(),
            audit_log: default_audit_log(),
            business: BusinessConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PixelsConfig {
    pub facebook: Option<PixelConfig>,
    pub tiktok: Option<PixelConfig>,
    pub snapchat: Option<PixelConfig>,
}

impl PixelsConfig {
    pub fn get(&self, network: Network) -> Option<&PixelConfig> {
        match network {
            Network::Facebook => self.facebook.as_ref(),
            Network::TikTok => self.tiktok.as_ref(),
            Network::Snapchat => self.snapchat.as_ref(),
        }
    }

    pub fn set(&mut self, network: Network, pixel: Option<PixelConfig>) {
        match network {
            Network::Facebook => self.facebook = pixel,
            Network::TikTok => self.tiktok = pixel,
            Network::Snapchat => self.snapchat = pixel,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PixelConfig {
    pub pixel_id: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_kind")]
    pub kind: String, // "mock" | "supabase"
    pub base_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_ledger_path")]
    pub path: String,
    #[serde(default = "default_retention_hours")]
    pub retention_hours: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            retention_hours: default_retention_hours(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessConfig {
    #[serde(default = "default_whatsapp_number")]
    pub whatsapp_number: String,
}

impl Default for BusinessConfig {
    fn default() -> Self {
        Self {
            whatsapp_number: default_whatsapp_number(),
        }
    }
}

fn default_store_kind() -> String {
    "mock".to_string()
}

fn default_ledger_path() -> String {
    ".funnel_ledger".to_string()
}

fn default_retention_hours() -> i64 {
    24
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_audit_log() -> Option<String> {
    Some("audit.jsonl".to_string())
}

fn default_whatsapp_number() -> String {
    "201234567890".to_string()
}

pub fn load() -> Result<AppConfig> {
    let cfg: AppConfig = confy::load(APP_NAME, None).context("Failed to load app config")?;
    Ok(cfg)
}

pub fn store(cfg: &AppConfig) -> Result<()> {
    confy::store(APP_NAME, None, cfg).context("Failed to store app config")?;
    Ok(())
}

/// Store a secret in the OS keychain
pub fn store_secret(key: &str, value: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Retrieve a secret from the OS keychain
pub fn get_secret(key: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    let password = entry.get_password()?;
    Ok(password)
}

/// Delete a secret from the OS keychain
pub fn delete_secret(key: &str) -> Result<()> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    entry.delete_password()?;
    Ok(())
}

/// Env var first, then the keychain.
pub fn secret_from_env_or_keychain(env_var: &str, key: &str) -> Result<String> {
    std::env::var(env_var)
        .or_else(|_| get_secret(key))
        .with_context(|| format!("{key} not found in env ({env_var}) or keychain"))
}

pub fn pixel_token_secret(network: Network) -> (&'static str, String) {
    let env_var = match network {
        Network::Facebook => "FB_ACCESS_TOKEN",
        Network::TikTok => "TIKTOK_ACCESS_TOKEN",
        Network::Snapchat => "SNAPCHAT_ACCESS_TOKEN",
    };
    (env_var, format!("{}_access_token", network.as_str()))
}

/// The dashboard's static PIN gate.
pub fn verify_admin_pin(candidate: &str) -> Result<bool> {
    let expected = secret_from_env_or_keychain("ADMIN_PIN", ADMIN_PIN_SECRET)?;
    Ok(pin_matches(&expected, candidate))
}

fn pin_matches(expected: &str, candidate: &str) -> bool {
    let expected = expected.trim();
    !expected.is_empty() && expected == candidate.trim()
}
