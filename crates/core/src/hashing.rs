//! Advanced-matching identity hashing.
//!
//! Identifiers are normalized the way the ad networks expect before they are
//! SHA-256 hashed, so raw phone numbers and names never leave the process.

use crate::models::{LeadForm, MatchingPayload};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("digest task failed: {0}")]
    Digest(#[from] tokio::task::JoinError),
}

pub fn compute_sha256_hex(message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.as_bytes());
    let bytes = hasher.finalize();
    hex::encode(bytes)
}

/// Hex SHA-256 of `message`, computed off the async executor.
/// Empty input yields an empty string without hashing.
pub async fn sha256_hex(message: &str) -> Result<String, HashError> {
    if message.is_empty() {
        return Ok(String::new());
    }
    let owned = message.to_owned();
    let digest = tokio::task::spawn_blocking(move || compute_sha256_hex(&owned)).await?;
    Ok(digest)
}

/// Strips every non-digit. Local Egyptian format (`01XXXXXXXXX`) is kept as is;
/// no country code is prepended.
pub fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NameParts {
    pub first_name: String,
    pub last_name: String,
}

/// First token and last token of the lowercased name; middle names are dropped.
pub fn split_name(full_name: &str) -> NameParts {
    let normalized = full_name.trim().to_lowercase();
    let mut parts = normalized.split_whitespace();

    let Some(first) = parts.next() else {
        return NameParts::default();
    };
    let last = parts.last().unwrap_or_default();

    NameParts {
        first_name: first.to_string(),
        last_name: last.to_string(),
    }
}

/// Builds `{ph, fn, ln?}` from a submitter's name and phone. The three
/// digests run concurrently.
pub async fn prepare_matching_payload(
    name: &str,
    phone: &str,
) -> Result<MatchingPayload, HashError> {
    let phone = normalize_phone(phone);
    let NameParts {
        first_name,
        last_name,
    } = split_name(name);

    let (ph, first, last) = tokio::join!(
        sha256_hex(&phone),
        sha256_hex(&first_name),
        sha256_hex(&last_name),
    );
    let last = last?;

    Ok(MatchingPayload {
        hashed_phone: ph?,
        hashed_first_name: first?,
        hashed_last_name: (!last.is_empty()).then_some(last),
    })
}

pub async fn matching_for_form(form: &LeadForm) -> Result<MatchingPayload, HashError> {
    prepare_matching_payload(&form.user_name, &form.user_phone).await
}
