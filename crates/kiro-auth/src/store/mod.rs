//! Credential store backends
//!
//! A store is a polymorphic reader/writer over `{load_all, load_by_key,
//! save}`. Four backends exist: a flat JSON file holding a single record,
//! an embedded SQLite key/value table, a remote document collection, and
//! process environment variables.
//!
//! The KV-shaped backends hold two families of keys. Token keys carry the
//! refresh/access material; device-registration keys carry the client
//! id/secret pair needed by the device-OAuth mechanism. A token key pairs
//! with the registration sharing its suffix, falling back to the unsuffixed
//! registration:
//!
//! ```text
//! kirocli:odic:token      <-> kirocli:odic:device-registration
//! kirocli:odic:token:2    <-> kirocli:odic:device-registration:2
//!                             (falls back to kirocli:odic:device-registration)
//! ```

mod doc;
mod env;
mod file;
mod kv;

pub use doc::DocStore;
pub use env::EnvStore;
pub use file::FileStore;
pub use kv::KvStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::record::{CredentialRecord, format_expiry, parse_expiry};

/// Token keys probed when persistence cannot find the account's own key.
pub const WELL_KNOWN_TOKEN_KEYS: &[&str] = &["kirocli:odic:token", "codewhisperer:odic:token"];

/// Which backend a store is; drives reload behavior in the auth manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    File,
    Kv,
    Document,
    Env,
}

impl StoreKind {
    /// Whether another process may rewrite records behind our back, making
    /// a targeted reload before refresh worthwhile.
    pub fn supports_external_reload(&self) -> bool {
        matches!(self, StoreKind::Kv | StoreKind::Document)
    }
}

/// Polymorphic credential reader/writer.
///
/// `load_all` returns records in lexicographic key order so round-robin
/// selection is deterministic across restarts. `save` only updates keys
/// that already exist; creating new keys is not part of the contract.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    fn kind(&self) -> StoreKind;

    async fn load_all(&self) -> Result<Vec<CredentialRecord>>;

    async fn load_by_key(&self, key: &str) -> Result<Option<CredentialRecord>>;

    async fn save(&self, record: &CredentialRecord) -> Result<()>;
}

/// Token-key payload as stored by the KV-shaped backends (snake_case).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPayload {
    pub refresh_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_arn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Device-registration payload (snake_case).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationPayload {
    pub client_id: String,
    pub client_secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Split a token key into its base and optional account suffix.
fn split_token_key(key: &str) -> Option<(&str, Option<&str>)> {
    if let Some(base) = key.strip_suffix(":token") {
        return Some((base, None));
    }
    if let Some(pos) = key.rfind(":token:") {
        let base = &key[..pos];
        let suffix = &key[pos + ":token:".len()..];
        if !suffix.is_empty() {
            return Some((base, Some(suffix)));
        }
    }
    None
}

/// Whether a store key names a token record.
pub fn is_token_key(key: &str) -> bool {
    split_token_key(key).is_some()
}

/// Registration keys to probe for a token key, most specific first.
pub fn registration_candidates(token_key: &str) -> Vec<String> {
    match split_token_key(token_key) {
        Some((base, Some(suffix))) => vec![
            format!("{base}:device-registration:{suffix}"),
            format!("{base}:device-registration"),
        ],
        Some((base, None)) => vec![format!("{base}:device-registration")],
        None => Vec::new(),
    }
}

/// Build a credential record from a token payload and its paired
/// registration. Malformed payloads are rejected here, at load time.
pub fn record_from_payloads(
    key: &str,
    token: TokenPayload,
    registration: Option<RegistrationPayload>,
) -> Result<CredentialRecord> {
    let expires_at = token.expires_at.as_deref().map(parse_expiry).transpose()?;

    // The payload's region is the SSO region used for token issuance only;
    // the API region stays at the process default.
    let sso_region = token
        .region
        .clone()
        .or_else(|| registration.as_ref().and_then(|r| r.region.clone()));

    Ok(CredentialRecord {
        key: key.to_string(),
        refresh_token: token.refresh_token,
        access_token: token.access_token,
        expires_at,
        profile_arn: token.profile_arn,
        region: None,
        sso_region,
        client_id: registration.as_ref().map(|r| r.client_id.clone()),
        client_secret: registration.map(|r| r.client_secret),
    })
}

/// Fold a refreshed record back into an existing stored payload,
/// preserving fields this gateway does not manage.
pub fn apply_record_to_payload(existing: &mut Value, record: &CredentialRecord) -> Result<()> {
    let object = existing
        .as_object_mut()
        .ok_or_else(|| Error::CredentialParse("stored payload is not a JSON object".into()))?;

    object.insert(
        "refresh_token".into(),
        Value::String(record.refresh_token.clone()),
    );
    match &record.access_token {
        Some(token) => {
            object.insert("access_token".into(), Value::String(token.clone()));
        }
        None => {
            object.remove("access_token");
        }
    }
    if let Some(expires_at) = record.expires_at {
        object.insert(
            "expires_at".into(),
            Value::String(format_expiry(expires_at)?),
        );
    }
    if let Some(profile_arn) = &record.profile_arn {
        object.insert("profile_arn".into(), Value::String(profile_arn.clone()));
    }
    Ok(())
}
