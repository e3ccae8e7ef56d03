//! Flat-file credential store
//!
//! Holds exactly one credential record as a JSON document with camelCase
//! fields. Writes update the existing file in place, preserving fields this
//! gateway does not manage, using atomic temp-file + rename with 0600
//! permissions.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::record::{CredentialRecord, format_expiry, parse_expiry};
use crate::store::{CredentialStore, StoreKind};

/// Key under which the file's single record is exposed.
pub const FILE_RECORD_KEY: &str = "credentials-file";

/// Kiro desktop credential file layout (camelCase).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilePayload {
    refresh_token: String,
    access_token: Option<String>,
    expires_at: Option<String>,
    profile_arn: Option<String>,
    region: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    /// Hash naming a paired device-registration file in the AWS SSO cache
    client_id_hash: Option<String>,
}

/// Device-registration file in `~/.aws/sso/cache/<hash>.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationFile {
    client_id: String,
    client_secret: String,
}

/// Single-record JSON file store.
pub struct FileStore {
    path: PathBuf,
    /// Overrides the platform SSO cache directory (tests)
    sso_cache_dir: Option<PathBuf>,
}

impl FileStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            sso_cache_dir: None,
        }
    }

    #[cfg(test)]
    fn with_sso_cache_dir(path: PathBuf, cache_dir: PathBuf) -> Self {
        Self {
            path,
            sso_cache_dir: Some(cache_dir),
        }
    }

    fn sso_cache_path(&self, hash: &str) -> Option<PathBuf> {
        let base = match &self.sso_cache_dir {
            Some(dir) => dir.clone(),
            None => dirs::home_dir()?.join(".aws").join("sso").join("cache"),
        };
        Some(base.join(format!("{hash}.json")))
    }

    async fn read_record(&self) -> Result<CredentialRecord> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Store(format!("reading {}: {e}", self.path.display())))?;
        let payload: FilePayload = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;

        let expires_at = payload.expires_at.as_deref().map(parse_expiry).transpose()?;

        let mut client_id = payload.client_id;
        let mut client_secret = payload.client_secret;

        // A clientIdHash points at a registration file written by the AWS
        // SSO cache; it supplies the pair when the file itself omits it.
        if client_id.is_none()
            && let Some(hash) = payload.client_id_hash.as_deref()
        {
            match self.load_registration(hash).await {
                Ok(Some(registration)) => {
                    client_id = Some(registration.client_id);
                    client_secret = Some(registration.client_secret);
                }
                Ok(None) => {
                    warn!(hash, "device registration file not found for clientIdHash");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(CredentialRecord {
            key: FILE_RECORD_KEY.to_string(),
            refresh_token: payload.refresh_token,
            access_token: payload.access_token,
            expires_at,
            profile_arn: payload.profile_arn,
            region: payload.region,
            sso_region: None,
            client_id,
            client_secret,
        })
    }

    async fn load_registration(&self, hash: &str) -> Result<Option<RegistrationFile>> {
        let Some(path) = self.sso_cache_path(hash) else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| Error::Store(format!("reading {}: {e}", path.display())))?;
        let registration: RegistrationFile = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing registration file: {e}")))?;
        info!(path = %path.display(), "paired device registration loaded");
        Ok(Some(registration))
    }
}

#[async_trait]
impl CredentialStore for FileStore {
    fn kind(&self) -> StoreKind {
        StoreKind::File
    }

    async fn load_all(&self) -> Result<Vec<CredentialRecord>> {
        let record = self.read_record().await?;
        info!(path = %self.path.display(), "credentials loaded from file");
        Ok(vec![record])
    }

    async fn load_by_key(&self, key: &str) -> Result<Option<CredentialRecord>> {
        if key != FILE_RECORD_KEY {
            return Ok(None);
        }
        Ok(Some(self.read_record().await?))
    }

    async fn save(&self, record: &CredentialRecord) -> Result<()> {
        if record.key != FILE_RECORD_KEY {
            return Err(Error::NotFound(format!(
                "key {} does not name the credential file",
                record.key
            )));
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|_| Error::NotFound(format!("credential file {} missing", self.path.display())))?;
        let mut existing: Value = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing credential file: {e}")))?;

        let object = existing
            .as_object_mut()
            .ok_or_else(|| Error::CredentialParse("credential file is not a JSON object".into()))?;
        object.insert(
            "refreshToken".into(),
            Value::String(record.refresh_token.clone()),
        );
        if let Some(access) = &record.access_token {
            object.insert("accessToken".into(), Value::String(access.clone()));
        }
        if let Some(expires_at) = record.expires_at {
            object.insert(
                "expiresAt".into(),
                Value::String(format_expiry(expires_at)?),
            );
        }
        if let Some(profile_arn) = &record.profile_arn {
            object.insert("profileArn".into(), Value::String(profile_arn.clone()));
        }

        write_atomic(&self.path, &existing).await?;
        debug!(path = %self.path.display(), "credentials persisted");
        Ok(())
    }
}

/// Write the document atomically: temp file in the same directory, 0600,
/// then rename over the target.
async fn write_atomic(path: &Path, data: &Value) -> Result<()> {
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Store("credential path has no parent directory".into()))?;
    let tmp_path = dir.join(format!(".credentials.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Store(format!("writing temp credential file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Store(format!("setting credential file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Store(format!("renaming temp credential file: {e}")))?;
    Ok(())
}
