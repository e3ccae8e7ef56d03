//! Environment-variable credential store
//!
//! Reads credentials straight from process environment variables. Useful
//! for container deployments where mounting a credential file is awkward.
//! `KIRO_REFRESH_TOKEN` may hold several comma-separated refresh tokens;
//! the optional access token, profile, and client id/secret pair apply to
//! the first one only. Rotated tokens live in memory for the process
//! lifetime: the environment cannot be written back.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::CredentialRecord;
use crate::store::{CredentialStore, StoreKind};

/// Key of the first environment-sourced record; extra tokens get
/// `env:2`, `env:3`, and so on.
pub const ENV_RECORD_KEY: &str = "env";

/// Values read from the environment, separated out for testability.
#[derive(Debug, Default)]
struct EnvValues {
    refresh_tokens: Option<String>,
    access_token: Option<String>,
    profile_arn: Option<String>,
    region: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

impl EnvValues {
    fn from_process_env() -> Self {
        fn var(name: &str) -> Option<String> {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Self {
            refresh_tokens: var("KIRO_REFRESH_TOKEN"),
            access_token: var("KIRO_ACCESS_TOKEN"),
            profile_arn: var("KIRO_PROFILE_ARN"),
            region: var("KIRO_SSO_REGION"),
            client_id: var("KIRO_CLIENT_ID"),
            client_secret: var("KIRO_CLIENT_SECRET"),
        }
    }

    fn records(&self) -> Result<Vec<CredentialRecord>> {
        let raw = self.refresh_tokens.as_deref().ok_or_else(|| {
            Error::Store("KIRO_REFRESH_TOKEN is not set".to_string())
        })?;

        let mut records = Vec::new();
        for (index, token) in raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .enumerate()
        {
            let key = if index == 0 {
                ENV_RECORD_KEY.to_string()
            } else {
                format!("{ENV_RECORD_KEY}:{}", index + 1)
            };
            let first = index == 0;
            records.push(CredentialRecord {
                key,
                refresh_token: token.to_string(),
                // The cached access material belongs to the first token
                access_token: self.access_token.clone().filter(|_| first),
                expires_at: None,
                profile_arn: self.profile_arn.clone().filter(|_| first),
                region: None,
                sso_region: self.region.clone(),
                client_id: self.client_id.clone().filter(|_| first),
                client_secret: self.client_secret.clone().filter(|_| first),
            });
        }

        if records.is_empty() {
            return Err(Error::Store(
                "KIRO_REFRESH_TOKEN contains no tokens".to_string(),
            ));
        }
        Ok(records)
    }
}

/// Credential store over process environment variables.
pub struct EnvStore;

impl EnvStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EnvStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialStore for EnvStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Env
    }

    async fn load_all(&self) -> Result<Vec<CredentialRecord>> {
        let records = EnvValues::from_process_env().records()?;
        info!(accounts = records.len(), "credentials loaded from environment");
        Ok(records)
    }

    async fn load_by_key(&self, key: &str) -> Result<Option<CredentialRecord>> {
        let records = EnvValues::from_process_env().records()?;
        Ok(records.into_iter().find(|r| r.key == key))
    }

    async fn save(&self, record: &CredentialRecord) -> Result<()> {
        // The environment cannot be rewritten; rotated material stays in
        // the pool for the process lifetime
        debug!(key = %record.key, "env credentials are in-memory only, skipping persistence");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(tokens: &str) -> EnvValues {
        EnvValues {
            refresh_tokens: Some(tokens.to_string()),
            access_token: Some("at_env".into()),
            profile_arn: Some("arn:aws:p".into()),
            region: Some("eu-west-1".into()),
            client_id: None,
            client_secret: None,
        }
    }

    #[test]
    fn single_token_builds_one_record() {
        let records = values("rt_only").records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, ENV_RECORD_KEY);
        assert_eq!(records[0].refresh_token, "rt_only");
        assert_eq!(records[0].access_token.as_deref(), Some("at_env"));
        assert_eq!(records[0].sso_region.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn comma_list_builds_ordered_pool() {
        let records = values("rt_a, rt_b,rt_c").records().unwrap();
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["env", "env:2", "env:3"]);
        // Cached access material applies to the first token only
        assert!(records[0].access_token.is_some());
        assert!(records[1].access_token.is_none());
        assert!(records[2].profile_arn.is_none());
    }

    #[test]
    fn missing_token_is_a_store_error() {
        let empty = EnvValues::default();
        assert!(matches!(empty.records(), Err(Error::Store(_))));
    }

    #[test]
    fn blank_list_is_a_store_error() {
        assert!(matches!(values(" , ,").records(), Err(Error::Store(_))));
    }

    #[test]
    fn device_oauth_pair_is_detected() {
        let mut env = values("rt");
        env.client_id = Some("cid".into());
        env.client_secret = Some("cs".into());
        let records = env.records().unwrap();
        assert_eq!(
            records[0].method(),
            crate::record::AuthMethod::DeviceOauth
        );
    }
}
