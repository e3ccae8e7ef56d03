//! Authentication manager
//!
//! Owns the account pool behind a single `tokio::sync::Mutex` and serializes
//! every refresh process-wide. The lock is held across the refresh network
//! round-trip: refresh happens at most once per token lifetime per account,
//! and concurrent refreshes would race on token rotation and credential
//! persistence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kiro_auth::record::AuthMethod;
use kiro_auth::store::WELL_KNOWN_TOKEN_KEYS;
use kiro_auth::{
    CredentialRecord, CredentialStore, DeviceOauthWire, TokenResponse, machine_fingerprint,
    refresh_record,
};
use tokio::sync::{Mutex, MutexGuard, oneshot};
use tracing::{debug, info, warn};

use crate::binding::RequestBinding;
use crate::error::{Error, Result};
use crate::pool::{Account, AccountPool};

/// Tunables for the token lifecycle.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Default API region when a record has no hint
    pub region: String,
    /// Refresh when the token expires within this window
    pub refresh_threshold: Duration,
    /// How long a failing account is skipped
    pub quarantine: Duration,
    /// Device-OAuth refresh wire format
    pub wire: DeviceOauthWire,
    /// Replaces the region-derived token issuance endpoint (proxies,
    /// self-hosted mocks)
    pub issuance_endpoint: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            refresh_threshold: Duration::from_secs(600),
            quarantine: Duration::from_secs(60),
            wire: DeviceOauthWire::Json,
            issuance_endpoint: None,
        }
    }
}

/// A usable access token plus the account attributes a request needs.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access_token: String,
    pub profile_arn: Option<String>,
    pub method: AuthMethod,
    pub account_key: String,
}

impl AccessGrant {
    fn from_record(record: &CredentialRecord, access_token: String) -> Self {
        Self {
            access_token,
            profile_arn: record.profile_arn.clone(),
            method: record.method(),
            account_key: record.key.clone(),
        }
    }
}

/// Token lifecycle manager over a credential store and account pool.
pub struct AuthManager {
    store: Arc<dyn CredentialStore>,
    http: reqwest::Client,
    config: ManagerConfig,
    /// Shared with detached refresh tasks so a refresh whose request was
    /// cancelled can still land its result in the pool
    pool: Arc<Mutex<AccountPool>>,
}

impl AuthManager {
    /// Load all records from the store into a fresh pool.
    pub async fn load(
        store: Arc<dyn CredentialStore>,
        http: reqwest::Client,
        config: ManagerConfig,
    ) -> Result<Self> {
        let records = store.load_all().await?;
        for record in &records {
            info!(key = %record.key, method = record.method().label(), "credential loaded");
        }
        let mut pool = AccountPool::new();
        pool.replace_all(records);
        Ok(Self {
            store,
            http,
            config,
            pool: Arc::new(Mutex::new(pool)),
        })
    }

    /// Reload the pool from the store. On store error the pool is left
    /// untouched. Returns the new account count.
    pub async fn reload(&self) -> Result<usize> {
        let records = self.store.load_all().await?;
        let mut pool = self.pool.lock().await;
        pool.replace_all(records);
        Ok(pool.len())
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    pub fn fingerprint(&self) -> &'static str {
        machine_fingerprint()
    }

    /// Pool summary for the health endpoint.
    pub async fn pool_health(&self) -> serde_json::Value {
        self.pool.lock().await.snapshot()
    }

    /// Return a valid access token for this request's account, refreshing
    /// if necessary.
    ///
    /// Selection order per attempt: the request's sticky account unless
    /// rotating, then a cached non-expiring token, then a targeted store
    /// reload (another process may have refreshed first), then a refresh.
    /// A 400 from the issuance endpoint triggers one reload-and-retry; a
    /// second 400 falls back to the cached token until its true expiry.
    /// Other failures quarantine the account and rotate while the pool has
    /// alternatives.
    pub async fn get_access_token(&self, binding: &RequestBinding) -> Result<AccessGrant> {
        let mut pool = self.pool.lock().await;
        let attempts = pool.len().max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 0..attempts {
            let force_new = attempt > 0;
            let sticky = binding.key();
            let Some(idx) = pool.select_next(sticky.as_deref(), force_new, Instant::now()) else {
                return Err(Error::Empty);
            };
            binding.bind(pool.account(idx).record.key.clone());

            // Cached token still comfortably valid
            if let Some(grant) = self.grant_if_fresh(&pool, idx) {
                pool.clear_quarantine(idx);
                return Ok(grant);
            }

            // Another process may have written a fresher record
            if self.store.kind().supports_external_reload() {
                self.reload_account(&mut pool, idx).await;
                if let Some(grant) = self.grant_if_fresh(&pool, idx) {
                    debug!(key = %grant.account_key, "store reload provided a fresh token");
                    pool.clear_quarantine(idx);
                    return Ok(grant);
                }
            }

            match self.refresh_account(&mut pool, idx).await {
                Ok(grant) => return Ok(grant),
                Err(error) => {
                    // Graceful degradation for shared stores: the refresh
                    // secret is stale but the cached access token may
                    // outlive it for a while.
                    if error.is_endpoint_status(400)
                        && self.store.kind().supports_external_reload()
                    {
                        let record = &pool.account(idx).record;
                        if let Some(token) = record.access_token.clone()
                            && !record.is_expired()
                        {
                            warn!(
                                key = %record.key,
                                "refresh rejected with 400; riding cached token until expiry"
                            );
                            return Ok(AccessGrant::from_record(record, token));
                        }
                    }

                    pool.account_mut(idx).health.record_failure();
                    if attempts > 1 {
                        warn!(
                            key = %pool.account(idx).record.key,
                            error = %error,
                            "refresh failed, quarantining account and rotating"
                        );
                        pool.quarantine(idx, self.config.quarantine);
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error.unwrap_or(Error::Empty))
    }

    /// Refresh unconditionally, bypassing the expiry check. Used after an
    /// upstream 403. Rotates accounts on failure like `get_access_token`.
    pub async fn force_refresh(&self, binding: &RequestBinding) -> Result<AccessGrant> {
        let mut pool = self.pool.lock().await;
        let attempts = pool.len().max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 0..attempts {
            let force_new = attempt > 0;
            let sticky = binding.key();
            let Some(idx) = pool.select_next(sticky.as_deref(), force_new, Instant::now()) else {
                return Err(Error::Empty);
            };
            binding.bind(pool.account(idx).record.key.clone());

            match self.refresh_account(&mut pool, idx).await {
                Ok(grant) => return Ok(grant),
                Err(error) => {
                    pool.account_mut(idx).health.record_failure();
                    if attempts > 1 {
                        warn!(
                            key = %pool.account(idx).record.key,
                            error = %error,
                            "forced refresh failed, rotating"
                        );
                        pool.quarantine(idx, self.config.quarantine);
                        last_error = Some(error);
                        continue;
                    }
                    return Err(error);
                }
            }
        }

        Err(last_error.unwrap_or(Error::Empty))
    }

    /// Refresh every pooled token whose cached access token expires within
    /// `within`, skipping tokens still in failure backoff. Called by the
    /// background refresher; the pool mutex is taken per account so request
    /// tasks never wait behind more than one refresh.
    pub async fn refresh_expiring(&self, within: Duration) {
        let keys = self.pool.lock().await.keys();
        let mut refreshed = 0usize;
        let mut failed = 0usize;

        for key in keys {
            let mut pool = self.pool.lock().await;
            let Some(idx) = pool.index_of(&key) else {
                continue;
            };
            let account = pool.account(idx);
            if account.health.has_valid_cached() && !account.health.cached_expiring_within(within) {
                continue;
            }
            if !account.health.is_healthy() {
                debug!(key = %key, "skipping unhealthy token in background refresh");
                continue;
            }

            match self.refresh_account(&mut pool, idx).await {
                Ok(_) => refreshed += 1,
                Err(error) => {
                    pool.account_mut(idx).health.record_failure();
                    warn!(key = %key, error = %error, "background refresh failed");
                    failed += 1;
                }
            }
        }

        if refreshed > 0 || failed > 0 {
            info!(refreshed, failed, "background refresh cycle complete");
        }
    }

    fn grant_if_fresh(&self, pool: &AccountPool, idx: usize) -> Option<AccessGrant> {
        let record = &pool.account(idx).record;
        let token = record.access_token.clone()?;
        if record.is_expiring_within(self.config.refresh_threshold) {
            return None;
        }
        Some(AccessGrant::from_record(record, token))
    }

    async fn reload_account(&self, pool: &mut MutexGuard<'_, AccountPool>, idx: usize) {
        let key = pool.account(idx).record.key.clone();
        match self.store.load_by_key(&key).await {
            Ok(Some(fresh)) => {
                pool.account_mut(idx).record = fresh;
            }
            Ok(None) => {
                debug!(key = %key, "record no longer present in store");
            }
            Err(error) => {
                warn!(key = %key, error = %error, "targeted store reload failed");
            }
        }
    }

    /// One refresh attempt for the account at `idx`, with the 400-reload
    /// retry. On success the pool record, health cache, and store are all
    /// updated.
    ///
    /// The refresh runs in a detached task: a client disconnect cancels
    /// the request future, never the refresh, so a half-refreshed state is
    /// never persisted. When the awaiting caller is still alive it applies
    /// the result under its own pool guard; when it has been dropped the
    /// task takes the (now released) lock and applies the result itself,
    /// keeping the pool and the store on the same refresh token even
    /// though the endpoint may have rotated it.
    async fn refresh_account(
        &self,
        pool: &mut MutexGuard<'_, AccountPool>,
        idx: usize,
    ) -> Result<AccessGrant> {
        let record = pool.account(idx).record.clone();
        let key = record.key.clone();
        let candidates = pool.keys();
        let store = Arc::clone(&self.store);
        let http = self.http.clone();
        let config = self.config.clone();
        let pool_handle = Arc::clone(&self.pool);

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = refresh_and_persist(store, http, config, candidates, record).await;
            if let Err(outcome) = done_tx.send(outcome) {
                // The awaiting request is gone; its pool guard died with
                // it, so this lock cannot deadlock against the caller
                if let Ok((response, updated)) = outcome {
                    let mut pool = pool_handle.lock().await;
                    if let Some(idx) = pool.index_of(&key) {
                        apply_refresh(pool.account_mut(idx), &response, updated);
                        info!(%key, "refresh completed after its request was cancelled");
                    }
                }
            }
        });

        let (response, updated) = done_rx.await.map_err(|_| {
            Error::Auth(kiro_auth::Error::Http("refresh task failed".to_string()))
        })??;

        let account = pool.account_mut(idx);
        apply_refresh(account, &response, updated);

        let grant = AccessGrant::from_record(&account.record, response.access_token);
        info!(key = %grant.account_key, method = grant.method.label(), "access token refreshed");
        Ok(grant)
    }
}

/// Fold a completed refresh into the account's runtime state.
fn apply_refresh(account: &mut Account, response: &TokenResponse, updated: CredentialRecord) {
    let expires_at = updated
        .expires_at
        .unwrap_or_else(|| response.expires_at());
    account.record = updated;
    account
        .health
        .record_success(response.access_token.clone(), expires_at);
    account.quarantine_until = None;
}

/// Refresh a record and write the result back to the store.
///
/// A 400 from the issuance endpoint on a shared store triggers one reload
/// from the store and a single retry (the in-memory refresh secret may be
/// stale). Persistence failure is logged, never fatal: the pool still
/// carries the fresh token.
async fn refresh_and_persist(
    store: Arc<dyn CredentialStore>,
    http: reqwest::Client,
    config: ManagerConfig,
    candidates: Vec<String>,
    mut record: CredentialRecord,
) -> Result<(TokenResponse, CredentialRecord)> {
    let fingerprint = machine_fingerprint();
    let endpoint = config.issuance_endpoint.as_deref();
    let first = refresh_record(&http, &record, &config.region, fingerprint, config.wire, endpoint)
        .await;
    let response = match first {
        Err(error)
            if error.is_endpoint_status(400) && store.kind().supports_external_reload() =>
        {
            warn!(key = %record.key, "refresh rejected with 400, reloading record and retrying once");
            if let Ok(Some(fresh)) = store.load_by_key(&record.key).await {
                record = fresh;
            }
            refresh_record(&http, &record, &config.region, fingerprint, config.wire, endpoint)
                .await
                .map_err(Error::Auth)?
        }
        other => other.map_err(Error::Auth)?,
    };

    record.access_token = Some(response.access_token.clone());
    record.expires_at = Some(response.expires_at());
    if let Some(rotated) = &response.refresh_token {
        record.refresh_token = rotated.clone();
    }
    if let Some(profile_arn) = &response.profile_arn {
        record.profile_arn = Some(profile_arn.clone());
    }

    persist_refreshed(&store, candidates, &record).await;
    Ok((response, record))
}

/// Write the refreshed record back. The active key is tried first, then
/// the other pool keys, then the well-known fallbacks; the first key the
/// store recognizes wins.
async fn persist_refreshed(
    store: &Arc<dyn CredentialStore>,
    pool_keys: Vec<String>,
    record: &CredentialRecord,
) {
    let mut candidates = vec![record.key.clone()];
    candidates.extend(pool_keys.into_iter().filter(|k| *k != record.key));
    let fallback_keys: Vec<String> = WELL_KNOWN_TOKEN_KEYS
        .iter()
        .map(|k| k.to_string())
        .filter(|k| !candidates.contains(k))
        .collect();
    candidates.extend(fallback_keys);

    for key in candidates {
        let mut attempt = record.clone();
        attempt.key = key.clone();
        match store.save(&attempt).await {
            Ok(()) => {
                debug!(%key, "refreshed credentials persisted");
                return;
            }
            Err(kiro_auth::Error::NotFound(_)) => continue,
            Err(error) => {
                warn!(%key, error = %error, "failed to persist refreshed credentials");
                return;
            }
        }
    }
    warn!(key = %record.key, "no credential key accepted the refreshed record");
}
