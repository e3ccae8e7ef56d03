//! Ordered account pool with round-robin selection and quarantine
//!
//! The pool is plain data: the `AuthManager` guards it (together with all
//! credential-store I/O it performs) behind a single mutex, so nothing in
//! here synchronizes. The cursor starts at −1 so the first selection lands
//! on index 0, and `cursor % len` is always a valid index once the pool is
//! non-empty.

use std::time::{Duration, Instant};

use kiro_auth::CredentialRecord;
use serde_json::json;
use tracing::{debug, info};

use crate::health::TokenHealth;

/// One credential record plus its runtime health state.
#[derive(Debug)]
pub struct Account {
    pub record: CredentialRecord,
    /// Account is skipped by selection until this instant
    pub quarantine_until: Option<Instant>,
    pub health: TokenHealth,
}

impl Account {
    fn new(record: CredentialRecord) -> Self {
        Self {
            record,
            quarantine_until: None,
            health: TokenHealth::new(),
        }
    }

    /// Whether selection may return this account right now.
    pub fn eligible(&self, now: Instant) -> bool {
        match self.quarantine_until {
            Some(until) => now >= until,
            None => true,
        }
    }
}

/// Ordered account sequence with a monotonically advancing cursor.
#[derive(Debug, Default)]
pub struct AccountPool {
    accounts: Vec<Account>,
    cursor: i64,
}

impl AccountPool {
    pub fn new() -> Self {
        Self {
            accounts: Vec::new(),
            cursor: -1,
        }
    }

    /// Replace the pool contents atomically, resetting the cursor.
    pub fn replace_all(&mut self, records: Vec<CredentialRecord>) {
        self.accounts = records.into_iter().map(Account::new).collect();
        self.cursor = -1;
        info!(accounts = self.accounts.len(), "account pool loaded");
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    pub fn account(&self, idx: usize) -> &Account {
        &self.accounts[idx]
    }

    pub fn account_mut(&mut self, idx: usize) -> &mut Account {
        &mut self.accounts[idx]
    }

    pub fn keys(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.record.key.clone()).collect()
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.accounts.iter().position(|a| a.record.key == key)
    }

    /// Select the next account.
    ///
    /// Without `force_new`, a still-eligible sticky account (the one this
    /// request already used) is returned unchanged so re-entry mid-request
    /// stays on the same credentials. Otherwise the cursor advances up to
    /// one full sweep looking for an eligible account. If every account is
    /// quarantined, all quarantines are cleared and the next account in
    /// order is returned — the request then carries the failure if its
    /// refresh also fails, but selection always makes progress.
    pub fn select_next(
        &mut self,
        sticky_key: Option<&str>,
        force_new: bool,
        now: Instant,
    ) -> Option<usize> {
        if self.accounts.is_empty() {
            return None;
        }

        if !force_new
            && let Some(key) = sticky_key
            && let Some(idx) = self.index_of(key)
            && self.accounts[idx].eligible(now)
        {
            return Some(idx);
        }

        let n = self.accounts.len();
        for _ in 0..n {
            self.cursor += 1;
            let idx = self.cursor as usize % n;
            if self.accounts[idx].eligible(now) {
                return Some(idx);
            }
        }

        debug!("all accounts quarantined, clearing quarantines for forward progress");
        for account in &mut self.accounts {
            account.quarantine_until = None;
        }
        self.cursor += 1;
        Some(self.cursor as usize % n)
    }

    /// Quarantine an account for `window`.
    pub fn quarantine(&mut self, idx: usize, window: Duration) {
        let account = &mut self.accounts[idx];
        account.quarantine_until = Some(Instant::now() + window);
        debug!(key = %account.record.key, secs = window.as_secs(), "account quarantined");
    }

    /// Clear an account's quarantine (successful refresh).
    pub fn clear_quarantine(&mut self, idx: usize) {
        self.accounts[idx].quarantine_until = None;
    }

    /// Pool summary for the health endpoint.
    pub fn snapshot(&self) -> serde_json::Value {
        let now = Instant::now();
        let mut eligible = 0usize;
        let accounts: Vec<_> = self
            .accounts
            .iter()
            .map(|account| {
                let quarantined_secs = account
                    .quarantine_until
                    .filter(|until| *until > now)
                    .map(|until| (until - now).as_secs());
                if quarantined_secs.is_none() {
                    eligible += 1;
                }
                json!({
                    "key": account.record.key,
                    "method": account.record.method().label(),
                    "quarantine_remaining_secs": quarantined_secs,
                    "consecutive_failures": account.health.consecutive_failures,
                    "total_successes": account.health.total_successes,
                    "total_failures": account.health.total_failures,
                })
            })
            .collect();

        let total = self.accounts.len();
        let status = if total == 0 {
            "unhealthy"
        } else if eligible == total {
            "healthy"
        } else if eligible > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        json!({
            "status": status,
            "accounts_total": total,
            "accounts_eligible": eligible,
            "accounts": accounts,
        })
    }
}
