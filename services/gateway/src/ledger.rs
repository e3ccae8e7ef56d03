//! API-key users and the credit ledger
//!
//! SQLite-backed: `users(api_key, user_id, active)` and
//! `credits(user_id, balance)`. Balances are stored as decimal text and
//! never touch floating point; the conditional decrement runs inside an
//! immediate transaction so a charge is either fully applied against a
//! sufficient balance or not applied at all.

use std::path::PathBuf;
use std::str::FromStr;

use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Ledger failures (connectivity, malformed balances).
#[derive(Debug, thiserror::Error)]
#[error("ledger error: {0}")]
pub struct LedgerError(String);

/// An authenticated user row.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: String,
}

/// SQLite credit ledger.
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    /// Open the ledger, creating the schema when absent.
    pub fn open(path: PathBuf) -> Result<Self, LedgerError> {
        let conn = Connection::open(&path)
            .map_err(|e| LedgerError(format!("opening {}: {e}", path.display())))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                 api_key TEXT PRIMARY KEY,
                 user_id TEXT NOT NULL,
                 active INTEGER NOT NULL DEFAULT 1
             );
             CREATE TABLE IF NOT EXISTS credits (
                 user_id TEXT PRIMARY KEY,
                 balance TEXT NOT NULL
             );",
        )
        .map_err(|e| LedgerError(format!("creating ledger schema: {e}")))?;
        Ok(Self { path })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, LedgerError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&path)
                .map_err(|e| LedgerError(format!("opening {}: {e}", path.display())))?;
            conn.busy_timeout(std::time::Duration::from_secs(5))
                .map_err(|e| LedgerError(format!("setting busy timeout: {e}")))?;
            op(&mut conn)
        })
        .await
        .map_err(|e| LedgerError(format!("ledger task failed: {e}")))?
    }

    /// Look up an active user by API key.
    ///
    /// Every stored key is compared in constant time and the scan never
    /// exits early, so lookup duration does not depend on where (or
    /// whether) the key matches.
    pub async fn find_user_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<UserRecord>, LedgerError> {
        let api_key = api_key.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare("SELECT api_key, user_id FROM users WHERE active = 1")
                .map_err(|e| LedgerError(format!("querying users: {e}")))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|e| LedgerError(format!("querying users: {e}")))?;

            let mut matched: Option<UserRecord> = None;
            for row in rows {
                let (stored_key, user_id) =
                    row.map_err(|e| LedgerError(format!("reading user row: {e}")))?;
                let equal: bool = stored_key
                    .as_bytes()
                    .ct_eq(api_key.as_bytes())
                    .into();
                if equal && matched.is_none() {
                    matched = Some(UserRecord { user_id });
                }
            }
            Ok(matched)
        })
        .await
    }

    /// Current balance, or `None` when the user has no credits row.
    pub async fn balance(&self, user_id: &str) -> Result<Option<Decimal>, LedgerError> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT balance FROM credits WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| LedgerError(format!("reading balance: {e}")))?;
            raw.map(|text| {
                Decimal::from_str(&text)
                    .map_err(|e| LedgerError(format!("invalid balance {text:?}: {e}")))
            })
            .transpose()
        })
        .await
    }

    /// Whether the balance exists and covers `required`.
    pub async fn has_sufficient(
        &self,
        user_id: &str,
        required: Decimal,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .balance(user_id)
            .await?
            .is_some_and(|balance| balance >= required))
    }

    /// Atomically deduct `amount` under the predicate `balance >= amount`.
    ///
    /// Returns false (and changes nothing) when the balance is
    /// insufficient or the row is missing.
    pub async fn deduct(&self, user_id: &str, amount: Decimal) -> Result<bool, LedgerError> {
        if amount <= Decimal::ZERO {
            return Ok(true);
        }
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
                .map_err(|e| LedgerError(format!("starting deduction: {e}")))?;

            let raw: Option<String> = tx
                .query_row(
                    "SELECT balance FROM credits WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| LedgerError(format!("reading balance: {e}")))?;

            let Some(raw) = raw else {
                return Ok(false);
            };
            let balance = Decimal::from_str(&raw)
                .map_err(|e| LedgerError(format!("invalid balance {raw:?}: {e}")))?;
            if balance < amount {
                return Ok(false);
            }

            let updated = (balance - amount).to_string();
            tx.execute(
                "UPDATE credits SET balance = ?1 WHERE user_id = ?2",
                params![updated, user_id],
            )
            .map_err(|e| LedgerError(format!("updating balance: {e}")))?;
            tx.commit()
                .map_err(|e| LedgerError(format!("committing deduction: {e}")))?;

            debug!(user_id, deducted = %amount, remaining = %updated, "balance decremented");
            Ok(true)
        })
        .await
    }

    #[cfg(test)]
    pub async fn seed_user(&self, api_key: &str, user_id: &str, balance: &str) {
        let api_key = api_key.to_string();
        let user_id = user_id.to_string();
        let balance = balance.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (api_key, user_id, active) VALUES (?1, ?2, 1)",
                params![api_key, user_id],
            )
            .map_err(|e| LedgerError(e.to_string()))?;
            conn.execute(
                "INSERT INTO credits (user_id, balance) VALUES (?1, ?2)",
                params![user_id, balance],
            )
            .map_err(|e| LedgerError(e.to_string()))?;
            Ok(())
        })
        .await
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger(dir: &tempfile::TempDir) -> Ledger {
        Ledger::open(dir.path().join("ledger.sqlite3")).unwrap()
    }

    #[tokio::test]
    async fn finds_user_by_exact_key() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir).await;
        ledger.seed_user("sk-local-1", "u1", "1.0").await;

        let user = ledger.find_user_by_api_key("sk-local-1").await.unwrap();
        assert_eq!(user.unwrap().user_id, "u1");
        assert!(ledger
            .find_user_by_api_key("sk-local-2")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn inactive_users_do_not_match() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir).await;
        ledger.seed_user("sk-off", "u1", "1.0").await;
        ledger
            .with_conn(|conn| {
                conn.execute("UPDATE users SET active = 0", [])
                    .map_err(|e| LedgerError(e.to_string()))?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(ledger
            .find_user_by_api_key("sk-off")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn balance_parses_decimal_text() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir).await;
        ledger.seed_user("k", "u1", "0.02").await;

        let balance = ledger.balance("u1").await.unwrap().unwrap();
        assert_eq!(balance, Decimal::from_str("0.02").unwrap());
        assert!(ledger.balance("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deduction_against_sufficient_balance_succeeds_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir).await;
        ledger.seed_user("k", "u1", "0.02").await;

        let amount = Decimal::from_str("0.011").unwrap();
        assert!(ledger.deduct("u1", amount).await.unwrap());
        let remaining = ledger.balance("u1").await.unwrap().unwrap();
        assert_eq!(remaining, Decimal::from_str("0.009").unwrap());
    }

    #[tokio::test]
    async fn deduction_against_insufficient_balance_fails_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir).await;
        ledger.seed_user("k", "u1", "0.01").await;

        let amount = Decimal::from_str("0.011").unwrap();
        assert!(!ledger.deduct("u1", amount).await.unwrap());
        let balance = ledger.balance("u1").await.unwrap().unwrap();
        assert_eq!(balance, Decimal::from_str("0.01").unwrap());
    }

    #[tokio::test]
    async fn zero_amount_deduction_is_a_noop_success() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir).await;
        assert!(ledger.deduct("anyone", Decimal::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn missing_credits_row_fails_deduction() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir).await;
        let amount = Decimal::from_str("0.01").unwrap();
        assert!(!ledger.deduct("ghost", amount).await.unwrap());
    }

    #[tokio::test]
    async fn has_sufficient_compares_decimals() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger(&dir).await;
        ledger.seed_user("k", "u1", "0.011").await;

        assert!(ledger
            .has_sufficient("u1", Decimal::from_str("0.011").unwrap())
            .await
            .unwrap());
        assert!(!ledger
            .has_sufficient("u1", Decimal::from_str("0.0111").unwrap())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn concurrent_deductions_never_overdraw() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = std::sync::Arc::new(ledger(&dir).await);
        ledger.seed_user("k", "u1", "0.05").await;

        let amount = Decimal::from_str("0.02").unwrap();
        let mut handles = Vec::new();
        for _ in 0..5 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(
                async move { ledger.deduct("u1", amount).await },
            ));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                successes += 1;
            }
        }
        // 0.05 covers exactly two 0.02 deductions
        assert_eq!(successes, 2);
        let remaining = ledger.balance("u1").await.unwrap().unwrap();
        assert_eq!(remaining, Decimal::from_str("0.01").unwrap());
    }
}
