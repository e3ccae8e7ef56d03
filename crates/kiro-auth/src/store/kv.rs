//! Embedded SQLite key/value credential store
//!
//! Reads the `auth_kv(key, value)` table maintained by the upstream CLI.
//! Another process owns this database and may rewrite rows at any time, so
//! every operation opens a short-lived connection inside `spawn_blocking`
//! rather than holding one across awaits.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::CredentialRecord;
use crate::store::{
    CredentialStore, RegistrationPayload, StoreKind, TokenPayload, apply_record_to_payload,
    is_token_key, record_from_payloads, registration_candidates,
};

/// SQLite-backed KV store.
pub struct KvStore {
    path: PathBuf,
}

impl KvStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)
                .map_err(|e| Error::Store(format!("opening {}: {e}", path.display())))?;
            op(&conn)
        })
        .await
        .map_err(|e| Error::Store(format!("kv task failed: {e}")))?
    }
}

fn read_all_rows(conn: &Connection) -> Result<BTreeMap<String, String>> {
    let mut stmt = conn
        .prepare("SELECT key, value FROM auth_kv ORDER BY key")
        .map_err(|e| Error::Store(format!("querying auth_kv: {e}")))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| Error::Store(format!("querying auth_kv: {e}")))?;

    let mut map = BTreeMap::new();
    for row in rows {
        let (key, value) = row.map_err(|e| Error::Store(format!("reading auth_kv row: {e}")))?;
        map.insert(key, value);
    }
    Ok(map)
}

fn read_row(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM auth_kv WHERE key = ?1",
        params![key],
        |row| row.get::<_, String>(0),
    )
    .optional()
    .map_err(|e| Error::Store(format!("reading auth_kv key: {e}")))
}

fn parse_token(key: &str, raw: &str) -> Result<TokenPayload> {
    serde_json::from_str(raw)
        .map_err(|e| Error::CredentialParse(format!("token payload for {key}: {e}")))
}

fn parse_registration(key: &str, raw: &str) -> Result<RegistrationPayload> {
    serde_json::from_str(raw)
        .map_err(|e| Error::CredentialParse(format!("registration payload for {key}: {e}")))
}

fn registration_for(
    conn: &Connection,
    token_key: &str,
) -> Result<Option<RegistrationPayload>> {
    for candidate in registration_candidates(token_key) {
        if let Some(raw) = read_row(conn, &candidate)? {
            return Ok(Some(parse_registration(&candidate, &raw)?));
        }
    }
    Ok(None)
}

#[async_trait]
impl CredentialStore for KvStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Kv
    }

    async fn load_all(&self) -> Result<Vec<CredentialRecord>> {
        let path = self.path.display().to_string();
        let records = self
            .with_conn(move |conn| {
                let rows = read_all_rows(conn)?;
                let mut records = Vec::new();
                // BTreeMap iteration gives lexicographic key order, keeping
                // round-robin deterministic across restarts.
                for (key, raw) in &rows {
                    if !is_token_key(key) {
                        continue;
                    }
                    let token = parse_token(key, raw)?;
                    let registration = registration_for(conn, key)?;
                    records.push(record_from_payloads(key, token, registration)?);
                }
                Ok(records)
            })
            .await?;
        info!(db = %path, accounts = records.len(), "credentials loaded from kv store");
        Ok(records)
    }

    async fn load_by_key(&self, key: &str) -> Result<Option<CredentialRecord>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let Some(raw) = read_row(conn, &key)? else {
                return Ok(None);
            };
            let token = parse_token(&key, &raw)?;
            let registration = registration_for(conn, &key)?;
            Ok(Some(record_from_payloads(&key, token, registration)?))
        })
        .await
    }

    async fn save(&self, record: &CredentialRecord) -> Result<()> {
        let record = record.clone();
        self.with_conn(move |conn| {
            let Some(raw) = read_row(conn, &record.key)? else {
                return Err(Error::NotFound(format!(
                    "key {} not present in kv store",
                    record.key
                )));
            };
            let mut existing: Value = serde_json::from_str(&raw)
                .map_err(|e| Error::CredentialParse(format!("stored payload: {e}")))?;
            apply_record_to_payload(&mut existing, &record)?;

            let serialized = serde_json::to_string(&existing)
                .map_err(|e| Error::CredentialParse(format!("serializing payload: {e}")))?;
            let updated = conn
                .execute(
                    "UPDATE auth_kv SET value = ?1 WHERE key = ?2",
                    params![serialized, record.key],
                )
                .map_err(|e| Error::Store(format!("updating auth_kv: {e}")))?;
            if updated != 1 {
                return Err(Error::NotFound(format!(
                    "key {} vanished during update",
                    record.key
                )));
            }
            debug!(key = %record.key, "kv credentials persisted");
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AuthMethod;

    fn seed_db(dir: &tempfile::TempDir, rows: &[(&str, &str)]) -> PathBuf {
        let path = dir.path().join("data.sqlite3");
        let conn = Connection::open(&path).unwrap();
        conn.execute(
            "CREATE TABLE auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .unwrap();
        for (key, value) in rows {
            conn.execute(
                "INSERT INTO auth_kv (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .unwrap();
        }
        path
    }

    const TOKEN: &str = r#"{"access_token":"at_kv","refresh_token":"rt_kv","expires_at":"2031-01-01T00:00:00Z","region":"ap-southeast-1"}"#;
    const REGISTRATION: &str = r#"{"client_id":"cid","client_secret":"cs","region":"ap-southeast-1"}"#;

    #[tokio::test]
    async fn loads_paired_token_and_registration() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(
            &dir,
            &[
                ("kirocli:odic:token", TOKEN),
                ("kirocli:odic:device-registration", REGISTRATION),
            ],
        );

        let store = KvStore::new(path);
        let records = store.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method(), AuthMethod::DeviceOauth);
        assert_eq!(records[0].sso_region.as_deref(), Some("ap-southeast-1"));
    }

    #[tokio::test]
    async fn load_all_preserves_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(
            &dir,
            &[
                ("kirocli:odic:token:2", r#"{"refresh_token":"rt_b"}"#),
                ("kirocli:odic:token", r#"{"refresh_token":"rt_a"}"#),
                ("kirocli:odic:token:10", r#"{"refresh_token":"rt_c"}"#),
            ],
        );

        let store = KvStore::new(path);
        let records = store.load_all().await.unwrap();
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "kirocli:odic:token",
                "kirocli:odic:token:10",
                "kirocli:odic:token:2",
            ]
        );
    }

    #[tokio::test]
    async fn suffixed_token_falls_back_to_unsuffixed_registration() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(
            &dir,
            &[
                ("kirocli:odic:token:2", r#"{"refresh_token":"rt_2"}"#),
                ("kirocli:odic:device-registration", REGISTRATION),
            ],
        );

        let store = KvStore::new(path);
        let record = store
            .load_by_key("kirocli:odic:token:2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.client_id.as_deref(), Some("cid"));
    }

    #[tokio::test]
    async fn suffixed_registration_wins_over_unsuffixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(
            &dir,
            &[
                ("kirocli:odic:token:2", r#"{"refresh_token":"rt_2"}"#),
                (
                    "kirocli:odic:device-registration:2",
                    r#"{"client_id":"cid2","client_secret":"cs2"}"#,
                ),
                ("kirocli:odic:device-registration", REGISTRATION),
            ],
        );

        let store = KvStore::new(path);
        let record = store
            .load_by_key("kirocli:odic:token:2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.client_id.as_deref(), Some("cid2"));
    }

    #[tokio::test]
    async fn registration_rows_are_not_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(
            &dir,
            &[("kirocli:odic:device-registration", REGISTRATION)],
        );
        let store = KvStore::new(path);
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_missing_key_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, &[]);
        let store = KvStore::new(path);
        assert!(store.load_by_key("kirocli:odic:token").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_updates_existing_row_preserving_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(
            &dir,
            &[(
                "kirocli:odic:token",
                r#"{"refresh_token":"rt_old","scopes":["codewhisperer:completions"]}"#,
            )],
        );

        let store = KvStore::new(path.clone());
        let mut record = store
            .load_by_key("kirocli:odic:token")
            .await
            .unwrap()
            .unwrap();
        record.refresh_token = "rt_new".into();
        record.access_token = Some("at_new".into());
        store.save(&record).await.unwrap();

        let conn = Connection::open(&path).unwrap();
        let raw = read_row(&conn, "kirocli:odic:token").unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["refresh_token"], "rt_new");
        assert_eq!(value["access_token"], "at_new");
        assert_eq!(value["scopes"][0], "codewhisperer:completions");
    }

    #[tokio::test]
    async fn save_never_creates_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, &[]);
        let store = KvStore::new(path);
        let record = CredentialRecord {
            key: "kirocli:odic:token".into(),
            refresh_token: "rt".into(),
            access_token: None,
            expires_at: None,
            profile_arn: None,
            region: None,
            sso_region: None,
            client_id: None,
            client_secret: None,
        };
        assert!(matches!(store.save(&record).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn malformed_token_payload_is_rejected_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = seed_db(&dir, &[("kirocli:odic:token", r#"{"nope":true}"#)]);
        let store = KvStore::new(path);
        assert!(matches!(
            store.load_all().await,
            Err(Error::CredentialParse(_))
        ));
    }
}
