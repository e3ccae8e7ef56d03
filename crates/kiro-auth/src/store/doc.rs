//! Remote document-collection credential store
//!
//! Speaks to an HTTP document service holding `{key, value}` documents with
//! the same payload layout as the embedded KV store. Used by deployments
//! that share one credential pool across several gateway instances.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::CredentialRecord;
use crate::store::{
    CredentialStore, RegistrationPayload, StoreKind, TokenPayload, apply_record_to_payload,
    is_token_key, record_from_payloads, registration_candidates,
};

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    key: String,
    value: Value,
}

/// HTTP document-collection store.
pub struct DocStore {
    client: reqwest::Client,
    base_url: String,
}

impl DocStore {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn collection_url(&self) -> String {
        format!("{}/documents", self.base_url)
    }

    async fn fetch_all(&self) -> Result<Vec<Document>> {
        let response = self
            .client
            .get(self.collection_url())
            .send()
            .await
            .map_err(|e| Error::Store(format!("listing documents: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Store(format!(
                "document store returned {} on list",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Store(format!("decoding document list: {e}")))
    }

    async fn fetch_one(&self, key: &str) -> Result<Option<Document>> {
        let response = self
            .client
            .get(self.collection_url())
            .query(&[("key", key)])
            .send()
            .await
            .map_err(|e| Error::Store(format!("fetching document {key}: {e}")))?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::Store(format!(
                "document store returned {} for {key}",
                response.status()
            )));
        }
        let document = response
            .json()
            .await
            .map_err(|e| Error::Store(format!("decoding document {key}: {e}")))?;
        Ok(Some(document))
    }

    async fn put(&self, document: &Document) -> Result<()> {
        let response = self
            .client
            .put(self.collection_url())
            .json(document)
            .send()
            .await
            .map_err(|e| Error::Store(format!("writing document {}: {e}", document.key)))?;
        if !response.status().is_success() {
            return Err(Error::Store(format!(
                "document store returned {} writing {}",
                response.status(),
                document.key
            )));
        }
        Ok(())
    }

    fn token_payload(document: &Document) -> Result<TokenPayload> {
        serde_json::from_value(document.value.clone()).map_err(|e| {
            Error::CredentialParse(format!("token payload for {}: {e}", document.key))
        })
    }

    fn registration_payload(document: &Document) -> Result<RegistrationPayload> {
        serde_json::from_value(document.value.clone()).map_err(|e| {
            Error::CredentialParse(format!("registration payload for {}: {e}", document.key))
        })
    }

    async fn registration_for(&self, token_key: &str) -> Result<Option<RegistrationPayload>> {
        for candidate in registration_candidates(token_key) {
            if let Some(document) = self.fetch_one(&candidate).await? {
                return Ok(Some(Self::registration_payload(&document)?));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl CredentialStore for DocStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Document
    }

    async fn load_all(&self) -> Result<Vec<CredentialRecord>> {
        let mut documents = self.fetch_all().await?;
        documents.sort_by(|a, b| a.key.cmp(&b.key));

        let mut records = Vec::new();
        for document in &documents {
            if !is_token_key(&document.key) {
                continue;
            }
            let token = Self::token_payload(document)?;
            let registration = self.registration_for(&document.key).await?;
            records.push(record_from_payloads(&document.key, token, registration)?);
        }
        info!(accounts = records.len(), "credentials loaded from document store");
        Ok(records)
    }

    async fn load_by_key(&self, key: &str) -> Result<Option<CredentialRecord>> {
        let Some(document) = self.fetch_one(key).await? else {
            return Ok(None);
        };
        let token = Self::token_payload(&document)?;
        let registration = self.registration_for(key).await?;
        Ok(Some(record_from_payloads(key, token, registration)?))
    }

    async fn save(&self, record: &CredentialRecord) -> Result<()> {
        let Some(mut document) = self.fetch_one(&record.key).await? else {
            return Err(Error::NotFound(format!(
                "key {} not present in document store",
                record.key
            )));
        };
        apply_record_to_payload(&mut document.value, record)?;
        self.put(&document).await?;
        debug!(key = %record.key, "document credentials persisted");
        Ok(())
    }
}
