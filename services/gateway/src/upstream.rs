//! Upstream HTTP engine
//!
//! Owns the lazily-created reqwest clients and the two retry policies.
//! Non-streaming calls back off exponentially on 429/5xx/transport
//! failures and spend one uncounted retry on a forced token refresh after
//! a 403. Streaming calls race the establishment-plus-first-byte window
//! against the first-token timeout with immediate retries; once a body
//! byte has arrived no retry is possible and failures surface as
//! stream-level errors.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use kiro_pool::{AuthManager, RequestBinding};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::GatewayError;

const KIRO_VERSION: &str = "0.7.45";

/// Retry and timeout tunables for upstream calls.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub base_retry_delay: Duration,
    pub first_token_timeout: Duration,
    pub first_token_max_retries: u32,
    pub streaming_read_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            max_retries: 3,
            base_retry_delay: Duration::from_secs(1),
            first_token_timeout: Duration::from_secs(15),
            first_token_max_retries: 3,
            streaming_read_timeout: Duration::from_secs(300),
        }
    }
}

/// Completion endpoint host for a region.
pub fn api_host(region: &str) -> String {
    format!("https://codewhisperer.{region}.amazonaws.com")
}

/// Model-list endpoint host for a region.
pub fn q_host(region: &str) -> String {
    format!("https://q.{region}.amazonaws.com")
}

/// A successfully established streaming response.
///
/// `first_chunk` is the body byte(s) that won the first-token race; the
/// consumer replays it ahead of the remaining stream.
pub struct StreamingStart {
    pub response: reqwest::Response,
    pub first_chunk: Option<Bytes>,
}

enum RetryCause {
    RateLimited,
    Server,
    Network(String),
}

/// Upstream caller bound to the auth manager.
pub struct UpstreamClient {
    auth: Arc<AuthManager>,
    config: UpstreamConfig,
    client: Mutex<Option<reqwest::Client>>,
    streaming_client: Mutex<Option<reqwest::Client>>,
}

impl UpstreamClient {
    pub fn new(auth: Arc<AuthManager>, config: UpstreamConfig) -> Self {
        Self {
            auth,
            config,
            client: Mutex::new(None),
            streaming_client: Mutex::new(None),
        }
    }

    /// Mandatory headers for every upstream call: bearer token plus the
    /// fingerprint-derived identification pair.
    fn headers(&self, token: &str) -> Result<HeaderMap, GatewayError> {
        let fingerprint = self.auth.fingerprint();
        let ua_suffix = format!("KiroIDE-{KIRO_VERSION}-{fingerprint}");

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| GatewayError::Internal(format!("invalid bearer token: {e}")))?,
        );
        headers.insert(
            "x-amz-user-agent",
            HeaderValue::from_str(&format!("aws-sdk-js/1.0.27 {ua_suffix}"))
                .map_err(|e| GatewayError::Internal(format!("invalid user agent: {e}")))?,
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_str(&format!(
                "aws-sdk-js/1.0.27 ua/2.1 os/linux lang/js md/nodejs#22.0.0 api/codewhispererstreaming#1.0.27 m/E {ua_suffix}"
            ))
            .map_err(|e| GatewayError::Internal(format!("invalid user agent: {e}")))?,
        );
        headers.insert("x-amzn-kiro-agent-mode", HeaderValue::from_static("vibe"));
        headers.insert(
            "x-amzn-codewhisperer-optout",
            HeaderValue::from_static("true"),
        );
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert("amz-sdk-invocation-id", value);
        }
        Ok(headers)
    }

    async fn client(&self) -> Result<reqwest::Client, GatewayError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("building http client: {e}")))?;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Streaming client: short connect window, long read timeout between
    /// body frames, no overall deadline.
    async fn streaming_client(&self) -> Result<reqwest::Client, GatewayError> {
        let mut guard = self.streaming_client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .connect_timeout(self.config.first_token_timeout)
            .read_timeout(self.config.streaming_read_timeout)
            .build()
            .map_err(|e| GatewayError::Internal(format!("building streaming client: {e}")))?;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Non-streaming call with backoff. 2xx and non-retryable 4xx return
    /// as-is; a 403 spends one uncounted forced refresh.
    pub async fn request_json(
        &self,
        binding: &RequestBinding,
        url: &str,
        body: &Value,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response, GatewayError> {
        let client = self.client().await?;
        let mut attempt: u32 = 0;
        let mut refreshed_after_403 = false;
        let mut last_cause = RetryCause::Server;

        while attempt < self.config.max_retries {
            let grant = self
                .auth
                .get_access_token(binding)
                .await
                .map_err(GatewayError::from_auth)?;
            let headers = self.headers(&grant.access_token)?;

            let result = client
                .post(url)
                .headers(headers)
                .query(query)
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if status == 403 && !refreshed_after_403 {
                        warn!(url, "upstream returned 403, forcing token refresh");
                        self.auth
                            .force_refresh(binding)
                            .await
                            .map_err(GatewayError::from_auth)?;
                        refreshed_after_403 = true;
                        // The refresh retry does not count against backoff
                        continue;
                    }
                    if status == 429 {
                        last_cause = RetryCause::RateLimited;
                    } else if status >= 500 {
                        last_cause = RetryCause::Server;
                    } else {
                        return Ok(response);
                    }
                    metrics::counter!("gateway_upstream_retries_total").increment(1);
                    warn!(url, status, attempt, "retryable upstream status");
                }
                Err(error) => {
                    last_cause = RetryCause::Network(error.to_string());
                    metrics::counter!("gateway_upstream_retries_total").increment(1);
                    warn!(url, error = %error, attempt, "retryable transport failure");
                }
            }

            let delay = self.config.base_retry_delay * 2u32.pow(attempt);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }

        let attempts = self.config.max_retries;
        Err(match last_cause {
            RetryCause::RateLimited => GatewayError::UpstreamRateLimited { attempts },
            RetryCause::Server => GatewayError::UpstreamExhausted { attempts },
            RetryCause::Network(message) => {
                debug!(%message, "exhausted on transport failures");
                GatewayError::UpstreamExhausted { attempts }
            }
        })
    }

    /// Single-attempt authenticated GET, for the model-list endpoint.
    /// Failures are the caller's to absorb; the cached list covers them.
    pub async fn get_json(
        &self,
        binding: &RequestBinding,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<Value, GatewayError> {
        let client = self.client().await?;
        let grant = self
            .auth
            .get_access_token(binding)
            .await
            .map_err(GatewayError::from_auth)?;
        let headers = self.headers(&grant.access_token)?;

        let response = client
            .get(url)
            .headers(headers)
            .query(query)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamNetwork(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                message: body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| GatewayError::UpstreamBadPayload(e.to_string()))
    }

    /// Streaming call: the establishment-plus-first-byte window is bounded
    /// by the first-token timeout, retried immediately (no backoff) up to
    /// the cap. Non-2xx responses return without waiting for a body byte
    /// so the caller can read the error payload.
    pub async fn request_streaming(
        &self,
        binding: &RequestBinding,
        url: &str,
        body: &Value,
    ) -> Result<StreamingStart, GatewayError> {
        let client = self.streaming_client().await?;
        let mut attempt: u32 = 0;
        let mut refreshed_after_403 = false;

        while attempt < self.config.first_token_max_retries {
            let grant = self
                .auth
                .get_access_token(binding)
                .await
                .map_err(GatewayError::from_auth)?;
            let headers = self.headers(&grant.access_token)?;

            let send = client.post(url).headers(headers).json(body).send();
            let mut response =
                match tokio::time::timeout(self.config.first_token_timeout, send).await {
                    Ok(Ok(response)) => response,
                    Ok(Err(error)) => {
                        warn!(url, error = %error, attempt, "streaming establishment failed, retrying");
                        attempt += 1;
                        continue;
                    }
                    Err(_) => {
                        warn!(url, attempt, "streaming establishment hit first-token timeout");
                        attempt += 1;
                        continue;
                    }
                };

            let status = response.status().as_u16();
            if status == 403 && !refreshed_after_403 {
                warn!(url, "upstream returned 403 on stream, forcing token refresh");
                self.auth
                    .force_refresh(binding)
                    .await
                    .map_err(GatewayError::from_auth)?;
                refreshed_after_403 = true;
                // The refresh retry does not count against the cap
                continue;
            }
            if !response.status().is_success() {
                return Ok(StreamingStart {
                    response,
                    first_chunk: None,
                });
            }

            // Headers are in; the first body byte must land inside the
            // same window or the whole call is retried.
            match tokio::time::timeout(self.config.first_token_timeout, response.chunk()).await {
                Ok(Ok(first_chunk)) => {
                    return Ok(StreamingStart {
                        response,
                        first_chunk,
                    });
                }
                Ok(Err(error)) => {
                    warn!(url, error = %error, attempt, "first body byte failed, retrying");
                }
                Err(_) => {
                    warn!(url, attempt, "first body byte hit first-token timeout");
                }
            }
            attempt += 1;
        }

        Err(GatewayError::FirstTokenTimeout {
            attempts: self.config.first_token_max_retries,
        })
    }
}
