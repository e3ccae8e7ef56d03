//! Token refresh against the two upstream issuance endpoints
//!
//! Desktop credentials refresh against the Kiro desktop auth service with a
//! JSON body; device-OAuth credentials refresh against AWS SSO OIDC in the
//! record's SSO region. Both endpoints answer with camelCase token fields.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::record::{AuthMethod, CredentialRecord, mask};

/// Buffer subtracted from the advertised lifetime so a token is never used
/// right at its expiry instant.
const EXPIRY_BUFFER: Duration = Duration::from_secs(60);

fn default_expires_in() -> i64 {
    3600
}

/// Response from either token endpoint.
///
/// `expires_in` is a delta in seconds from the response time; the caller
/// converts it to an absolute instant via [`TokenResponse::expires_at`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    /// Some deployments rotate the refresh token on every refresh
    pub refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    pub expires_in: i64,
    /// Desktop endpoint only
    pub profile_arn: Option<String>,
}

impl TokenResponse {
    /// Absolute expiry: response time + expiresIn − 60 s.
    pub fn expires_at(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc() + Duration::from_secs(self.expires_in.max(0) as u64)
            - EXPIRY_BUFFER
    }
}

/// Wire format used by the device-OAuth refresh request.
///
/// Two formats coexist in deployed stores; pick the one matching whatever
/// wrote the embedded store being shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceOauthWire {
    /// JSON body with camelCase keys
    #[default]
    Json,
    /// Form-urlencoded body with snake_case keys
    Form,
}

impl DeviceOauthWire {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "json" => Some(DeviceOauthWire::Json),
            "form" => Some(DeviceOauthWire::Form),
            _ => None,
        }
    }
}

/// Desktop auth refresh endpoint for a region.
pub fn desktop_refresh_url(region: &str) -> String {
    format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken")
}

/// AWS SSO OIDC token endpoint for a region.
pub fn device_oauth_url(sso_region: &str) -> String {
    format!("https://oidc.{sso_region}.amazonaws.com/token")
}

/// Refresh a credential record, dispatching on its mechanism.
///
/// `region` is the process-level default API region, used when the record
/// carries no regional hint. `endpoint_override` replaces the
/// region-derived issuance URL (self-hosted mocks, proxies).
pub async fn refresh_record(
    client: &reqwest::Client,
    record: &CredentialRecord,
    region: &str,
    fingerprint: &str,
    wire: DeviceOauthWire,
    endpoint_override: Option<&str>,
) -> Result<TokenResponse> {
    match record.method() {
        AuthMethod::DesktopRefresh => {
            let url = match endpoint_override {
                Some(url) => url.to_string(),
                None => desktop_refresh_url(record.region.as_deref().unwrap_or(region)),
            };
            refresh_desktop(client, &url, &record.refresh_token, fingerprint).await
        }
        AuthMethod::DeviceOauth => {
            // The SSO region may differ from the API region
            let sso_region = record
                .sso_region
                .as_deref()
                .or(record.region.as_deref())
                .unwrap_or(region);
            let url = match endpoint_override {
                Some(url) => url.to_string(),
                None => device_oauth_url(sso_region),
            };
            refresh_device_oauth(client, &url, record, wire).await
        }
    }
}

/// Refresh via the Kiro desktop auth endpoint.
pub async fn refresh_desktop(
    client: &reqwest::Client,
    url: &str,
    refresh_token: &str,
    fingerprint: &str,
) -> Result<TokenResponse> {
    info!(token = %mask(refresh_token), "refreshing via desktop auth");

    let response = client
        .post(url)
        .header("User-Agent", format!("KiroIDE-0.7.45-{fingerprint}"))
        .json(&json!({ "refreshToken": refresh_token }))
        .send()
        .await
        .map_err(|e| Error::Http(format!("desktop refresh request failed: {e}")))?;

    read_token_response(response).await
}

/// Refresh via the AWS SSO OIDC endpoint.
pub async fn refresh_device_oauth(
    client: &reqwest::Client,
    url: &str,
    record: &CredentialRecord,
    wire: DeviceOauthWire,
) -> Result<TokenResponse> {
    let client_id = record
        .client_id
        .as_deref()
        .ok_or_else(|| Error::InvalidCredentials("client id is not set".into()))?;
    let client_secret = record
        .client_secret
        .as_deref()
        .ok_or_else(|| Error::InvalidCredentials("client secret is not set".into()))?;

    debug!(%url, token = %record.masked_refresh(), "refreshing via device oauth");

    // Scopes are deliberately omitted: RFC 6749 §6 keeps the originally
    // granted scopes on refresh.
    let request = client.post(url);
    let request = match wire {
        DeviceOauthWire::Json => request.json(&json!({
            "grantType": "refresh_token",
            "clientId": client_id,
            "clientSecret": client_secret,
            "refreshToken": record.refresh_token,
        })),
        DeviceOauthWire::Form => request.form(&[
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", record.refresh_token.as_str()),
        ]),
    };

    let response = request
        .send()
        .await
        .map_err(|e| Error::Http(format!("device oauth refresh request failed: {e}")))?;

    read_token_response(response).await
}

async fn read_token_response(response: reqwest::Response) -> Result<TokenResponse> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| Error::CredentialParse(format!("invalid token response: {e}")))?;

    if token.access_token.is_empty() {
        return Err(Error::CredentialParse(
            "token response does not contain accessToken".into(),
        ));
    }

    Ok(token)
}
