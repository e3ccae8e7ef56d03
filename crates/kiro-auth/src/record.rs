//! Credential records and authentication-mechanism detection
//!
//! A record is identified by its store-local key and carries the refresh
//! secret plus whatever access material the store already had. Records are
//! immutable apart from the fields a successful refresh may rotate
//! (access token, expiry, refresh token, profile identifier).

use std::time::Duration;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{Error, Result};

/// Upstream token-issuance mechanism.
///
/// `DesktopRefresh` talks to the Kiro desktop auth endpoint with a bare
/// refresh token. `DeviceOauth` talks to the AWS SSO OIDC endpoint and
/// additionally needs the client id/secret pair from a device registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    DesktopRefresh,
    DeviceOauth,
}

impl AuthMethod {
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::DesktopRefresh => "desktop_refresh",
            AuthMethod::DeviceOauth => "device_oauth",
        }
    }
}

/// One upstream credential as loaded from a store.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    /// Store-local key this record was loaded from
    pub key: String,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
    pub profile_arn: Option<String>,
    /// API region hint (defaults applied by the caller)
    pub region: Option<String>,
    /// SSO region for OIDC token refresh only; may differ from the API region
    pub sso_region: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl CredentialRecord {
    /// Detect the issuance mechanism from the loaded fields.
    ///
    /// Device registrations carry a client id/secret pair; desktop
    /// credentials never do.
    pub fn method(&self) -> AuthMethod {
        if self.client_id.is_some() && self.client_secret.is_some() {
            AuthMethod::DeviceOauth
        } else {
            AuthMethod::DesktopRefresh
        }
    }

    /// Whether the cached access token expires within `threshold`.
    ///
    /// Missing expiry information counts as expiring: a refresh is the only
    /// way to learn the real lifetime.
    pub fn is_expiring_within(&self, threshold: Duration) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - OffsetDateTime::now_utc() <= threshold,
            None => true,
        }
    }

    /// Whether the cached access token is actually expired (not just
    /// expiring soon). Used for graceful degradation when refresh fails
    /// but the token may still ride out its true lifetime.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => OffsetDateTime::now_utc() >= expires_at,
            None => true,
        }
    }

    /// Masked refresh token for logging.
    pub fn masked_refresh(&self) -> String {
        mask(&self.refresh_token)
    }
}

/// Mask a secret for log output: `abcd1234...wxyz` for long values.
pub fn mask(secret: &str) -> String {
    if secret.len() > 16 {
        format!("{}...{}", &secret[..8], &secret[secret.len() - 4..])
    } else {
        "***".to_string()
    }
}

/// Parse an RFC 3339 expiry string. A trailing `Z` is accepted.
pub fn parse_expiry(raw: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|e| Error::CredentialParse(format!("invalid expires_at {raw:?}: {e}")))
}

/// Format an expiry as RFC 3339 for persistence.
pub fn format_expiry(expires_at: OffsetDateTime) -> Result<String> {
    expires_at
        .format(&Rfc3339)
        .map_err(|e| Error::CredentialParse(format!("failed to format expiry: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> CredentialRecord {
        CredentialRecord {
            key: "test".into(),
            refresh_token: "rt_0123456789abcdef0123".into(),
            access_token: Some("at_test".into()),
            expires_at: Some(OffsetDateTime::now_utc() + Duration::from_secs(3600)),
            profile_arn: None,
            region: None,
            sso_region: None,
            client_id: None,
            client_secret: None,
        }
    }

    #[test]
    fn method_defaults_to_desktop() {
        assert_eq!(record().method(), AuthMethod::DesktopRefresh);
    }

    #[test]
    fn method_detects_device_oauth() {
        let mut r = record();
        r.client_id = Some("cid".into());
        r.client_secret = Some("cs".into());
        assert_eq!(r.method(), AuthMethod::DeviceOauth);
    }

    #[test]
    fn client_id_alone_is_not_device_oauth() {
        let mut r = record();
        r.client_id = Some("cid".into());
        assert_eq!(r.method(), AuthMethod::DesktopRefresh);
    }

    #[test]
    fn expiring_within_threshold() {
        let mut r = record();
        r.expires_at = Some(OffsetDateTime::now_utc() + Duration::from_secs(60));
        assert!(r.is_expiring_within(Duration::from_secs(600)));
        assert!(!r.is_expiring_within(Duration::from_secs(10)));
    }

    #[test]
    fn missing_expiry_counts_as_expiring_and_expired() {
        let mut r = record();
        r.expires_at = None;
        assert!(r.is_expiring_within(Duration::from_secs(1)));
        assert!(r.is_expired());
    }

    #[test]
    fn fresh_token_is_not_expired() {
        assert!(!record().is_expired());
    }

    #[test]
    fn parse_expiry_accepts_z_suffix() {
        let parsed = parse_expiry("2031-01-02T03:04:05Z").unwrap();
        assert_eq!(parsed.year(), 2031);
    }

    #[test]
    fn parse_expiry_accepts_offset() {
        let parsed = parse_expiry("2031-01-02T03:04:05+00:00").unwrap();
        assert_eq!(parsed.month() as u8, 1);
    }

    #[test]
    fn parse_expiry_rejects_garbage() {
        assert!(parse_expiry("not-a-date").is_err());
    }

    #[test]
    fn mask_long_and_short_tokens() {
        assert_eq!(mask("rt_0123456789abcdef0123"), "rt_01234...0123");
        assert_eq!(mask("short"), "***");
    }
}
