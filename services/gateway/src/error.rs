//! Gateway error taxonomy
//!
//! Every failure kind maps to one HTTP status at the boundary, rendered in
//! whichever dialect the endpoint speaks.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::billing::BillingError;
use crate::ledger::LedgerError;
use crate::translate::TranslateError;

/// Gateway-level errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing API key")]
    AuthMissing,

    #[error("invalid API key")]
    AuthInvalid,

    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found")]
    NotFound,

    #[error("upstream authorization failed ({status}): {body}")]
    UpstreamAuth { status: u16, body: String },

    #[error("upstream rate limited after {attempts} attempts")]
    UpstreamRateLimited { attempts: u32 },

    #[error("upstream request failed after {attempts} attempts")]
    UpstreamExhausted { attempts: u32 },

    #[error("upstream did not start responding within the first-token window ({attempts} attempts). Please try again")]
    FirstTokenTimeout { attempts: u32 },

    #[error("upstream network error: {0}")]
    UpstreamNetwork(String),

    #[error("upstream returned an unparseable payload: {0}")]
    UpstreamBadPayload(String),

    #[error("upstream error ({status}): {message}")]
    UpstreamStatus { status: u16, message: String },

    #[error("ledger failure: {0}")]
    Ledger(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => StatusCode::UNAUTHORIZED,
            GatewayError::InsufficientCredits(_) => StatusCode::PAYMENT_REQUIRED,
            GatewayError::UnknownModel(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::UpstreamAuth { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::UNAUTHORIZED)
            }
            GatewayError::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UpstreamExhausted { .. }
            | GatewayError::UpstreamNetwork(_)
            | GatewayError::UpstreamBadPayload(_) => StatusCode::BAD_GATEWAY,
            GatewayError::FirstTokenTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Ledger(_) | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn openai_error_type(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => "authentication_error",
            GatewayError::InsufficientCredits(_) => "insufficient_credits",
            GatewayError::UnknownModel(_) | GatewayError::InvalidRequest(_) => {
                "invalid_request_error"
            }
            GatewayError::NotFound => "not_found_error",
            GatewayError::UpstreamRateLimited { .. } => "rate_limit_error",
            _ => "api_error",
        }
    }

    fn anthropic_error_type(&self) -> &'static str {
        match self {
            GatewayError::AuthMissing | GatewayError::AuthInvalid => "authentication_error",
            GatewayError::InsufficientCredits(_) => "insufficient_credits",
            GatewayError::UnknownModel(_) | GatewayError::InvalidRequest(_) => {
                "invalid_request_error"
            }
            GatewayError::NotFound => "not_found_error",
            GatewayError::UpstreamRateLimited { .. } => "rate_limit_error",
            GatewayError::FirstTokenTimeout { .. } => "timeout_error",
            _ => "api_error",
        }
    }

    /// Map token-acquisition failures onto boundary errors. Refresh
    /// failures hidden by rotation never reach here; this is the
    /// all-accounts-failed outcome.
    pub fn from_auth(error: kiro_pool::Error) -> Self {
        match error {
            kiro_pool::Error::Empty => {
                GatewayError::Internal("no upstream accounts configured".into())
            }
            kiro_pool::Error::Auth(kiro_auth::Error::TokenEndpoint { status, body })
                if status == 401 || status == 403 =>
            {
                GatewayError::UpstreamAuth { status, body }
            }
            kiro_pool::Error::Auth(kiro_auth::Error::TokenEndpoint { status, body }) => {
                GatewayError::UpstreamStatus {
                    status: 502,
                    message: format!("token refresh failed with {status}: {body}"),
                }
            }
            kiro_pool::Error::Auth(kiro_auth::Error::Http(message)) => {
                GatewayError::UpstreamNetwork(message)
            }
            kiro_pool::Error::Auth(kiro_auth::Error::CredentialParse(message)) => {
                GatewayError::UpstreamBadPayload(message)
            }
            kiro_pool::Error::Auth(error) => GatewayError::Internal(error.to_string()),
        }
    }
}

impl From<BillingError> for GatewayError {
    fn from(error: BillingError) -> Self {
        match error {
            BillingError::UnknownModel(model) => GatewayError::UnknownModel(model),
            BillingError::InsufficientCredits(message) => {
                GatewayError::InsufficientCredits(message)
            }
            BillingError::Ledger(message) => GatewayError::Ledger(message),
            BillingError::InvalidConfig(message) => GatewayError::Internal(message),
        }
    }
}

impl From<TranslateError> for GatewayError {
    fn from(error: TranslateError) -> Self {
        GatewayError::InvalidRequest(error.0)
    }
}

impl From<LedgerError> for GatewayError {
    fn from(error: LedgerError) -> Self {
        GatewayError::Ledger(error.to_string())
    }
}

/// Which public dialect an endpoint answers in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
}

/// A gateway error bound to a response dialect.
#[derive(Debug)]
pub struct ApiError {
    pub error: GatewayError,
    pub dialect: Dialect,
}

impl ApiError {
    pub fn openai(error: impl Into<GatewayError>) -> Self {
        Self {
            error: error.into(),
            dialect: Dialect::OpenAi,
        }
    }

    pub fn anthropic(error: impl Into<GatewayError>) -> Self {
        Self {
            error: error.into(),
            dialect: Dialect::Anthropic,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.status();
        metrics::counter!("gateway_errors_total").increment(1);
        let body = match self.dialect {
            Dialect::OpenAi => json!({
                "error": {
                    "message": self.error.to_string(),
                    "type": self.error.openai_error_type(),
                    "code": status.as_u16(),
                }
            }),
            Dialect::Anthropic => json!({
                "type": "error",
                "error": {
                    "type": self.error.anthropic_error_type(),
                    "message": self.error.to_string(),
                }
            }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_the_taxonomy() {
        assert_eq!(GatewayError::AuthMissing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::InsufficientCredits("x".into()).status(),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            GatewayError::UnknownModel("m".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::InvalidRequest("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::UpstreamRateLimited { attempts: 3 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::UpstreamExhausted { attempts: 3 }.status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::FirstTokenTimeout { attempts: 3 }.status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            GatewayError::UpstreamNetwork("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Internal("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn upstream_auth_passes_status_through() {
        assert_eq!(
            GatewayError::UpstreamAuth {
                status: 403,
                body: String::new()
            }
            .status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::UpstreamAuth {
                status: 401,
                body: String::new()
            }
            .status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn exhaustion_message_names_attempt_count() {
        let message = GatewayError::UpstreamExhausted { attempts: 3 }.to_string();
        assert!(message.contains('3'));
        let message = GatewayError::FirstTokenTimeout { attempts: 3 }.to_string();
        assert!(message.contains("did not start responding"));
        assert!(message.contains("try again"));
    }

    #[test]
    fn auth_mapping_passes_401_403_through() {
        let mapped = GatewayError::from_auth(kiro_pool::Error::Auth(
            kiro_auth::Error::TokenEndpoint {
                status: 403,
                body: "denied".into(),
            },
        ));
        assert!(matches!(
            mapped,
            GatewayError::UpstreamAuth { status: 403, .. }
        ));

        let mapped = GatewayError::from_auth(kiro_pool::Error::Auth(
            kiro_auth::Error::TokenEndpoint {
                status: 400,
                body: "bad".into(),
            },
        ));
        assert_eq!(mapped.status(), StatusCode::BAD_GATEWAY);
    }
}
