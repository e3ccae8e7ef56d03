//! Configuration from process environment
//!
//! Every knob is an environment variable. Missing required values and
//! malformed numbers are collected into configuration errors surfaced at
//! startup, which exits non-zero.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use common::{Error, Result, Secret};
use kiro_auth::DeviceOauthWire;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::billing::{BillingConfig, ModelPricing, UnknownModelPolicy, decimal_from_value};
use crate::upstream::UpstreamConfig;

/// Where client API keys are validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiKeySource {
    /// Compare against the configured key
    Static,
    /// Look up users in the credit ledger
    Ledger,
}

/// Which credential store backend to use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    File(PathBuf),
    Kv(PathBuf),
    Document(String),
    Env,
}

/// Fully-validated gateway configuration.
pub struct Config {
    pub listen_addr: SocketAddr,
    pub api_key: Secret<String>,
    pub api_key_source: ApiKeySource,
    pub credential_source: CredentialSource,
    pub region: String,
    pub device_oauth_wire: DeviceOauthWire,
    /// Overrides the region-derived token issuance endpoint
    pub auth_endpoint: Option<String>,
    pub token_refresh_threshold: Duration,
    pub token_quarantine: Duration,
    pub background_refresh: bool,
    pub upstream: UpstreamConfig,
    pub billing: BillingConfig,
    pub ledger_db: Option<PathBuf>,
    pub models_cache_ttl: Duration,
}

fn env(name: &str) -> Option<String> {
    std::env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env(name).unwrap_or_else(|| default.to_string())
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match env(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| Error::InvalidEnv {
            name: name.to_string(),
            reason: format!("{raw:?} is not a number"),
        }),
    }
}

fn env_f64_secs(name: &str, default: f64) -> Result<Duration> {
    let raw = match env(name) {
        None => return Ok(Duration::from_secs_f64(default)),
        Some(raw) => raw,
    };
    let value: f64 = raw.parse().map_err(|_| Error::InvalidEnv {
        name: name.to_string(),
        reason: format!("{raw:?} is not a number"),
    })?;
    if value <= 0.0 {
        return Err(Error::InvalidEnv {
            name: name.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(Duration::from_secs_f64(value))
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env(name).as_deref() {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") | Some("on") => Ok(true),
        Some("0") | Some("false") | Some("no") | Some("off") => Ok(false),
        Some(raw) => Err(Error::InvalidEnv {
            name: name.to_string(),
            reason: format!("{raw:?} is not a boolean"),
        }),
    }
}

impl Config {
    /// Load and validate the full configuration from the environment.
    pub fn load() -> Result<Self> {
        let api_key = env("GATEWAY_API_KEY")
            .or_else(|| env("PROXY_API_KEY"))
            .ok_or_else(|| Error::MissingEnv("GATEWAY_API_KEY".to_string()))?;

        let listen_addr: SocketAddr = env_or("GATEWAY_LISTEN_ADDR", "0.0.0.0:8000")
            .parse()
            .map_err(|e| Error::InvalidEnv {
                name: "GATEWAY_LISTEN_ADDR".to_string(),
                reason: format!("{e}"),
            })?;

        let credential_source = Self::resolve_credential_source()?;

        let device_oauth_wire = match env("DEVICE_OAUTH_WIRE") {
            None => DeviceOauthWire::default(),
            Some(raw) => DeviceOauthWire::parse(&raw).ok_or_else(|| Error::InvalidEnv {
                name: "DEVICE_OAUTH_WIRE".to_string(),
                reason: format!("{raw:?} is not one of: json, form"),
            })?,
        };

        let api_key_source = match env_or("API_KEY_SOURCE", "static").as_str() {
            "static" => ApiKeySource::Static,
            "ledger" => ApiKeySource::Ledger,
            raw => {
                return Err(Error::InvalidEnv {
                    name: "API_KEY_SOURCE".to_string(),
                    reason: format!("{raw:?} is not one of: static, ledger"),
                });
            }
        };

        let billing = Self::load_billing()?;
        let ledger_db = env("LEDGER_DB").map(PathBuf::from);

        if (billing.enabled || api_key_source == ApiKeySource::Ledger) && ledger_db.is_none() {
            return Err(Error::Config(
                "LEDGER_DB is required when billing is enabled or API_KEY_SOURCE=ledger".into(),
            ));
        }

        Ok(Self {
            listen_addr,
            api_key: Secret::new(api_key),
            api_key_source,
            credential_source,
            region: env_or("KIRO_REGION", "us-east-1"),
            device_oauth_wire,
            auth_endpoint: env("KIRO_AUTH_ENDPOINT"),
            token_refresh_threshold: Duration::from_secs(env_u64(
                "TOKEN_REFRESH_THRESHOLD",
                600,
            )?),
            token_quarantine: Duration::from_secs(env_u64("TOKEN_QUARANTINE_SECONDS", 60)?),
            background_refresh: env_bool("BACKGROUND_REFRESH", true)?,
            upstream: UpstreamConfig {
                request_timeout: env_f64_secs("REQUEST_TIMEOUT_SECONDS", 300.0)?,
                max_retries: env_u64("MAX_RETRIES", 3)? as u32,
                base_retry_delay: env_f64_secs("BASE_RETRY_DELAY", 1.0)?,
                first_token_timeout: env_f64_secs("FIRST_TOKEN_TIMEOUT", 15.0)?,
                first_token_max_retries: env_u64("FIRST_TOKEN_MAX_RETRIES", 3)? as u32,
                streaming_read_timeout: env_f64_secs("STREAMING_READ_TIMEOUT", 300.0)?,
            },
            billing,
            ledger_db,
            models_cache_ttl: Duration::from_secs(env_u64("MODELS_CACHE_TTL", 300)?),
        })
    }

    fn resolve_credential_source() -> Result<CredentialSource> {
        let file = env("KIRO_CREDS_FILE").map(PathBuf::from);
        let kv = env("KIRO_KV_DB").map(PathBuf::from);
        let document = env("DOCUMENT_STORE_URL");
        let env_token = env("KIRO_REFRESH_TOKEN");

        match env_or("CREDENTIAL_SOURCE", "auto").as_str() {
            "file" => file.map(CredentialSource::File).ok_or_else(|| {
                Error::MissingEnv("KIRO_CREDS_FILE".to_string())
            }),
            "kv" => kv
                .map(CredentialSource::Kv)
                .ok_or_else(|| Error::MissingEnv("KIRO_KV_DB".to_string())),
            "document" => document
                .map(CredentialSource::Document)
                .ok_or_else(|| Error::MissingEnv("DOCUMENT_STORE_URL".to_string())),
            "env" => env_token
                .map(|_| CredentialSource::Env)
                .ok_or_else(|| Error::MissingEnv("KIRO_REFRESH_TOKEN".to_string())),
            "auto" => {
                if let Some(path) = file {
                    Ok(CredentialSource::File(path))
                } else if let Some(path) = kv {
                    Ok(CredentialSource::Kv(path))
                } else if let Some(url) = document {
                    Ok(CredentialSource::Document(url))
                } else if env_token.is_some() {
                    Ok(CredentialSource::Env)
                } else {
                    Err(Error::Config(
                        "no credential source configured: set KIRO_CREDS_FILE, KIRO_KV_DB, DOCUMENT_STORE_URL, or KIRO_REFRESH_TOKEN".into(),
                    ))
                }
            }
            raw => Err(Error::InvalidEnv {
                name: "CREDENTIAL_SOURCE".to_string(),
                reason: format!("{raw:?} is not one of: auto, file, kv, document, env"),
            }),
        }
    }

    fn load_billing() -> Result<BillingConfig> {
        let model_prices: Vec<Value> = match env("BILLING_MODEL_PRICES_JSON") {
            None => Vec::new(),
            Some(raw) => serde_json::from_str(&raw).map_err(|e| Error::InvalidEnv {
                name: "BILLING_MODEL_PRICES_JSON".to_string(),
                reason: format!("{e}"),
            })?,
        };

        let unknown_model_policy = {
            let raw = env_or("BILLING_UNKNOWN_MODEL_POLICY", "default");
            UnknownModelPolicy::parse(&raw).ok_or_else(|| Error::InvalidEnv {
                name: "BILLING_UNKNOWN_MODEL_POLICY".to_string(),
                reason: format!("{raw:?} is not one of: reject, free, default"),
            })?
        };

        let default_price = |name: &str, fallback: &str| -> Decimal {
            decimal_from_value(
                env(name).map(Value::String).as_ref(),
                decimal_from_value(Some(&Value::String(fallback.to_string())), Decimal::ZERO),
            )
        };

        Ok(BillingConfig {
            enabled: env_bool("BILLING_ENABLED", false)?,
            enforce_sufficient_credits: env_bool("BILLING_ENFORCE_SUFFICIENT_CREDITS", false)?,
            decimal_places: env_u64("BILLING_DECIMAL_PLACES", 6)? as u32,
            unknown_model_policy,
            model_prices,
            default_pricing: ModelPricing {
                model_id: "default".to_string(),
                input_price_per_mtok: default_price("BILLING_DEFAULT_INPUT_PRICE_PER_MTOK", "3.0"),
                output_price_per_mtok: default_price(
                    "BILLING_DEFAULT_OUTPUT_PRICE_PER_MTOK",
                    "14.0",
                ),
                cache_write_price_per_mtok: default_price(
                    "BILLING_DEFAULT_CACHE_WRITE_PRICE_PER_MTOK",
                    "3.75",
                ),
                cache_hit_price_per_mtok: default_price(
                    "BILLING_DEFAULT_CACHE_HIT_PRICE_PER_MTOK",
                    "0.3",
                ),
                billing_multiplier: default_price("BILLING_DEFAULT_MULTIPLIER", "1.0"),
            },
            charge_estimated_usage: env_bool("BILLING_CHARGE_ESTIMATED_USAGE", true)?,
        })
    }
}
