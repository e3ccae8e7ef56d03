//! Billing engine
//!
//! All arithmetic runs in exact decimals; floats never enter this module.
//! Pricing rows are indexed by both the raw lowercase model id and a
//! normalized id, and unknown models follow the configured policy.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;
use tracing::info;

use crate::ledger::Ledger;
use crate::stream::UsageCounters;

/// Billing failures; each maps to a client-visible status at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("model '{0}' has no configured pricing")]
    UnknownModel(String),

    #[error("insufficient credits: {0}")]
    InsufficientCredits(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("invalid pricing configuration: {0}")]
    InvalidConfig(String),
}

/// Behavior when a model has no pricing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownModelPolicy {
    Reject,
    Free,
    #[default]
    Default,
}

impl UnknownModelPolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "reject" => Some(Self::Reject),
            "free" => Some(Self::Free),
            "default" => Some(Self::Default),
            _ => None,
        }
    }
}

/// Pricing for one model: unit prices per million tokens plus a final
/// multiplier.
#[derive(Debug, Clone)]
pub struct ModelPricing {
    pub model_id: String,
    pub input_price_per_mtok: Decimal,
    pub output_price_per_mtok: Decimal,
    pub cache_write_price_per_mtok: Decimal,
    pub cache_hit_price_per_mtok: Decimal,
    pub billing_multiplier: Decimal,
}

impl ModelPricing {
    fn free(model_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            input_price_per_mtok: Decimal::ZERO,
            output_price_per_mtok: Decimal::ZERO,
            cache_write_price_per_mtok: Decimal::ZERO,
            cache_hit_price_per_mtok: Decimal::ZERO,
            billing_multiplier: Decimal::ONE,
        }
    }
}

/// Decimal read from a JSON number or string without passing through
/// binary floating point: the literal text is parsed directly.
pub fn decimal_from_value(value: Option<&Value>, fallback: Decimal) -> Decimal {
    match value {
        Some(Value::Number(number)) => {
            Decimal::from_str(&number.to_string()).unwrap_or(fallback)
        }
        Some(Value::String(text)) => Decimal::from_str(text).unwrap_or(fallback),
        _ => fallback,
    }
}

/// Normalize a model id for pricing lookup: lowercase, with a trailing
/// `-YYYYMMDD` date suffix stripped so dated snapshots share a row.
pub fn normalize_model_id(model_id: &str) -> String {
    let lower = model_id.to_lowercase();
    if let Some(pos) = lower.rfind('-') {
        let suffix = &lower[pos + 1..];
        if suffix.len() == 8 && suffix.chars().all(|c| c.is_ascii_digit()) {
            return lower[..pos].to_string();
        }
    }
    lower
}

/// Billing configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub enabled: bool,
    pub enforce_sufficient_credits: bool,
    pub decimal_places: u32,
    pub unknown_model_policy: UnknownModelPolicy,
    /// Raw rows from BILLING_MODEL_PRICES_JSON
    pub model_prices: Vec<Value>,
    pub default_pricing: ModelPricing,
    /// Whether tokenizer-estimated fallback usage is chargeable
    pub charge_estimated_usage: bool,
}

/// Immutable pricing index built once at startup.
pub struct PricingIndex {
    config: BillingConfig,
    index: HashMap<String, Arc<ModelPricing>>,
}

impl PricingIndex {
    pub fn build(config: BillingConfig) -> Result<Self, BillingError> {
        let mut index = HashMap::new();
        for row in &config.model_prices {
            let model_id = row
                .get("id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    BillingError::InvalidConfig("pricing row without an id".to_string())
                })?;

            let pricing = Arc::new(ModelPricing {
                model_id: model_id.to_string(),
                input_price_per_mtok: decimal_from_value(
                    row.get("input_price_per_mtok"),
                    Decimal::ZERO,
                ),
                output_price_per_mtok: decimal_from_value(
                    row.get("output_price_per_mtok"),
                    Decimal::ZERO,
                ),
                cache_write_price_per_mtok: decimal_from_value(
                    row.get("cache_write_price_per_mtok"),
                    Decimal::ZERO,
                ),
                cache_hit_price_per_mtok: decimal_from_value(
                    row.get("cache_hit_price_per_mtok"),
                    Decimal::ZERO,
                ),
                billing_multiplier: decimal_from_value(
                    row.get("billing_multiplier"),
                    Decimal::ONE,
                ),
            });

            index.insert(model_id.to_lowercase(), Arc::clone(&pricing));
            index.insert(normalize_model_id(model_id), pricing);
        }

        Ok(Self { config, index })
    }

    fn resolve(&self, model_id: &str) -> Result<Arc<ModelPricing>, BillingError> {
        if let Some(pricing) = self
            .index
            .get(&model_id.to_lowercase())
            .or_else(|| self.index.get(&normalize_model_id(model_id)))
        {
            return Ok(Arc::clone(pricing));
        }

        match self.config.unknown_model_policy {
            UnknownModelPolicy::Free => Ok(Arc::new(ModelPricing::free(model_id))),
            UnknownModelPolicy::Reject => Err(BillingError::UnknownModel(model_id.to_string())),
            UnknownModelPolicy::Default => Ok(Arc::new(self.config.default_pricing.clone())),
        }
    }

    fn quantize(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(
            self.config.decimal_places,
            RoundingStrategy::MidpointAwayFromZero,
        )
    }

    /// Charge for a usage record:
    /// `(Σ tokens·price) / 1_000_000 · multiplier`, floored at zero and
    /// quantized half-up to the configured places.
    pub fn charge(&self, model_id: &str, usage: &UsageCounters) -> Result<Decimal, BillingError> {
        if !self.config.enabled {
            return Ok(Decimal::ZERO);
        }
        if usage.estimated && !self.config.charge_estimated_usage {
            return Ok(Decimal::ZERO);
        }

        let pricing = self.resolve(model_id)?;
        let per_million = Decimal::new(1_000_000, 0);

        let subtotal = (Decimal::from(usage.prompt_tokens) * pricing.input_price_per_mtok
            + Decimal::from(usage.completion_tokens) * pricing.output_price_per_mtok
            + Decimal::from(usage.cache_write_tokens) * pricing.cache_write_price_per_mtok
            + Decimal::from(usage.cache_hit_tokens) * pricing.cache_hit_price_per_mtok)
            / per_million;

        let charged = subtotal * pricing.billing_multiplier;
        Ok(self.quantize(charged.max(Decimal::ZERO)))
    }

    /// Preflight estimate from request-side token counts only.
    pub fn preflight_charge(
        &self,
        model_id: &str,
        prompt_tokens: u64,
    ) -> Result<Decimal, BillingError> {
        self.charge(
            model_id,
            &UsageCounters {
                prompt_tokens,
                ..Default::default()
            },
        )
    }

    /// Enforce sufficient credits before contacting upstream.
    pub async fn preflight(
        &self,
        ledger: &Ledger,
        user_id: &str,
        required: Decimal,
    ) -> Result<(), BillingError> {
        if !self.config.enabled || !self.config.enforce_sufficient_credits {
            return Ok(());
        }
        if required <= Decimal::ZERO {
            return Ok(());
        }
        let sufficient = ledger
            .has_sufficient(user_id, required)
            .await
            .map_err(|e| BillingError::Ledger(e.to_string()))?;
        if !sufficient {
            return Err(BillingError::InsufficientCredits(format!(
                "requires at least {required} credits"
            )));
        }
        Ok(())
    }

    /// Compute the charge and atomically deduct it. The decrement is
    /// conditional on the balance covering the charge, so it is never
    /// double-applied and never drives the balance below zero.
    pub async fn deduct(
        &self,
        ledger: &Ledger,
        user_id: &str,
        model_id: &str,
        usage: &UsageCounters,
    ) -> Result<Decimal, BillingError> {
        let charge = self.charge(model_id, usage)?;
        if charge <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        let deducted = ledger
            .deduct(user_id, charge)
            .await
            .map_err(|e| BillingError::Ledger(e.to_string()))?;
        if !deducted {
            return Err(BillingError::InsufficientCredits(format!(
                "deduction of {charge} failed due to insufficient balance"
            )));
        }

        info!(user_id, model_id, %charge, estimated = usage.estimated, "credits deducted");
        Ok(charge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config_with_rows(rows: Vec<Value>) -> BillingConfig {
        BillingConfig {
            enabled: true,
            enforce_sufficient_credits: true,
            decimal_places: 6,
            unknown_model_policy: UnknownModelPolicy::Reject,
            model_prices: rows,
            default_pricing: ModelPricing {
                model_id: "default".into(),
                input_price_per_mtok: Decimal::from_str("3.0").unwrap(),
                output_price_per_mtok: Decimal::from_str("14.0").unwrap(),
                cache_write_price_per_mtok: Decimal::from_str("3.75").unwrap(),
                cache_hit_price_per_mtok: Decimal::from_str("0.3").unwrap(),
                billing_multiplier: Decimal::from_str("1.1").unwrap(),
            },
            charge_estimated_usage: true,
        }
    }

    fn sonnet_row() -> Value {
        json!({
            "id": "claude-sonnet-4-5-20250929",
            "input_price_per_mtok": 3.0,
            "output_price_per_mtok": 14.0,
            "cache_write_price_per_mtok": 3.75,
            "cache_hit_price_per_mtok": 0.3,
            "billing_multiplier": 1.1,
        })
    }

    #[test]
    fn known_model_charge_matches_formula() {
        let index = PricingIndex::build(config_with_rows(vec![sonnet_row()])).unwrap();
        let usage = UsageCounters {
            prompt_tokens: 1000,
            completion_tokens: 500,
            ..Default::default()
        };
        // ((1000*3 + 500*14) / 1_000_000) * 1.1 = 0.011
        let charge = index.charge("claude-sonnet-4-5-20250929", &usage).unwrap();
        assert_eq!(charge, Decimal::from_str("0.011000").unwrap());
    }

    #[test]
    fn cache_counters_contribute() {
        let index = PricingIndex::build(config_with_rows(vec![sonnet_row()])).unwrap();
        let usage = UsageCounters {
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_write_tokens: 1_000_000,
            cache_hit_tokens: 1_000_000,
            estimated: false,
        };
        // (3.75 + 0.3) * 1.1 = 4.455
        let charge = index.charge("claude-sonnet-4-5-20250929", &usage).unwrap();
        assert_eq!(charge, Decimal::from_str("4.455000").unwrap());
    }

    #[test]
    fn lookup_is_case_insensitive_and_date_normalized() {
        let index = PricingIndex::build(config_with_rows(vec![sonnet_row()])).unwrap();
        let usage = UsageCounters {
            prompt_tokens: 1_000_000,
            ..Default::default()
        };
        let exact = index.charge("Claude-Sonnet-4-5-20250929", &usage).unwrap();
        let undated = index.charge("claude-sonnet-4-5", &usage).unwrap();
        assert_eq!(exact, undated);
    }

    #[test]
    fn unknown_model_reject_policy_errors() {
        let index = PricingIndex::build(config_with_rows(vec![])).unwrap();
        let result = index.charge(
            "unknown-model",
            &UsageCounters {
                prompt_tokens: 10,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(BillingError::UnknownModel(_))));
    }

    #[test]
    fn unknown_model_free_policy_returns_zero() {
        let mut config = config_with_rows(vec![]);
        config.unknown_model_policy = UnknownModelPolicy::Free;
        let index = PricingIndex::build(config).unwrap();
        let charge = index
            .charge(
                "unknown-model",
                &UsageCounters {
                    prompt_tokens: 10,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(charge, Decimal::ZERO);
    }

    #[test]
    fn unknown_model_default_policy_uses_default_row() {
        let mut config = config_with_rows(vec![]);
        config.unknown_model_policy = UnknownModelPolicy::Default;
        let index = PricingIndex::build(config).unwrap();
        let charge = index
            .charge(
                "unknown-model",
                &UsageCounters {
                    prompt_tokens: 1000,
                    completion_tokens: 500,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(charge, Decimal::from_str("0.011000").unwrap());
    }

    #[test]
    fn disabled_billing_charges_nothing() {
        let mut config = config_with_rows(vec![sonnet_row()]);
        config.enabled = false;
        let index = PricingIndex::build(config).unwrap();
        let charge = index
            .charge(
                "claude-sonnet-4-5-20250929",
                &UsageCounters {
                    prompt_tokens: 1_000_000,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(charge, Decimal::ZERO);
    }

    #[test]
    fn estimated_usage_is_free_when_configured_off() {
        let mut config = config_with_rows(vec![sonnet_row()]);
        config.charge_estimated_usage = false;
        let index = PricingIndex::build(config).unwrap();
        let usage = UsageCounters {
            prompt_tokens: 1000,
            completion_tokens: 500,
            estimated: true,
            ..Default::default()
        };
        assert_eq!(
            index.charge("claude-sonnet-4-5-20250929", &usage).unwrap(),
            Decimal::ZERO
        );
    }

    #[test]
    fn quantization_rounds_half_up() {
        // One prompt token at 0.5 per mtok lands exactly on the midpoint
        // at six places and must round away from zero
        let rows = vec![json!({
            "id": "m",
            "input_price_per_mtok": 0.5,
            "output_price_per_mtok": 0,
            "cache_write_price_per_mtok": 0,
            "cache_hit_price_per_mtok": 0,
            "billing_multiplier": 1.0,
        })];
        let index = PricingIndex::build(config_with_rows(rows)).unwrap();
        let charge = index
            .charge(
                "m",
                &UsageCounters {
                    prompt_tokens: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(charge, Decimal::from_str("0.000001").unwrap());
    }

    #[test]
    fn decimal_from_value_is_exact() {
        assert_eq!(
            decimal_from_value(Some(&json!(3.0)), Decimal::ZERO),
            Decimal::from_str("3.0").unwrap()
        );
        assert_eq!(
            decimal_from_value(Some(&json!("0.3")), Decimal::ZERO),
            Decimal::from_str("0.3").unwrap()
        );
        assert_eq!(
            decimal_from_value(Some(&json!(null)), Decimal::ONE),
            Decimal::ONE
        );
        assert_eq!(decimal_from_value(None, Decimal::ONE), Decimal::ONE);
    }

    #[test]
    fn normalize_strips_date_suffix_only() {
        assert_eq!(
            normalize_model_id("Claude-Sonnet-4-5-20250929"),
            "claude-sonnet-4-5"
        );
        assert_eq!(normalize_model_id("claude-sonnet-4-5"), "claude-sonnet-4-5");
        assert_eq!(normalize_model_id("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn pricing_row_without_id_is_invalid() {
        let config = config_with_rows(vec![json!({"input_price_per_mtok": 1})]);
        assert!(matches!(
            PricingIndex::build(config),
            Err(BillingError::InvalidConfig(_))
        ));
    }
}
