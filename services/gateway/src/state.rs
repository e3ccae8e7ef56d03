//! Shared application state

use std::sync::Arc;
use std::time::Instant;

use kiro_pool::AuthManager;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::batches::BatchRegistry;
use crate::billing::PricingIndex;
use crate::config::Config;
use crate::ledger::Ledger;
use crate::models_cache::ModelsCache;
use crate::upstream::UpstreamClient;

/// Everything the handlers need, created once at startup and threaded
/// through the router as `Arc<AppState>`.
pub struct AppState {
    pub config: Config,
    pub auth: Arc<AuthManager>,
    pub upstream: UpstreamClient,
    pub pricing: PricingIndex,
    pub ledger: Option<Ledger>,
    pub models: ModelsCache,
    pub batches: BatchRegistry,
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}
