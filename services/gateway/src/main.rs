//! Kiro gateway
//!
//! Protocol-translating gateway between OpenAI/Anthropic clients and the
//! Kiro upstream: validates local API keys, manages the upstream
//! credential pool, translates requests and streams, and accounts usage
//! against the credit ledger.

mod anthropic;
mod batches;
mod billing;
mod config;
mod error;
mod ledger;
mod models_cache;
mod openai;
mod routes;
mod state;
mod stream;
mod tokenizer;
mod translate;
mod upstream;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use kiro_auth::{CredentialStore, DocStore, EnvStore, FileStore, KvStore};
use kiro_pool::{AuthManager, ManagerConfig, RefresherHandle, spawn_refresher};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::batches::BatchRegistry;
use crate::billing::PricingIndex;
use crate::config::{ApiKeySource, Config, CredentialSource};
use crate::ledger::Ledger;
use crate::models_cache::ModelsCache;
use crate::state::AppState;
use crate::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting kiro-gateway");

    let config = Config::load().context("failed to load configuration")?;

    let store: Arc<dyn CredentialStore> = match &config.credential_source {
        CredentialSource::File(path) => {
            info!(path = %path.display(), "using file credential store");
            Arc::new(FileStore::new(path.clone()))
        }
        CredentialSource::Kv(path) => {
            info!(path = %path.display(), "using kv credential store");
            Arc::new(KvStore::new(path.clone()))
        }
        CredentialSource::Document(url) => {
            info!(%url, "using document credential store");
            Arc::new(DocStore::new(reqwest::Client::new(), url.clone()))
        }
        CredentialSource::Env => {
            info!("using environment credential store");
            Arc::new(EnvStore::new())
        }
    };

    let auth = Arc::new(
        AuthManager::load(
            store,
            reqwest::Client::new(),
            ManagerConfig {
                region: config.region.clone(),
                refresh_threshold: config.token_refresh_threshold,
                quarantine: config.token_quarantine,
                wire: config.device_oauth_wire,
                issuance_endpoint: config.auth_endpoint.clone(),
            },
        )
        .await
        .context("failed to load upstream credentials")?,
    );

    let refresher: Option<RefresherHandle> = if config.background_refresh {
        Some(spawn_refresher(
            Arc::clone(&auth),
            kiro_pool::refresh::REFRESH_INTERVAL,
        ))
    } else {
        None
    };

    let ledger = match &config.ledger_db {
        Some(path) => Some(Ledger::open(path.clone()).context("failed to open ledger")?),
        None => None,
    };
    if config.api_key_source == ApiKeySource::Ledger {
        info!("client API keys validated against the ledger");
    }

    let pricing =
        PricingIndex::build(config.billing.clone()).context("invalid billing configuration")?;

    let metrics = PrometheusBuilder::new().install_recorder().ok();

    let upstream = UpstreamClient::new(Arc::clone(&auth), config.upstream.clone());
    let listen_addr = config.listen_addr;
    let models_cache_ttl = config.models_cache_ttl;

    let state = Arc::new(AppState {
        config,
        auth,
        upstream,
        pricing,
        ledger,
        models: ModelsCache::new(models_cache_ttl),
        batches: BatchRegistry::new(),
        metrics,
        started_at: Instant::now(),
    });

    let app = routes::router(Arc::clone(&state))
        .layer(tower::limit::GlobalConcurrencyLimitLayer::new(1024));

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(refresher) = refresher {
        refresher.shutdown().await;
    }
    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
