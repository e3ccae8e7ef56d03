//! Proactive background token refresh
//!
//! A periodic task that keeps pooled tokens warm so requests rarely pay
//! on-demand refresh latency. The task observes a shutdown signal and gets
//! a bounded grace period before it is cancelled outright; an in-flight
//! refresh is allowed to finish so a half-refreshed state is never
//! persisted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::manager::AuthManager;

/// Default cycle interval.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// How long shutdown waits for the loop to finish before cancelling it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Handle for stopping the background refresher.
pub struct RefresherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    /// Signal shutdown and wait up to the grace period, then cancel.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await {
            Ok(_) => info!("background token refresh stopped"),
            Err(_) => {
                warn!("background refresh did not stop within grace period, cancelling");
                self.task.abort();
                let _ = self.task.await;
            }
        }
    }
}

/// Spawn the background refresher.
///
/// Every `interval` the task refreshes any pooled token whose cached access
/// token expires within one interval plus 60 seconds, skipping tokens in
/// failure backoff.
pub fn spawn_refresher(manager: Arc<AuthManager>, interval: Duration) -> RefresherHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let threshold = interval + Duration::from_secs(60);
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick: tokens were just loaded
        ticker.tick().await;
        info!(interval_secs = interval.as_secs(), "background token refresh started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    manager.refresh_expiring(threshold).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("background refresh loop ended");
    });

    RefresherHandle {
        shutdown: shutdown_tx,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ManagerConfig;
    use kiro_auth::store::StoreKind;
    use kiro_auth::{CredentialRecord, CredentialStore};

    struct EmptyStore;

    #[async_trait::async_trait]
    impl CredentialStore for EmptyStore {
        fn kind(&self) -> StoreKind {
            StoreKind::Kv
        }

        async fn load_all(&self) -> kiro_auth::Result<Vec<CredentialRecord>> {
            Ok(Vec::new())
        }

        async fn load_by_key(&self, _key: &str) -> kiro_auth::Result<Option<CredentialRecord>> {
            Ok(None)
        }

        async fn save(&self, record: &CredentialRecord) -> kiro_auth::Result<()> {
            Err(kiro_auth::Error::NotFound(record.key.clone()))
        }
    }

    #[tokio::test]
    async fn refresher_shuts_down_within_grace() {
        let manager = Arc::new(
            AuthManager::load(
                Arc::new(EmptyStore),
                reqwest::Client::new(),
                ManagerConfig::default(),
            )
            .await
            .unwrap(),
        );

        let handle = spawn_refresher(manager, Duration::from_secs(300));
        // Must return promptly rather than waiting out the interval
        tokio::time::timeout(Duration::from_secs(6), handle.shutdown())
            .await
            .expect("shutdown must complete within the grace period");
    }

    #[tokio::test]
    async fn refresh_cycle_skips_empty_pool() {
        let manager = AuthManager::load(
            Arc::new(EmptyStore),
            reqwest::Client::new(),
            ManagerConfig::default(),
        )
        .await
        .unwrap();

        // No accounts: the cycle is a no-op and must not panic
        manager.refresh_expiring(Duration::from_secs(360)).await;
    }
}
