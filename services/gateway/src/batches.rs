//! In-process message batch registry
//!
//! Batches run as background tasks executing each item as a non-streaming
//! completion. The registry tracks status and counts; results accumulate
//! in a shared buffer the NDJSON results endpoint drains while the task is
//! still running.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::anthropic::BatchRequestItem;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RequestCounts {
    pub processing: u64,
    pub succeeded: u64,
    pub errored: u64,
    pub canceled: u64,
    pub expired: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub created_at: String,
    pub processing_status: String,
    pub request_counts: RequestCounts,
    pub results_url: String,
}

struct BatchEntry {
    status: BatchStatus,
    results: Arc<Mutex<Vec<Value>>>,
    cancel: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// Handle given to a batch runner task.
pub struct BatchWork {
    pub id: String,
    pub items: Vec<BatchRequestItem>,
    pub cancel: Arc<AtomicBool>,
    pub results: Arc<Mutex<Vec<Value>>>,
    /// User the batch bills against
    pub user_id: Option<String>,
}

/// Registry of all known batches.
#[derive(Default)]
pub struct BatchRegistry {
    entries: Mutex<HashMap<String, BatchEntry>>,
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new batch, returning the work handle for its runner.
    pub async fn create(
        &self,
        base_url: &str,
        items: Vec<BatchRequestItem>,
        user_id: Option<String>,
    ) -> (BatchStatus, BatchWork) {
        let id = format!("msgbatch_{}", Uuid::new_v4().simple());
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let status = BatchStatus {
            id: id.clone(),
            kind: "message_batch",
            created_at,
            processing_status: "in_progress".to_string(),
            request_counts: RequestCounts {
                processing: items.len() as u64,
                ..Default::default()
            },
            results_url: format!("{base_url}/v1/messages/batches/{id}/results"),
        };

        let results = Arc::new(Mutex::new(Vec::new()));
        let cancel = Arc::new(AtomicBool::new(false));
        let entry = BatchEntry {
            status: status.clone(),
            results: Arc::clone(&results),
            cancel: Arc::clone(&cancel),
            task: None,
        };
        self.entries.lock().await.insert(id.clone(), entry);

        let work = BatchWork {
            id,
            items,
            cancel,
            results,
            user_id,
        };
        (status, work)
    }

    /// Attach the runner task so deletion can abort it.
    pub async fn attach_task(&self, id: &str, task: JoinHandle<()>) {
        if let Some(entry) = self.entries.lock().await.get_mut(id) {
            entry.task = Some(task);
        }
    }

    pub async fn snapshot(&self, id: &str) -> Option<BatchStatus> {
        self.entries
            .lock()
            .await
            .get(id)
            .map(|entry| entry.status.clone())
    }

    pub async fn list(&self) -> Vec<BatchStatus> {
        self.entries
            .lock()
            .await
            .values()
            .map(|entry| entry.status.clone())
            .collect()
    }

    /// Record one finished item.
    pub async fn record_result(&self, id: &str, result: Value, succeeded: bool) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        entry.results.lock().await.push(result);
        let counts = &mut entry.status.request_counts;
        counts.processing = counts.processing.saturating_sub(1);
        if succeeded {
            counts.succeeded += 1;
        } else {
            counts.errored += 1;
        }
    }

    /// Mark the batch ended unless it was canceled first.
    pub async fn finish(&self, id: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(id)
            && entry.status.processing_status != "canceled"
        {
            entry.status.processing_status = "ended".to_string();
        }
    }

    /// Cancel a batch; already-finished batches are returned unchanged.
    pub async fn cancel(&self, id: &str) -> Option<BatchStatus> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(id)?;
        if entry.status.processing_status == "in_progress" {
            entry.cancel.store(true, Ordering::Relaxed);
            entry.status.processing_status = "canceled".to_string();
            let counts = &mut entry.status.request_counts;
            counts.canceled = counts.processing;
            counts.processing = 0;
        }
        Some(entry.status.clone())
    }

    /// Remove a batch, aborting its runner if still alive.
    pub async fn delete(&self, id: &str) -> bool {
        let Some(entry) = self.entries.lock().await.remove(id) else {
            return false;
        };
        if let Some(task) = entry.task {
            task.abort();
        }
        true
    }

    /// Results buffer plus a finished flag for the NDJSON endpoint.
    pub async fn results_handle(&self, id: &str) -> Option<Arc<Mutex<Vec<Value>>>> {
        self.entries
            .lock()
            .await
            .get(id)
            .map(|entry| Arc::clone(&entry.results))
    }

    pub async fn is_finished(&self, id: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(id)
            .map(|entry| entry.status.processing_status != "in_progress")
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(custom_id: &str) -> BatchRequestItem {
        BatchRequestItem {
            custom_id: custom_id.into(),
            params: json!({"model": "m"}),
        }
    }

    #[tokio::test]
    async fn create_registers_in_progress_batch() {
        let registry = BatchRegistry::new();
        let (status, work) = registry
            .create("http://localhost:8000", vec![item("a"), item("b")], None)
            .await;

        assert!(status.id.starts_with("msgbatch_"));
        assert_eq!(status.processing_status, "in_progress");
        assert_eq!(status.request_counts.processing, 2);
        assert!(status.results_url.ends_with(&format!(
            "/v1/messages/batches/{}/results",
            work.id
        )));
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn record_result_moves_counts() {
        let registry = BatchRegistry::new();
        let (status, _work) = registry
            .create("http://x", vec![item("a"), item("b")], None)
            .await;

        registry
            .record_result(&status.id, json!({"custom_id": "a"}), true)
            .await;
        registry
            .record_result(&status.id, json!({"custom_id": "b"}), false)
            .await;
        registry.finish(&status.id).await;

        let snapshot = registry.snapshot(&status.id).await.unwrap();
        assert_eq!(snapshot.request_counts.succeeded, 1);
        assert_eq!(snapshot.request_counts.errored, 1);
        assert_eq!(snapshot.request_counts.processing, 0);
        assert_eq!(snapshot.processing_status, "ended");
        assert!(registry.is_finished(&status.id).await);

        let results = registry.results_handle(&status.id).await.unwrap();
        assert_eq!(results.lock().await.len(), 2);
    }

    #[tokio::test]
    async fn cancel_sets_flag_and_counts() {
        let registry = BatchRegistry::new();
        let (status, work) = registry.create("http://x", vec![item("a")], None).await;

        let canceled = registry.cancel(&status.id).await.unwrap();
        assert_eq!(canceled.processing_status, "canceled");
        assert_eq!(canceled.request_counts.canceled, 1);
        assert!(work.cancel.load(Ordering::Relaxed));

        // Finishing after cancel keeps the canceled status
        registry.finish(&status.id).await;
        let snapshot = registry.snapshot(&status.id).await.unwrap();
        assert_eq!(snapshot.processing_status, "canceled");
    }

    #[tokio::test]
    async fn cancel_after_end_is_a_noop() {
        let registry = BatchRegistry::new();
        let (status, _work) = registry.create("http://x", vec![item("a")], None).await;
        registry
            .record_result(&status.id, json!({"custom_id": "a"}), true)
            .await;
        registry.finish(&status.id).await;

        let result = registry.cancel(&status.id).await.unwrap();
        assert_eq!(result.processing_status, "ended");
    }

    #[tokio::test]
    async fn delete_removes_batch() {
        let registry = BatchRegistry::new();
        let (status, _work) = registry.create("http://x", vec![item("a")], None).await;
        assert!(registry.delete(&status.id).await);
        assert!(!registry.delete(&status.id).await);
        assert!(registry.snapshot(&status.id).await.is_none());
    }

    #[tokio::test]
    async fn unknown_batch_is_finished() {
        let registry = BatchRegistry::new();
        assert!(registry.is_finished("msgbatch_missing").await);
        assert!(registry.results_handle("msgbatch_missing").await.is_none());
    }
}
