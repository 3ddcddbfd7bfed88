//! Result persistence boundary
//!
//! Coordinators only ever talk to a [`ResultStore`]. Two implementations ship
//! with the crate: [`MemoryStore`] for embedding and tests, and
//! [`crate::db::SqliteStore`] for the daemon.

use crate::{Error, MetricRecord, NewTestResult, Result, TestResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Persistence collaborator for test results and metric rows
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Create the initial record of a run. Generates a test id when none is supplied.
    async fn create_initial_result(&self, new: NewTestResult) -> Result<TestResult>;

    /// Overwrite the stored record with the given state
    async fn update_result(&self, result: &TestResult) -> Result<()>;

    /// Fetch the current record of a run
    async fn get_result_by_test_id(&self, test_id: &str) -> Result<Option<TestResult>>;

    /// Append metric rows. Rows are inserted, never merged.
    async fn save_metrics(&self, records: &[MetricRecord]) -> Result<()>;

    /// All metric rows stored for a run, in insertion order
    async fn metrics_for_test(&self, test_id: &str) -> Result<Vec<MetricRecord>>;
}

/// In-memory result store
#[derive(Clone, Default)]
pub struct MemoryStore {
    results: Arc<Mutex<HashMap<String, TestResult>>>,
    metrics: Arc<Mutex<Vec<MetricRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored results
    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn create_initial_result(&self, new: NewTestResult) -> Result<TestResult> {
        let result = TestResult::from_new(new);
        let previous = self
            .results
            .lock()
            .insert(result.test_id.clone(), result.clone());
        if previous.is_some() {
            debug!("Replaced earlier result for test {}", result.test_id);
        }
        debug!("Created result {} for test {}", result.id, result.test_id);
        Ok(result)
    }

    async fn update_result(&self, result: &TestResult) -> Result<()> {
        let mut results = self.results.lock();
        match results.get_mut(&result.test_id) {
            Some(stored) => {
                *stored = result.clone();
                Ok(())
            }
            None => Err(Error::test_not_found(&result.test_id)),
        }
    }

    async fn get_result_by_test_id(&self, test_id: &str) -> Result<Option<TestResult>> {
        Ok(self.results.lock().get(test_id).cloned())
    }

    async fn save_metrics(&self, records: &[MetricRecord]) -> Result<()> {
        self.metrics.lock().extend_from_slice(records);
        Ok(())
    }

    async fn metrics_for_test(&self, test_id: &str) -> Result<Vec<MetricRecord>> {
        Ok(self
            .metrics
            .lock()
            .iter()
            .filter(|m| m.test_id == test_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MetricCategory, TestStatus};

    fn new_result(test_id: Option<&str>) -> NewTestResult {
        NewTestResult {
            test_id: test_id.map(str::to_string),
            test_type: "load".to_string(),
            url: "https://example.com".to_string(),
            name: "smoke".to_string(),
            description: None,
            status: TestStatus::Pending,
            config: serde_json::json!({"vus": 5}),
        }
    }

    #[tokio::test]
    async fn test_create_and_update() {
        let store = MemoryStore::new();
        let mut result = store.create_initial_result(new_result(None)).await.unwrap();
        assert!(!result.test_id.is_empty());

        result.status = TestStatus::Running;
        result.current_step = Some("warming up".to_string());
        store.update_result(&result).await.unwrap();

        let stored = store
            .get_result_by_test_id(&result.test_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, TestStatus::Running);
        assert_eq!(stored.current_step.as_deref(), Some("warming up"));
    }

    #[tokio::test]
    async fn test_rerun_replaces_record() {
        let store = MemoryStore::new();
        let first = store.create_initial_result(new_result(Some("t1"))).await.unwrap();
        let second = store.create_initial_result(new_result(Some("t1"))).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(store.len(), 1);

        let stored = store.get_result_by_test_id("t1").await.unwrap().unwrap();
        assert_eq!(stored.id, second.id);
    }

    #[tokio::test]
    async fn test_metrics_are_appended() {
        let store = MemoryStore::new();
        let record = MetricRecord::new("t1", MetricCategory::Timing, "avg", 12.0, "ms", "");
        store.save_metrics(&[record.clone()]).await.unwrap();
        store.save_metrics(&[record]).await.unwrap();

        assert_eq!(store.metrics_for_test("t1").await.unwrap().len(), 2);
        assert!(store.metrics_for_test("t2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_unknown_is_not_found() {
        let store = MemoryStore::new();
        let result = TestResult::from_new(new_result(Some("ghost")));
        assert!(matches!(
            store.update_result(&result).await,
            Err(Error::NotFound { .. })
        ));
    }
}
