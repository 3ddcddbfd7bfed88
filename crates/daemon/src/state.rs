//! Active test tracking
//!
//! The tracker holds one entry per test from registration until its terminal
//! record has been written. Whoever claims the entry first (runner completion,
//! timeout timer or cancel) owns the terminal transition; later callers get
//! `None` and must not write. A claimed entry keeps its id reserved and keeps
//! serving the terminal record until the owner releases it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use testrig_common::{Error, Result, TestResult, ToolFamily};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Who is finishing a test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finisher {
    Runner,
    Timer,
    Cancel,
}

/// Runtime state of a running test (not persisted)
pub struct ActiveTest {
    pub test_id: String,
    pub family: ToolFamily,
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    /// Progress writes and the terminal write take this in order
    pub write_lock: Arc<tokio::sync::Mutex<()>>,
    /// Latest in-memory view of the record
    pub result: TestResult,
    timer: Option<AbortHandle>,
    finished_by: Option<Finisher>,
}

impl ActiveTest {
    pub fn new(family: ToolFamily, result: TestResult) -> Self {
        Self {
            test_id: result.test_id.clone(),
            family,
            url: result.url.clone(),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
            result,
            timer: None,
            finished_by: None,
        }
    }

    fn is_running(&self) -> bool {
        self.finished_by.is_none()
    }
}

/// What the owner of a terminal transition needs from the entry
pub struct FinishedTest {
    pub test_id: String,
    pub started_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    pub write_lock: Arc<tokio::sync::Mutex<()>>,
    /// In-memory record at the time of the claim
    pub result: TestResult,
}

/// Registry of running tests
#[derive(Clone, Default)]
pub struct TestStateTracker {
    tests: Arc<Mutex<HashMap<String, ActiveTest>>>,
}

impl TestStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a test. Fails with `Conflict` if the id is still tracked, or,
    /// when `unique_target` is set, if the same family is already running
    /// against the URL.
    pub fn try_register(&self, test: ActiveTest, unique_target: bool) -> Result<()> {
        let mut tests = self.tests.lock();
        if let Some(existing) = tests.get(&test.test_id) {
            let state = if existing.is_running() {
                "already running"
            } else {
                "still being finalized"
            };
            return Err(Error::Conflict(format!("test {} is {}", test.test_id, state)));
        }
        if unique_target {
            if let Some(other) = tests
                .values()
                .find(|t| t.is_running() && t.family == test.family && t.url == test.url)
            {
                return Err(Error::Conflict(format!(
                    "a {} run against {} is already in progress ({})",
                    test.family, test.url, other.test_id
                )));
            }
        }
        debug!("Tracking test {} ({})", test.test_id, test.family);
        tests.insert(test.test_id.clone(), test);
        Ok(())
    }

    /// Attach the timeout timer. Returns `false` when the test already finished,
    /// in which case the caller should abort the timer itself.
    pub fn arm_timer(&self, test_id: &str, timer: AbortHandle) -> bool {
        match self.tests.lock().get_mut(test_id) {
            Some(test) if test.is_running() => {
                test.timer = Some(timer);
                true
            }
            _ => false,
        }
    }

    /// Claim the terminal transition. Only the first caller gets the claim.
    /// The timer is aborted unless the timer itself is finishing.
    pub fn finish(&self, test_id: &str, by: Finisher) -> Option<FinishedTest> {
        let mut tests = self.tests.lock();
        let test = tests.get_mut(test_id).filter(|t| t.is_running())?;
        test.finished_by = Some(by);
        if by != Finisher::Timer {
            if let Some(timer) = test.timer.take() {
                timer.abort();
            }
        }
        debug!("Test {} finished by {:?}", test_id, by);
        Some(FinishedTest {
            test_id: test.test_id.clone(),
            started_at: test.started_at,
            cancel: test.cancel.clone(),
            write_lock: test.write_lock.clone(),
            result: test.result.clone(),
        })
    }

    /// Record the terminal state of a claimed test so readers see it
    /// before it reaches the store
    pub fn settle(&self, test_id: &str, result: TestResult) {
        if let Some(test) = self.tests.lock().get_mut(test_id) {
            test.result = result;
        }
    }

    /// Drop a test from the registry, freeing its id
    pub fn release(&self, test_id: &str) {
        if self.tests.lock().remove(test_id).is_some() {
            trace!("Released test {}", test_id);
        }
    }

    /// Apply a change to the in-memory record of a running test
    pub fn update<F>(&self, test_id: &str, change: F) -> Option<TestResult>
    where
        F: FnOnce(&mut TestResult),
    {
        let mut tests = self.tests.lock();
        let test = tests.get_mut(test_id).filter(|t| t.is_running())?;
        change(&mut test.result);
        test.result.touch();
        trace!("Updated in-memory state of {}", test_id);
        Some(test.result.clone())
    }

    /// True while the test runs; a claimed test is no longer active
    pub fn is_active(&self, test_id: &str) -> bool {
        self.tests
            .lock()
            .get(test_id)
            .map(ActiveTest::is_running)
            .unwrap_or(false)
    }

    /// Current in-memory record, including the terminal one until release
    pub fn snapshot(&self, test_id: &str) -> Option<TestResult> {
        self.tests.lock().get(test_id).map(|t| t.result.clone())
    }

    pub fn active_count(&self) -> usize {
        self.tests.lock().values().filter(|t| t.is_running()).count()
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tests
            .lock()
            .values()
            .filter(|t| t.is_running())
            .map(|t| t.test_id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testrig_common::{NewTestResult, TestStatus};

    fn active(test_id: &str, family: ToolFamily, url: &str) -> ActiveTest {
        let result = TestResult::from_new(NewTestResult {
            test_id: Some(test_id.to_string()),
            test_type: family.test_type().to_string(),
            url: url.to_string(),
            name: test_id.to_string(),
            description: None,
            status: TestStatus::Running,
            config: serde_json::Value::Null,
        });
        ActiveTest::new(family, result)
    }

    #[test]
    fn test_conflicts() {
        let tracker = TestStateTracker::new();
        tracker
            .try_register(active("t1", ToolFamily::Lighthouse, "https://a"), true)
            .unwrap();

        let same_id = tracker.try_register(active("t1", ToolFamily::K6, "https://b"), false);
        assert!(matches!(same_id, Err(Error::Conflict(_))));

        let same_target =
            tracker.try_register(active("t2", ToolFamily::Lighthouse, "https://a"), true);
        assert!(matches!(same_target, Err(Error::Conflict(_))));

        // Duplicates allowed when not asked otherwise, and across families
        tracker
            .try_register(active("t3", ToolFamily::Lighthouse, "https://a"), false)
            .unwrap();
        tracker
            .try_register(active("t4", ToolFamily::K6, "https://a"), true)
            .unwrap();
        assert_eq!(tracker.active_ids(), vec!["t1", "t3", "t4"]);
    }

    #[test]
    fn test_first_finisher_wins() {
        let tracker = TestStateTracker::new();
        tracker
            .try_register(active("t1", ToolFamily::K6, "https://a"), false)
            .unwrap();

        assert!(tracker.finish("t1", Finisher::Cancel).is_some());
        assert!(tracker.finish("t1", Finisher::Runner).is_none());
        assert!(tracker.finish("t1", Finisher::Timer).is_none());
        assert!(!tracker.is_active("t1"));
        assert_eq!(tracker.active_count(), 0);
        assert!(tracker.active_ids().is_empty());
    }

    #[test]
    fn test_id_reserved_until_release() {
        let tracker = TestStateTracker::new();
        tracker
            .try_register(active("t1", ToolFamily::Lighthouse, "https://a"), true)
            .unwrap();
        tracker.finish("t1", Finisher::Runner).unwrap();

        let reused = tracker.try_register(active("t1", ToolFamily::Lighthouse, "https://b"), false);
        assert!(matches!(reused, Err(Error::Conflict(msg)) if msg.contains("finalized")));
        // The target is free as soon as the run is over
        tracker
            .try_register(active("t2", ToolFamily::Lighthouse, "https://a"), true)
            .unwrap();

        tracker.release("t1");
        tracker
            .try_register(active("t1", ToolFamily::Lighthouse, "https://b"), false)
            .unwrap();
    }

    #[test]
    fn test_update_only_while_active() {
        let tracker = TestStateTracker::new();
        tracker
            .try_register(active("t1", ToolFamily::K6, "https://a"), false)
            .unwrap();

        let updated = tracker
            .update("t1", |r| r.progress = Some(40))
            .unwrap();
        assert_eq!(updated.progress, Some(40));
        assert_eq!(tracker.snapshot("t1").unwrap().progress, Some(40));

        let claim = tracker.finish("t1", Finisher::Runner).unwrap();
        assert!(tracker.update("t1", |r| r.progress = Some(90)).is_none());
        assert_eq!(tracker.snapshot("t1").unwrap().progress, Some(40));

        let mut terminal = claim.result;
        terminal.status = TestStatus::Completed;
        tracker.settle("t1", terminal);
        assert_eq!(tracker.snapshot("t1").unwrap().status, TestStatus::Completed);

        tracker.release("t1");
        assert!(tracker.snapshot("t1").is_none());
    }

    #[tokio::test]
    async fn test_finish_aborts_timer() {
        let tracker = TestStateTracker::new();
        tracker
            .try_register(active("t1", ToolFamily::K6, "https://a"), false)
            .unwrap();

        let timer = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        assert!(tracker.arm_timer("t1", timer.abort_handle()));
        tracker.finish("t1", Finisher::Runner);

        let joined = timer.await;
        assert!(joined.unwrap_err().is_cancelled());
        assert!(!tracker.arm_timer(
            "t1",
            tokio::spawn(async {}).abort_handle()
        ));
    }
}
