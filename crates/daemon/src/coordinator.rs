//! Test execution coordinator
//!
//! One coordinator per tool family. `start` records the run, registers it
//! with the tracker and returns at once; the runner works in a spawned task
//! while a forwarder persists its progress and a timer bounds its duration.
//! Runner completion, the timer and `cancel` all race for the terminal
//! transition through [`TestStateTracker::finish`]. The winner settles the
//! terminal record in memory, persists it and only then frees the test id.

use crate::config::ExecutionConfig;
use crate::runners::{ProgressSink, ProgressUpdate, RunContext, ToolOutput, ToolRunner};
use crate::state::{ActiveTest, Finisher, TestStateTracker};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use testrig_common::{
    new_test_id, Error, MetricRecord, NewTestResult, ParsedOutput, Result, ResultStore,
    RunSummary, TestResult, TestStatus,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Default bound on a single run
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

const PROGRESS_CAPACITY: usize = 64;

/// Request to start a run
#[derive(Debug, Clone)]
pub struct StartRequest<C> {
    /// Caller-supplied id; generated when absent
    pub test_id: Option<String>,
    /// Overrides the coordinator's default timeout
    pub timeout: Option<Duration>,
    pub config: C,
}

impl<C> StartRequest<C> {
    pub fn new(config: C) -> Self {
        Self {
            test_id: None,
            timeout: None,
            config,
        }
    }

    pub fn with_test_id(mut self, test_id: impl Into<String>) -> Self {
        self.test_id = Some(test_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Drives runs of one tool family
pub struct Coordinator<R: ToolRunner> {
    runner: Arc<R>,
    store: Arc<dyn ResultStore>,
    tracker: TestStateTracker,
    /// Terminal records the store refused, served in its place
    unsaved: Arc<Mutex<HashMap<String, TestResult>>>,
    default_timeout: Duration,
    reject_duplicate_targets: bool,
}

impl<R: ToolRunner> Clone for Coordinator<R> {
    fn clone(&self) -> Self {
        Self {
            runner: self.runner.clone(),
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            unsaved: self.unsaved.clone(),
            default_timeout: self.default_timeout,
            reject_duplicate_targets: self.reject_duplicate_targets,
        }
    }
}

impl<R: ToolRunner> Coordinator<R> {
    pub fn new(runner: R, store: Arc<dyn ResultStore>) -> Self {
        Self {
            runner: Arc::new(runner),
            store,
            tracker: TestStateTracker::new(),
            unsaved: Arc::new(Mutex::new(HashMap::new())),
            default_timeout: DEFAULT_TIMEOUT,
            reject_duplicate_targets: false,
        }
    }

    /// Apply the execution settings. Duplicate targets are only rejected
    /// when `reject_duplicates` is also requested by the caller.
    pub fn with_execution_config(mut self, config: &ExecutionConfig, reject_duplicates: bool) -> Self {
        self.default_timeout = config.default_timeout();
        self.reject_duplicate_targets = reject_duplicates && config.reject_duplicate_audits;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn reject_duplicate_targets(mut self, reject: bool) -> Self {
        self.reject_duplicate_targets = reject;
        self
    }

    pub fn tracker(&self) -> &TestStateTracker {
        &self.tracker
    }

    /// Start a run and return its `running` record
    pub async fn start(&self, request: StartRequest<R::Config>) -> Result<TestResult> {
        let family = self.runner.family();
        let description = self.runner.describe(&request.config);
        let test_id = request.test_id.unwrap_or_else(new_test_id);
        let timeout = request.timeout.unwrap_or(self.default_timeout);

        let new = NewTestResult {
            test_id: Some(test_id.clone()),
            test_type: family.test_type().to_string(),
            url: description.url,
            name: description.name,
            description: description.description,
            status: TestStatus::Running,
            config: serde_json::to_value(&request.config)?,
        };

        // Register before touching the store so a conflicting start never
        // replaces the record of the run that is already going
        let active = ActiveTest::new(family, TestResult::from_new(new.clone()));
        let cancel = active.cancel.clone();
        let write_lock = active.write_lock.clone();
        self.tracker
            .try_register(active, self.reject_duplicate_targets)?;
        self.unsaved.lock().remove(&test_id);

        let mut record = match self.store.create_initial_result(new).await {
            Ok(record) => record,
            Err(e) => {
                self.tracker.release(&test_id);
                return Err(e);
            }
        };
        record.current_step = Some("Starting".to_string());
        record.progress = Some(0);
        let record = self
            .tracker
            .update(&test_id, |r| *r = record.clone())
            .unwrap_or(record);

        info!("Started {} test {} against {}", family, test_id, record.url);

        let (tx, rx) = mpsc::channel(PROGRESS_CAPACITY);
        tokio::spawn(self.clone().forward_progress(test_id.clone(), write_lock, rx));

        let ctx = RunContext {
            test_id: test_id.clone(),
            config: request.config,
            cancel,
            progress: ProgressSink::new(tx),
        };
        let this = self.clone();
        let id = test_id.clone();
        tokio::spawn(async move {
            let outcome = this.runner.run(ctx).await;
            this.complete(&id, outcome).await;
        });

        let this = self.clone();
        let id = test_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.expire(&id, timeout).await;
        });
        if !self.tracker.arm_timer(&test_id, timer.abort_handle()) {
            // Already finished
            timer.abort();
        }

        Ok(record)
    }

    /// Current record: the in-memory view while tracked, then a terminal
    /// record the store refused, otherwise the stored one
    pub async fn status(&self, test_id: &str) -> Result<TestResult> {
        if let Some(snapshot) = self.tracker.snapshot(test_id) {
            return Ok(snapshot);
        }
        if let Some(unsaved) = self.unsaved.lock().get(test_id) {
            return Ok(unsaved.clone());
        }
        self.store
            .get_result_by_test_id(test_id)
            .await?
            .ok_or_else(|| Error::test_not_found(test_id))
    }

    /// Cancel a run. A finished run keeps its status.
    pub async fn cancel(&self, test_id: &str) -> Result<TestStatus> {
        let Some(active) = self.tracker.finish(test_id, Finisher::Cancel) else {
            let current = self.status(test_id).await?;
            debug!("Cancel of {} ignored, already {}", test_id, current.status);
            return Ok(current.status);
        };

        info!("Cancelling test {}", test_id);
        active.cancel.cancel();

        let _guard = active.write_lock.lock().await;
        let mut result = active.result;
        result.status = TestStatus::Cancelled;
        result.current_step = Some("Cancelled".to_string());
        result.summary.started_at = Some(active.started_at);
        result.summary.finished_at = Some(Utc::now());
        self.settle(result, &[]).await;
        Ok(TestStatus::Cancelled)
    }

    /// Cancel every active run
    pub async fn cancel_all(&self) {
        for test_id in self.tracker.active_ids() {
            if let Err(e) = self.cancel(&test_id).await {
                warn!("Failed to cancel {}: {}", test_id, e);
            }
        }
    }

    /// Poll until the run reaches a terminal status
    pub async fn wait(&self, test_id: &str, poll: Duration) -> Result<TestResult> {
        loop {
            let result = self.status(test_id).await?;
            if result.status.is_terminal() {
                return Ok(result);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn forward_progress(
        self,
        test_id: String,
        write_lock: Arc<tokio::sync::Mutex<()>>,
        mut rx: mpsc::Receiver<ProgressUpdate>,
    ) {
        while let Some(update) = rx.recv().await {
            let _guard = write_lock.lock().await;
            let snapshot = self.tracker.update(&test_id, |r| {
                if let Some(step) = update.step {
                    r.current_step = Some(step);
                }
                if let Some(percent) = update.percent {
                    r.progress = Some(r.progress.map_or(percent, |p| p.max(percent)));
                }
            });
            let Some(snapshot) = snapshot else {
                debug!("Dropping progress for finished test {}", test_id);
                break;
            };
            if let Err(e) = self.store.update_result(&snapshot).await {
                warn!("Failed to persist progress of {}: {}", test_id, e);
            }
        }
    }

    async fn complete(&self, test_id: &str, outcome: Result<ToolOutput>) {
        let Some(active) = self.tracker.finish(test_id, Finisher::Runner) else {
            debug!("Test {} already finished, discarding runner outcome", test_id);
            return;
        };

        let _guard = active.write_lock.lock().await;
        let mut result = active.result;
        result.summary.started_at = Some(active.started_at);

        let records = match outcome {
            Ok(output) => self.judge(test_id, output, &mut result),
            Err(Error::Cancelled) => {
                result.status = TestStatus::Cancelled;
                result.current_step = Some("Cancelled".to_string());
                Vec::new()
            }
            Err(e) => {
                warn!("Test {} failed: {}", test_id, e);
                fail(&mut result, e);
                Vec::new()
            }
        };

        if result.summary.finished_at.is_none() {
            result.summary.finished_at = Some(Utc::now());
        }
        if result.summary.duration_secs == 0.0 {
            result.summary.duration_secs = (Utc::now() - active.started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64();
        }

        info!("Test {} {}", test_id, result.status);
        self.settle(result, &records).await;
    }

    /// Decide the terminal status of a run whose tool finished
    fn judge(&self, test_id: &str, output: ToolOutput, result: &mut TestResult) -> Vec<MetricRecord> {
        let parsed = self.runner.parse(test_id, &output);
        let failure = self.runner.detect_failure(&output);
        result.raw_output = output.raw;

        if let Some(reason) = failure {
            warn!("Test {} reported failure: {}", test_id, reason);
            fail(result, Error::ToolReportedFailure(reason));
            return parsed.map(|p| attach(result, p)).unwrap_or_default();
        }

        if let Some(code) = output.exit_code.filter(|code| *code != 0) {
            fail(
                result,
                Error::ProcessExit {
                    code: Some(code),
                    stderr: output.stderr.trim().to_string(),
                },
            );
            return parsed.map(|p| attach(result, p)).unwrap_or_default();
        }

        match parsed {
            Ok(p) if p.recognized => {
                let records = attach(result, p);
                result.status = TestStatus::Completed;
                result.progress = Some(100);
                result.current_step = Some("Completed".to_string());
                records
            }
            Ok(_) => {
                fail(
                    result,
                    Error::OutputDecode("no recognizable metrics in tool output".to_string()),
                );
                Vec::new()
            }
            Err(e) => {
                fail(result, e);
                Vec::new()
            }
        }
    }

    async fn expire(&self, test_id: &str, timeout: Duration) {
        let Some(active) = self.tracker.finish(test_id, Finisher::Timer) else {
            return;
        };

        warn!("Test {} timed out after {:?}", test_id, timeout);
        active.cancel.cancel();

        let _guard = active.write_lock.lock().await;
        let mut result = active.result;
        fail(
            &mut result,
            Error::TestTimeout {
                millis: timeout.as_millis() as u64,
            },
        );
        result.summary.started_at = Some(active.started_at);
        result.summary.finished_at = Some(Utc::now());
        self.settle(result, &[]).await;
    }

    /// Publish the terminal record in memory, persist it, then free the id.
    /// A record the store refuses stays readable through `status`.
    async fn settle(&self, mut result: TestResult, records: &[MetricRecord]) {
        result.touch();
        let test_id = result.test_id.clone();
        self.tracker.settle(&test_id, result.clone());

        if !self.persist(&result, records).await {
            self.unsaved.lock().insert(test_id.clone(), result);
        }
        self.tracker.release(&test_id);
    }

    /// Write the terminal record and metric rows, retrying each once.
    /// Returns whether the record itself was stored.
    async fn persist(&self, result: &TestResult, records: &[MetricRecord]) -> bool {
        let mut stored = true;
        if let Err(first) = self.store.update_result(result).await {
            warn!("Failed to persist {}, retrying: {}", result.test_id, first);
            if let Err(e) = self.store.update_result(result).await {
                error!("Failed to persist {} ({}): {}", result.test_id, result.status, e);
                stored = false;
            }
        }

        if records.is_empty() {
            return stored;
        }
        if let Err(first) = self.store.save_metrics(records).await {
            warn!("Failed to save metrics of {}, retrying: {}", result.test_id, first);
            if let Err(e) = self.store.save_metrics(records).await {
                error!("Failed to save {} metric rows of {}: {}", records.len(), result.test_id, e);
            }
        }
        stored
    }
}

fn fail(result: &mut TestResult, error: Error) {
    result.status = TestStatus::Failed;
    result.current_step = Some("Failed".to_string());
    result.error = Some(error.to_string());
}

/// Copy parsed metrics onto the record and hand back the metric rows.
/// Timestamps the parser left empty keep the coordinator's values.
fn attach(result: &mut TestResult, parsed: ParsedOutput) -> Vec<MetricRecord> {
    let mut summary: RunSummary = parsed.summary;
    summary.started_at = summary.started_at.or(result.summary.started_at);
    summary.finished_at = summary.finished_at.or(result.summary.finished_at);
    result.metrics = parsed.metrics;
    result.summary = summary;
    parsed.records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runners::RunDescription;
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use testrig_common::{MemoryStore, ToolFamily};

    /// What the scripted runner should do
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Script {
        url: String,
        delay_ms: u64,
        stdout: String,
        exit_code: Option<i32>,
    }

    impl Script {
        fn new(stdout: &str) -> Self {
            Self {
                url: "https://example.com".to_string(),
                delay_ms: 0,
                stdout: stdout.to_string(),
                exit_code: Some(0),
            }
        }
    }

    /// Runner that answers from its config; `OK` lines count as recognized
    struct Scripted;

    #[async_trait]
    impl ToolRunner for Scripted {
        type Config = Script;

        fn family(&self) -> ToolFamily {
            ToolFamily::K6
        }

        fn describe(&self, config: &Script) -> RunDescription {
            RunDescription {
                url: config.url.clone(),
                name: "scripted".to_string(),
                description: None,
            }
        }

        async fn run(&self, ctx: RunContext<Script>) -> Result<ToolOutput> {
            ctx.progress.step("Working", 50);
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(ctx.config.delay_ms)) => {}
            }
            Ok(ToolOutput {
                raw: ctx.config.stdout.clone(),
                stderr: String::new(),
                exit_code: ctx.config.exit_code,
            })
        }

        fn parse(&self, test_id: &str, output: &ToolOutput) -> Result<ParsedOutput> {
            let recognized = output.raw.contains("OK");
            Ok(ParsedOutput {
                recognized,
                records: if recognized {
                    vec![MetricRecord::new(
                        test_id,
                        testrig_common::MetricCategory::Count,
                        "ok",
                        1.0,
                        "count",
                        "ok lines",
                    )]
                } else {
                    Vec::new()
                },
                ..Default::default()
            })
        }

        fn detect_failure(&self, output: &ToolOutput) -> Option<String> {
            output.raw.contains("BOOM").then(|| "boom".to_string())
        }
    }

    /// Store whose terminal writes fail a set number of times and can be held shut
    #[derive(Clone, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failures: Arc<AtomicUsize>,
        gate: Arc<tokio::sync::Mutex<()>>,
    }

    impl FlakyStore {
        fn failing(times: usize) -> Self {
            let store = Self::default();
            store.failures.store(times, Ordering::SeqCst);
            store
        }
    }

    #[async_trait]
    impl ResultStore for FlakyStore {
        async fn create_initial_result(&self, new: NewTestResult) -> Result<TestResult> {
            self.inner.create_initial_result(new).await
        }

        async fn update_result(&self, result: &TestResult) -> Result<()> {
            if result.status.is_terminal() {
                let _open = self.gate.lock().await;
                let failing = self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(Error::Internal("disk full".to_string()));
                }
            }
            self.inner.update_result(result).await
        }

        async fn get_result_by_test_id(&self, test_id: &str) -> Result<Option<TestResult>> {
            self.inner.get_result_by_test_id(test_id).await
        }

        async fn save_metrics(&self, records: &[MetricRecord]) -> Result<()> {
            self.inner.save_metrics(records).await
        }

        async fn metrics_for_test(&self, test_id: &str) -> Result<Vec<MetricRecord>> {
            self.inner.metrics_for_test(test_id).await
        }
    }

    async fn stored_status(store: &FlakyStore, id: &str) -> TestStatus {
        store
            .get_result_by_test_id(id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    fn coordinator(store: &MemoryStore) -> Coordinator<Scripted> {
        Coordinator::new(Scripted, Arc::new(store.clone()))
    }

    async fn finished(coord: &Coordinator<Scripted>, id: &str) -> TestResult {
        tokio::time::timeout(
            Duration::from_secs(5),
            coord.wait(id, Duration::from_millis(10)),
        )
        .await
        .unwrap()
        .unwrap()
    }

    #[tokio::test]
    async fn test_completes_and_saves_metrics() {
        let store = MemoryStore::new();
        let coord = coordinator(&store);

        let started = coord
            .start(StartRequest::new(Script::new("all OK")).with_test_id("t1"))
            .await
            .unwrap();
        assert_eq!(started.status, TestStatus::Running);

        let result = finished(&coord, "t1").await;
        assert_eq!(result.status, TestStatus::Completed);
        assert_eq!(result.progress, Some(100));
        assert_eq!(result.raw_output, "all OK");
        assert!(result.summary.finished_at.is_some());
        assert_eq!(store.metrics_for_test("t1").await.unwrap().len(), 1);
        assert_eq!(coord.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_classification() {
        let store = MemoryStore::new();
        let coord = coordinator(&store);

        let mut nonzero = Script::new("OK");
        nonzero.exit_code = Some(2);
        let cases = [
            ("marker", Script::new("OK BOOM"), "Tool reported failure: boom"),
            ("exit", nonzero, "Process exited with code Some(2)"),
            ("silent", Script::new("nothing here"), "no recognizable metrics"),
        ];

        for (id, script, expected) in cases {
            coord
                .start(StartRequest::new(script).with_test_id(id))
                .await
                .unwrap();
            let result = finished(&coord, id).await;
            assert_eq!(result.status, TestStatus::Failed, "{}", id);
            assert!(
                result.error.as_deref().unwrap_or("").contains(expected),
                "{}: {:?}",
                id,
                result.error
            );
        }
        // Metrics of a run that reported failure are still kept
        assert_eq!(store.metrics_for_test("marker").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflicting_start() {
        let store = MemoryStore::new();
        let coord = coordinator(&store).reject_duplicate_targets(true);

        let mut slow = Script::new("OK");
        slow.delay_ms = 5_000;
        coord
            .start(StartRequest::new(slow.clone()).with_test_id("t1"))
            .await
            .unwrap();

        let same_id = coord
            .start(StartRequest::new(slow.clone()).with_test_id("t1"))
            .await;
        assert!(matches!(same_id, Err(Error::Conflict(_))));
        let same_target = coord
            .start(StartRequest::new(slow).with_test_id("t2"))
            .await;
        assert!(matches!(same_target, Err(Error::Conflict(_))));
        assert!(matches!(
            coord.status("t2").await,
            Err(Error::NotFound { .. })
        ));

        coord.cancel_all().await;
    }

    #[tokio::test]
    async fn test_cancel_wins_and_sticks() {
        let store = MemoryStore::new();
        let coord = coordinator(&store);

        let mut slow = Script::new("OK");
        slow.delay_ms = 5_000;
        coord
            .start(StartRequest::new(slow).with_test_id("t1"))
            .await
            .unwrap();

        assert_eq!(coord.cancel("t1").await.unwrap(), TestStatus::Cancelled);
        // The runner observes the token and tries to finish too
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = coord.status("t1").await.unwrap();
        assert_eq!(result.status, TestStatus::Cancelled);
        assert_eq!(coord.cancel("t1").await.unwrap(), TestStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_completion_keeps_status() {
        let store = MemoryStore::new();
        let coord = coordinator(&store);
        coord
            .start(StartRequest::new(Script::new("OK")).with_test_id("t1"))
            .await
            .unwrap();
        finished(&coord, "t1").await;

        assert_eq!(coord.cancel("t1").await.unwrap(), TestStatus::Completed);
        assert!(matches!(
            coord.cancel("missing").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let store = MemoryStore::new();
        let coord = coordinator(&store);

        let mut slow = Script::new("OK");
        slow.delay_ms = 5_000;
        let begun = std::time::Instant::now();
        coord
            .start(
                StartRequest::new(slow)
                    .with_test_id("t1")
                    .with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        let result = finished(&coord, "t1").await;
        let elapsed = begun.elapsed();
        assert_eq!(result.status, TestStatus::Failed);
        assert_eq!(
            result.error.as_deref(),
            Some("test exceeded maximum duration of 100 ms")
        );
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(250), "{:?}", elapsed);
    }

    #[tokio::test]
    async fn test_timer_disarmed_on_completion() {
        let store = MemoryStore::new();
        let coord = coordinator(&store);
        coord
            .start(
                StartRequest::new(Script::new("OK"))
                    .with_test_id("t1")
                    .with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        finished(&coord, "t1").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            coord.status("t1").await.unwrap().status,
            TestStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_rerun_replaces_record() {
        let store = MemoryStore::new();
        let coord = coordinator(&store);

        coord
            .start(StartRequest::new(Script::new("nothing")).with_test_id("t1"))
            .await
            .unwrap();
        assert_eq!(finished(&coord, "t1").await.status, TestStatus::Failed);

        coord
            .start(StartRequest::new(Script::new("OK")).with_test_id("t1"))
            .await
            .unwrap();
        let result = finished(&coord, "t1").await;
        assert_eq!(result.status, TestStatus::Completed);
        assert!(result.error.is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_refused_terminal_write_keeps_final_status() {
        let store = FlakyStore::failing(usize::MAX);
        let coord = Coordinator::new(Scripted, Arc::new(store.clone()));

        coord
            .start(StartRequest::new(Script::new("all OK")).with_test_id("t1"))
            .await
            .unwrap();

        let result = finished(&coord, "t1").await;
        assert_eq!(result.status, TestStatus::Completed);
        assert_eq!(coord.tracker().active_count(), 0);
        assert_eq!(stored_status(&store, "t1").await, TestStatus::Running);
        assert_eq!(coord.cancel("t1").await.unwrap(), TestStatus::Completed);

        // A rerun that persists replaces the in-memory fallback
        store.failures.store(0, Ordering::SeqCst);
        coord
            .start(StartRequest::new(Script::new("OK again")).with_test_id("t1"))
            .await
            .unwrap();
        let rerun = finished(&coord, "t1").await;
        assert_eq!(rerun.raw_output, "OK again");
        assert_eq!(stored_status(&store, "t1").await, TestStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_write_retried_once() {
        let store = FlakyStore::failing(1);
        let coord = Coordinator::new(Scripted, Arc::new(store.clone()));

        coord
            .start(StartRequest::new(Script::new("OK")).with_test_id("t1"))
            .await
            .unwrap();
        finished(&coord, "t1").await;

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while stored_status(&store, "t1").await != TestStatus::Completed
            && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored_status(&store, "t1").await, TestStatus::Completed);
        assert_eq!(store.failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_id_held_until_terminal_write_lands() {
        let store = FlakyStore::default();
        let coord = Coordinator::new(Scripted, Arc::new(store.clone()));
        let held = store.gate.lock().await;

        coord
            .start(StartRequest::new(Script::new("first OK")).with_test_id("t1"))
            .await
            .unwrap();
        // The final status is visible while the store write is still pending
        assert_eq!(finished(&coord, "t1").await.status, TestStatus::Completed);
        assert_eq!(stored_status(&store, "t1").await, TestStatus::Running);

        let reused = coord
            .start(StartRequest::new(Script::new("second OK")).with_test_id("t1"))
            .await;
        assert!(matches!(reused, Err(Error::Conflict(_))));

        drop(held);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            match coord
                .start(StartRequest::new(Script::new("second OK")).with_test_id("t1"))
                .await
            {
                Ok(_) => break,
                Err(Error::Conflict(_)) if std::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(e) => panic!("rerun never started: {}", e),
            }
        }

        let rerun = finished(&coord, "t1").await;
        assert_eq!(rerun.raw_output, "second OK");
        let stored = store.get_result_by_test_id("t1").await.unwrap().unwrap();
        assert_eq!(stored.raw_output, "second OK");
    }
}
