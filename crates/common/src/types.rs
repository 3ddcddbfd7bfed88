//! Core types for testrig

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// External tool family orchestrated by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFamily {
    K6,
    Lighthouse,
    Playwright,
}

impl ToolFamily {
    /// Test type label stored alongside results
    pub fn test_type(&self) -> &'static str {
        match self {
            ToolFamily::K6 => "load",
            ToolFamily::Lighthouse => "lighthouse",
            ToolFamily::Playwright => "e2e",
        }
    }
}

impl std::fmt::Display for ToolFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolFamily::K6 => write!(f, "k6"),
            ToolFamily::Lighthouse => write!(f, "lighthouse"),
            ToolFamily::Playwright => write!(f, "playwright"),
        }
    }
}

/// Test execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Failed | TestStatus::Cancelled
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl Default for TestStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Pending => write!(f, "pending"),
            TestStatus::Running => write!(f, "running"),
            TestStatus::Completed => write!(f, "completed"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Metric category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricCategory {
    Timing,
    Rate,
    Count,
    Size,
    Score,
    Gauge,
}

impl std::fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricCategory::Timing => write!(f, "timing"),
            MetricCategory::Rate => write!(f, "rate"),
            MetricCategory::Count => write!(f, "count"),
            MetricCategory::Size => write!(f, "size"),
            MetricCategory::Score => write!(f, "score"),
            MetricCategory::Gauge => write!(f, "gauge"),
        }
    }
}

impl MetricCategory {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "timing" => Some(Self::Timing),
            "rate" => Some(Self::Rate),
            "count" => Some(Self::Count),
            "size" => Some(Self::Size),
            "score" => Some(Self::Score),
            "gauge" => Some(Self::Gauge),
            _ => None,
        }
    }
}

/// A single normalized measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub test_id: String,
    pub category: MetricCategory,
    pub name: String,
    pub value: f64,
    pub unit: String,
    pub description: String,
}

impl MetricRecord {
    pub fn new(
        test_id: &str,
        category: MetricCategory,
        name: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            test_id: test_id.to_string(),
            category,
            name: name.into(),
            value,
            unit: unit.into(),
            description: description.into(),
        }
    }
}

/// Pass/fail tally of a tool's self-reported thresholds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub passed: u32,
    pub failed: u32,
    #[serde(default)]
    pub details: BTreeMap<String, bool>,
}

impl ThresholdResult {
    pub fn is_empty(&self) -> bool {
        self.passed == 0 && self.failed == 0
    }

    /// Record one threshold outcome. A name that fails once stays failed.
    pub fn record(&mut self, name: impl Into<String>, passed: bool) {
        if passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.details
            .entry(name.into())
            .and_modify(|ok| *ok &= passed)
            .or_insert(passed);
    }
}

/// Coarse aggregate attached to a finished run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub duration_secs: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub score: Option<f64>,
    #[serde(default)]
    pub thresholds: ThresholdResult,
}

/// Everything a parser extracts from one tool run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    /// Normalized metric map (tool-specific shape)
    pub metrics: serde_json::Value,
    pub summary: RunSummary,
    pub records: Vec<MetricRecord>,
    /// True when at least one recognized summary marker was found
    pub recognized: bool,
}

/// Request to create the initial stored record of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTestResult {
    pub test_id: Option<String>,
    pub test_type: String,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub status: TestStatus,
    pub config: serde_json::Value,
}

/// Stored result of a test run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    pub test_id: String,
    pub test_type: String,
    pub url: String,
    pub name: String,
    pub description: Option<String>,
    pub status: TestStatus,
    pub current_step: Option<String>,
    pub progress: Option<u8>,
    #[serde(default)]
    pub metrics: serde_json::Value,
    #[serde(default)]
    pub summary: RunSummary,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub raw_output: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TestResult {
    pub fn from_new(new: NewTestResult) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            test_id: new.test_id.unwrap_or_else(new_test_id),
            test_type: new.test_type,
            url: new.url,
            name: new.name,
            description: new.description,
            status: new.status,
            current_step: None,
            progress: None,
            metrics: serde_json::Value::Null,
            summary: RunSummary::default(),
            config: new.config,
            raw_output: String::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Generate a fresh test identifier
pub fn new_test_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminal() {
        assert!(!TestStatus::Pending.is_terminal());
        assert!(!TestStatus::Running.is_terminal());
        assert!(TestStatus::Completed.is_terminal());
        assert!(TestStatus::Failed.is_terminal());
        assert!(TestStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TestStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        assert_eq!(TestStatus::parse("running"), Some(TestStatus::Running));
        assert_eq!(TestStatus::parse("bogus"), None);
    }

    #[test]
    fn test_threshold_failure_sticks() {
        let mut thresholds = ThresholdResult::default();
        thresholds.record("http_req_duration", true);
        thresholds.record("http_req_duration", false);
        thresholds.record("http_req_duration", true);

        assert_eq!(thresholds.passed, 2);
        assert_eq!(thresholds.failed, 1);
        assert_eq!(thresholds.details.get("http_req_duration"), Some(&false));
    }

    #[test]
    fn test_from_new_keeps_supplied_id() {
        let result = TestResult::from_new(NewTestResult {
            test_id: Some("abc".to_string()),
            test_type: ToolFamily::K6.test_type().to_string(),
            url: "https://example.com".to_string(),
            name: "smoke".to_string(),
            description: None,
            status: TestStatus::Pending,
            config: serde_json::json!({}),
        });
        assert_eq!(result.test_id, "abc");
        assert_eq!(result.test_type, "load");
        assert_eq!(result.status, TestStatus::Pending);
    }
}
