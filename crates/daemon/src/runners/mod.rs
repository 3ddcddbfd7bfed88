//! Tool runners
//!
//! A runner knows how to execute one tool family and how to read what it
//! printed. Lifecycle, timeouts and persistence belong to the coordinator.

pub mod k6;
pub mod lighthouse;
pub mod playwright;

pub use k6::{K6Config, K6Runner, Stage};
pub use lighthouse::{LighthouseConfig, LighthouseRunner};
pub use playwright::{PlaywrightConfig, PlaywrightRunner};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use testrig_common::{ParsedOutput, Result, ToolFamily};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Step/percentage report pushed by a runner while it works
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub step: Option<String>,
    pub percent: Option<u8>,
}

impl ProgressUpdate {
    pub fn step(step: impl Into<String>, percent: u8) -> Self {
        Self {
            step: Some(step.into()),
            percent: Some(percent),
        }
    }
}

/// Handle for sending progress without ever blocking the runner
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressSink {
    pub fn new(tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self { tx }
    }

    /// Queue an update; dropped if the forwarder is behind or gone
    pub fn send(&self, update: ProgressUpdate) {
        if let Err(e) = self.tx.try_send(update) {
            trace!("Progress update dropped: {}", e);
        }
    }

    pub fn step(&self, step: impl Into<String>, percent: u8) {
        self.send(ProgressUpdate::step(step, percent));
    }
}

/// Everything a runner needs for one execution
pub struct RunContext<C> {
    pub test_id: String,
    pub config: C,
    pub cancel: CancellationToken,
    pub progress: ProgressSink,
}

/// What the tool produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    /// Text handed to the parser
    pub raw: String,
    pub stderr: String,
    /// Exit code of a directly spawned tool; `None` for server calls
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    /// Output of a tool server call
    pub fn from_value(value: &Value) -> Self {
        let raw = match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        Self {
            raw,
            ..Default::default()
        }
    }
}

/// Descriptive fields stored with the initial record
#[derive(Debug, Clone, PartialEq)]
pub struct RunDescription {
    pub url: String,
    pub name: String,
    pub description: Option<String>,
}

/// One tool family's execution and output handling
#[async_trait]
pub trait ToolRunner: Send + Sync + 'static {
    type Config: Serialize + DeserializeOwned + Clone + Send + Sync + 'static;

    fn family(&self) -> ToolFamily;

    fn describe(&self, config: &Self::Config) -> RunDescription;

    /// Execute the tool. Must return `Error::Cancelled` promptly once the
    /// context's token is cancelled.
    async fn run(&self, ctx: RunContext<Self::Config>) -> Result<ToolOutput>;

    fn parse(&self, test_id: &str, output: &ToolOutput) -> Result<ParsedOutput>;

    /// Failure the tool reported in its output despite running to completion
    fn detect_failure(&self, output: &ToolOutput) -> Option<String>;
}

/// Escape a value for a single-quoted JavaScript string literal
pub(crate) fn js_string(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_output_from_value() {
        assert_eq!(ToolOutput::from_value(&json!("text")).raw, "text");
        assert_eq!(ToolOutput::from_value(&json!({"a": 1})).raw, r#"{"a":1}"#);
    }

    #[test]
    fn test_js_string() {
        assert_eq!(js_string("it's"), r"it\'s");
        assert_eq!(js_string("a\\b\nc"), r"a\\b\nc");
    }

    #[tokio::test]
    async fn test_progress_sink_never_blocks() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = ProgressSink::new(tx);
        sink.step("one", 10);
        sink.step("two", 20);

        assert_eq!(rx.recv().await, Some(ProgressUpdate::step("one", 10)));
        assert!(rx.try_recv().is_err());
    }
}
