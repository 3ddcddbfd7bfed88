//! Playwright output parsing
//!
//! Three shapes are understood. Scenario servers answer with a JSON document
//! (`success`, `logs`, `error`, `duration`), possibly nested under `result` /
//! `data`. `--reporter=json` prints a report of nested `suites` with `stats`.
//! Directly spawned scripts print list-reporter text and end with a one-line
//! JSON summary.

use super::{
    apply_rules, compile, data_field, decode_json_payload, field, identity, json_number,
    result_data_field, result_field, tally_thresholds, unwrap_payload, Extracted, LineRule,
    UnitKind, UnwrapStep,
};
use crate::{Error, MetricCategory, MetricRecord, ParsedOutput, Result, RunSummary, ThresholdResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static STEPS: &[UnwrapStep] = &[
    UnwrapStep { name: "raw", project: identity },
    UnwrapStep { name: "result", project: result_field },
    UnwrapStep { name: "data", project: data_field },
    UnwrapStep { name: "result.data", project: result_data_field },
];

fn looks_like_report(value: &Value) -> bool {
    value.get("suites").map(Value::is_array).unwrap_or(false)
        || value.get("stats").map(Value::is_object).unwrap_or(false)
}

fn looks_like_scenario(value: &Value) -> bool {
    value.get("success").map(Value::is_boolean).unwrap_or(false)
        || value.get("logs").map(Value::is_array).unwrap_or(false)
}

fn data_logs(value: &Value) -> Option<&Value> {
    value.get("data")?.get("logs")
}

fn result_data_logs(value: &Value) -> Option<&Value> {
    value.get("result")?.get("data")?.get("logs")
}

fn logs_field(value: &Value) -> Option<&Value> {
    value.get("logs")
}

static LOG_STEPS: &[UnwrapStep] = &[
    UnwrapStep { name: "logs", project: logs_field },
    UnwrapStep { name: "data.logs", project: data_logs },
    UnwrapStep { name: "result.data.logs", project: result_data_logs },
];

static RULES: Lazy<Vec<LineRule>> = Lazy::new(|| {
    [
        LineRule::new(
            "passed",
            r"^\s*\d+ passed\b",
            &[
                ("count", r"(\d+) passed", UnitKind::Number),
                ("duration", r"passed \(([^)]+)\)", UnitKind::Millis),
            ],
        ),
        LineRule::new("failed", r"^\s*\d+ failed\b", &[("count", r"(\d+) failed", UnitKind::Number)]),
        LineRule::new("flaky", r"^\s*\d+ flaky\b", &[("count", r"(\d+) flaky", UnitKind::Number)]),
        LineRule::new("skipped", r"^\s*\d+ skipped\b", &[("count", r"(\d+) skipped", UnitKind::Number)]),
    ]
    .into_iter()
    .flatten()
    .collect()
});

static FAILURE_MARKERS: Lazy<Option<Regex>> = Lazy::new(|| {
    compile(r"(?i)Timeout\s*\d+ms\s*exceeded|ECONNREFUSED|net::ERR|navigation.*timeout")
});

/// Trailing `(1.2s)` duration and leading `N [browser] ›` index on reporter test lines
static TEST_LINE_NOISE: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r"^(?:\d+\s+)?|\s*\([0-9.]+m?s\)\s*$"));

/// Normalized Playwright outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaywrightMetrics {
    pub success: Option<bool>,
    pub passed: u64,
    pub failed: u64,
    pub flaky: u64,
    pub skipped: u64,
    pub steps: Option<u64>,
    pub duration_ms: Option<f64>,
    pub error: Option<String>,
    pub logs: Vec<String>,
}

impl PlaywrightMetrics {
    fn has_outcome(&self) -> bool {
        self.success.is_some() || self.passed + self.failed + self.flaky + self.skipped > 0
    }
}

/// Parse scenario JSON or list-reporter text.
///
/// Only empty input is an error here; text that matches nothing comes back
/// with `recognized == false`.
pub fn parse(test_id: &str, raw: &str) -> Result<ParsedOutput> {
    if raw.trim().is_empty() {
        return Err(Error::OutputDecode("output is empty".to_string()));
    }

    let (metrics, thresholds) = outcome(raw);
    let recognized = metrics.has_outcome() || !thresholds.is_empty();
    let summary = summarize(&metrics, thresholds);

    Ok(ParsedOutput {
        records: records_from(test_id, &metrics),
        metrics: serde_json::to_value(&metrics).unwrap_or_default(),
        summary,
        recognized,
    })
}

enum Document {
    Report(Value),
    Scenario(Value),
}

fn document(raw: &str) -> Option<Document> {
    let decoded = decode_json_payload(raw).ok()?;
    if unwrap_payload(&decoded, STEPS, looks_like_report).is_some() {
        return Some(Document::Report(decoded));
    }
    if unwrap_payload(&decoded, STEPS, looks_like_scenario).is_some() {
        return Some(Document::Scenario(decoded));
    }
    None
}

fn outcome(raw: &str) -> (PlaywrightMetrics, ThresholdResult) {
    match document(raw) {
        Some(Document::Report(decoded)) => from_report(&decoded),
        Some(Document::Scenario(decoded)) => (from_document(&decoded), ThresholdResult::default()),
        None => from_text(raw),
    }
}

/// One test entry of a JSON report, flattened out of its suites
struct ReportedTest {
    name: String,
    status: String,
    error: Option<String>,
    duration_ms: f64,
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn error_message(value: &Value) -> Option<String> {
    value.get("message").and_then(Value::as_str).map(str::to_string)
}

/// Walk nested suites; names read `[project] › file › describe › title`
fn collect_tests(suite: &Value, path: &mut Vec<String>, out: &mut Vec<ReportedTest>) {
    let title = suite.get("title").and_then(Value::as_str).unwrap_or("");
    if !title.is_empty() {
        path.push(title.to_string());
    }

    for spec in array(suite, "specs") {
        let spec_title = spec.get("title").and_then(Value::as_str).unwrap_or("");
        let mut parts = path.clone();
        parts.push(spec_title.to_string());
        let trail = parts.join(" › ");

        for test in array(spec, "tests") {
            let name = match test.get("projectName").and_then(Value::as_str) {
                Some(project) if !project.is_empty() => format!("[{}] › {}", project, trail),
                _ => trail.clone(),
            };
            let results = array(test, "results");
            out.push(ReportedTest {
                name,
                status: test.get("status").and_then(Value::as_str).unwrap_or("").to_string(),
                error: results
                    .iter()
                    .rev()
                    .find_map(|result| result.get("error").and_then(error_message)),
                duration_ms: results
                    .iter()
                    .filter_map(|result| result.get("duration").and_then(json_number))
                    .sum(),
            });
        }
    }

    for child in array(suite, "suites") {
        collect_tests(child, path, out);
    }

    if !title.is_empty() {
        path.pop();
    }
}

fn from_report(decoded: &Value) -> (PlaywrightMetrics, ThresholdResult) {
    let mut metrics = PlaywrightMetrics::default();
    let mut thresholds = ThresholdResult::default();
    let Some((_, report)) = unwrap_payload(decoded, STEPS, looks_like_report) else {
        return (metrics, thresholds);
    };

    let mut tests = Vec::new();
    for suite in array(report, "suites") {
        collect_tests(suite, &mut Vec::new(), &mut tests);
    }

    for test in &tests {
        let glyph = match test.status.as_str() {
            "expected" => {
                metrics.passed += 1;
                "✓"
            }
            "flaky" => {
                metrics.flaky += 1;
                "✓"
            }
            "unexpected" => {
                metrics.failed += 1;
                "✘"
            }
            _ => {
                metrics.skipped += 1;
                "-"
            }
        };
        if glyph != "-" {
            thresholds.record(test.name.as_str(), test.status != "unexpected");
        }
        metrics.logs.push(format!("{} {}", glyph, test.name));
    }
    if !tests.is_empty() {
        metrics.duration_ms = Some(tests.iter().map(|test| test.duration_ms).sum());
    }

    // Totals from `stats` win over the walk; they include tests the walk cannot see
    if let Some(stats) = report.get("stats") {
        let count = |key: &str| stats.get(key).and_then(json_number).map(|n| n as u64);
        metrics.passed = count("expected").unwrap_or(metrics.passed);
        metrics.failed = count("unexpected").unwrap_or(metrics.failed);
        metrics.flaky = count("flaky").unwrap_or(metrics.flaky);
        metrics.skipped = count("skipped").unwrap_or(metrics.skipped);
        metrics.duration_ms = stats.get("duration").and_then(json_number).or(metrics.duration_ms);
    }

    metrics.error = tests
        .iter()
        .filter(|test| test.status == "unexpected")
        .find_map(|test| test.error.as_ref().map(|message| format!("{}: {}", test.name, message)))
        .or_else(|| array(report, "errors").iter().find_map(error_message));

    // A report whose run aborted before any test carries only top-level errors
    if metrics.error.is_some() && !metrics.has_outcome() {
        metrics.success = Some(false);
    }

    (metrics, thresholds)
}

fn from_document(decoded: &Value) -> PlaywrightMetrics {
    let mut metrics = PlaywrightMetrics::default();
    let Some((_, doc)) = unwrap_payload(decoded, STEPS, looks_like_scenario) else {
        return metrics;
    };

    apply_summary(&mut metrics, doc);

    if let Some((_, logs)) = unwrap_payload(decoded, LOG_STEPS, Value::is_array) {
        metrics.logs = logs
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(line) => line.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
    }

    metrics
}

/// Copy `success` / `error` / `steps` / duration fields from a summary object
fn apply_summary(metrics: &mut PlaywrightMetrics, doc: &Value) {
    metrics.success = doc.get("success").and_then(Value::as_bool);
    metrics.error = doc
        .get("error")
        .and_then(|e| e.as_str().map(str::to_string).or_else(|| e.get("message")?.as_str().map(str::to_string)));
    metrics.steps = doc.get("steps").and_then(|steps| match steps {
        Value::Array(items) => Some(items.len() as u64),
        other => json_number(other).map(|n| n as u64),
    });
    metrics.duration_ms = doc
        .get("durationMs")
        .or_else(|| doc.get("duration"))
        .and_then(json_number);
}

fn from_text(raw: &str) -> (PlaywrightMetrics, ThresholdResult) {
    let extracted: Extracted = apply_rules(raw, &RULES);
    let mut metrics = PlaywrightMetrics {
        passed: field(&extracted, "passed", "count") as u64,
        failed: field(&extracted, "failed", "count") as u64,
        flaky: field(&extracted, "flaky", "count") as u64,
        skipped: field(&extracted, "skipped", "count") as u64,
        duration_ms: extracted
            .get("passed")
            .and_then(|fields| fields.get("duration"))
            .copied(),
        ..Default::default()
    };

    // The generated script reports its own outcome on the last JSON line
    let trailer = raw
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(looks_like_scenario);
    if let Some(trailer) = trailer {
        let reporter_duration = metrics.duration_ms;
        apply_summary(&mut metrics, &trailer);
        metrics.duration_ms = metrics.duration_ms.or(reporter_duration);
    }

    metrics.logs = raw
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    let thresholds = tally_thresholds(raw.lines(), |rest| test_name(rest));
    (metrics, thresholds)
}

fn test_name(rest: &str) -> String {
    match TEST_LINE_NOISE.as_ref() {
        Some(re) => re.replace_all(rest, "").trim().to_string(),
        None => rest.trim().to_string(),
    }
}

fn summarize(metrics: &PlaywrightMetrics, thresholds: ThresholdResult) -> RunSummary {
    let counted = metrics.passed + metrics.failed + metrics.flaky;
    let (total, successful, failed) = if counted > 0 {
        (counted, metrics.passed + metrics.flaky, metrics.failed)
    } else {
        match metrics.success {
            Some(true) => (1, 1, 0),
            Some(false) => (1, 0, 1),
            None => (0, 0, 0),
        }
    };

    RunSummary {
        total_operations: total,
        successful_operations: successful,
        failed_operations: failed,
        duration_secs: metrics.duration_ms.unwrap_or(0.0) / 1000.0,
        thresholds,
        ..Default::default()
    }
}

fn records_from(test_id: &str, metrics: &PlaywrightMetrics) -> Vec<MetricRecord> {
    let mut records = Vec::new();
    for (name, value) in [
        ("tests_passed", metrics.passed),
        ("tests_failed", metrics.failed),
        ("tests_flaky", metrics.flaky),
        ("tests_skipped", metrics.skipped),
    ] {
        if value > 0 {
            records.push(MetricRecord::new(test_id, MetricCategory::Count, name, value as f64, "tests", ""));
        }
    }
    if let Some(steps) = metrics.steps {
        records.push(MetricRecord::new(test_id, MetricCategory::Count, "steps", steps as f64, "steps", "Scenario steps executed"));
    }
    if let Some(duration) = metrics.duration_ms {
        records.push(MetricRecord::new(test_id, MetricCategory::Timing, "duration", duration, "ms", "Scenario duration"));
    }
    if let Some(success) = metrics.success {
        records.push(MetricRecord::new(
            test_id,
            MetricCategory::Gauge,
            "success",
            if success { 1.0 } else { 0.0 },
            "bool",
            "Scenario outcome",
        ));
    }
    records
}

/// Failure markers in the output, or an outcome the tool itself reported as failed
pub fn detect_failure(stdout: &str, stderr: &str) -> Option<String> {
    if let Some(re) = FAILURE_MARKERS.as_ref() {
        for text in [stdout, stderr] {
            if let Some(found) = re.find(text) {
                let line = text[found.start()..].lines().next().unwrap_or(found.as_str());
                return Some(format!("browser error: {}", line.trim()));
            }
        }
    }

    let metrics = outcome(stdout).0;

    if metrics.success == Some(false) {
        return Some(
            metrics
                .error
                .unwrap_or_else(|| "scenario reported success=false".to_string()),
        );
    }
    if metrics.failed > 0 {
        return Some(match metrics.error {
            Some(error) => format!("{} test(s) failed: {}", metrics.failed, error),
            None => format!("{} test(s) failed", metrics.failed),
        });
    }
    None
}
