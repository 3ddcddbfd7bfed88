//! k6 end-of-test summary parsing
//!
//! Understands the classic text summary (`http_req_duration....: avg=...`),
//! the sectioned summary introduced with `█ THRESHOLDS` / `█ TOTAL RESULTS`,
//! and JSON summaries from `--summary-export` or a `handleSummary` hook.

use super::{
    apply_rules, compile, data_field, decode_json_payload, field, glyph_outcome, identity,
    json_number, result_data_field, result_field, tally_thresholds, unwrap_payload, Extracted,
    LineRule, UnitKind, UnwrapStep,
};
use crate::{MetricCategory, MetricRecord, ParsedOutput, RunSummary, ThresholdResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Trend statistics, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendStats {
    pub avg: f64,
    pub min: f64,
    pub med: f64,
    pub max: f64,
    pub p90: f64,
    pub p95: f64,
}

/// Counter with its per-second rate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterStats {
    pub count: f64,
    pub rate: f64,
}

/// Rate metric: share of `true` samples plus the raw counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateStats {
    pub percent: f64,
    pub hits: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GaugeStats {
    pub value: f64,
    pub min: f64,
    pub max: f64,
}

/// Transferred volume in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DataStats {
    pub bytes: f64,
    pub bytes_per_sec: f64,
}

/// Normalized k6 metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct K6Metrics {
    pub http_req_duration: TrendStats,
    pub http_req_waiting: TrendStats,
    pub iteration_duration: TrendStats,
    pub http_reqs: CounterStats,
    pub iterations: CounterStats,
    pub http_req_failed: RateStats,
    pub checks: RateStats,
    pub vus: GaugeStats,
    pub vus_max: GaugeStats,
    pub data_received: DataStats,
    pub data_sent: DataStats,
    pub run_duration_ms: f64,
}

fn metric_line(name: &str) -> String {
    format!(r"^\s*(?:[✓✗]\s*)?{}\.*:\s", name)
}

const TREND_FIELDS: &[(&str, &str, UnitKind)] = &[
    ("avg", r"\bavg=(\S+)", UnitKind::Millis),
    ("min", r"\bmin=(\S+)", UnitKind::Millis),
    ("med", r"\bmed=(\S+)", UnitKind::Millis),
    ("max", r"\bmax=(\S+)", UnitKind::Millis),
    ("p90", r"\bp\(90\)=(\S+)", UnitKind::Millis),
    ("p95", r"\bp\(95\)=(\S+)", UnitKind::Millis),
];

fn trend_rule(metric: &'static str) -> Option<LineRule> {
    LineRule::new(metric, &metric_line(metric), TREND_FIELDS)
}

fn counter_rule(metric: &'static str) -> Option<LineRule> {
    LineRule::new(
        metric,
        &metric_line(metric),
        &[
            ("count", r":\s+([0-9][0-9,.]*)\s", UnitKind::Number),
            ("rate", r"([0-9][0-9,.]*)/s", UnitKind::Number),
        ],
    )
}

fn rate_rule(metric: &'static str, line: &str) -> Option<LineRule> {
    LineRule::new(
        metric,
        &metric_line(line),
        &[
            ("percent", r":\s+([0-9.]+)%", UnitKind::Percent),
            ("hits", r"([0-9]+)\s+out\s+of", UnitKind::Number),
            ("total", r"out\s+of\s+([0-9]+)", UnitKind::Number),
            ("hits", r"✓\s*([0-9]+)", UnitKind::Number),
            ("misses", r"✗\s*([0-9]+)", UnitKind::Number),
        ],
    )
}

fn gauge_rule(metric: &'static str) -> Option<LineRule> {
    LineRule::new(
        metric,
        &metric_line(metric),
        &[
            ("value", r":\s+([0-9]+)", UnitKind::Number),
            ("min", r"\bmin=([0-9]+)", UnitKind::Number),
            ("max", r"\bmax=([0-9]+)", UnitKind::Number),
        ],
    )
}

fn data_rule(metric: &'static str) -> Option<LineRule> {
    LineRule::new(
        metric,
        &metric_line(metric),
        &[
            ("bytes", r":\s+([0-9.,]+\s*[kKMGT]?i?B)\b", UnitKind::Bytes),
            ("bytes_per_sec", r"([0-9.,]+\s*[kKMGT]?i?B/s)", UnitKind::Bytes),
        ],
    )
}

static RULES: Lazy<Vec<LineRule>> = Lazy::new(|| {
    [
        trend_rule("http_req_duration"),
        trend_rule("http_req_waiting"),
        trend_rule("iteration_duration"),
        counter_rule("http_reqs"),
        counter_rule("iterations"),
        rate_rule("http_req_failed", "http_req_failed"),
        rate_rule("checks", "checks"),
        rate_rule("checks", "checks_succeeded"),
        gauge_rule("vus"),
        gauge_rule("vus_max"),
        data_rule("data_received"),
        data_rule("data_sent"),
        LineRule::new(
            RUN_METRIC,
            r"^\s*running\s+\(",
            &[("duration", r"running\s+\(([0-9hms.]+)\)", UnitKind::Millis)],
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
});

/// Pseudo-metric for the `running (...)` progress line; not a summary marker
const RUN_METRIC: &str = "run";

/// Parse a k6 summary, JSON or text.
///
/// `recognized` is set when at least one summary metric was found; the
/// `running (...)` progress line alone does not count.
pub fn parse(test_id: &str, output: &str) -> ParsedOutput {
    let (extracted, thresholds) = match json_summary(output) {
        Some(found) => found,
        None => (apply_rules(output, &RULES), parse_thresholds(output)),
    };
    let metrics = metrics_from(&extracted);
    let recognized = extracted.keys().any(|metric| *metric != RUN_METRIC);

    let total = metrics.http_reqs.count;
    let failed = if metrics.http_req_failed.total > 0.0 {
        metrics.http_req_failed.hits
    } else {
        (total * metrics.http_req_failed.percent / 100.0).round()
    };

    let summary = RunSummary {
        total_operations: total as u64,
        successful_operations: (total - failed).max(0.0) as u64,
        failed_operations: failed as u64,
        duration_secs: metrics.run_duration_ms / 1000.0,
        thresholds,
        ..Default::default()
    };

    ParsedOutput {
        metrics: serde_json::to_value(&metrics).unwrap_or_default(),
        records: records_from(test_id, &extracted, &metrics),
        summary,
        recognized,
    }
}

/// Parse a bare trend fragment such as `avg=120ms min=10ms max=900ms p(95)=450ms`
pub fn parse_trend(fragment: &str) -> TrendStats {
    let rules: Vec<LineRule> = LineRule::new("trend", r"^", TREND_FIELDS).into_iter().collect();
    trend_from(&apply_rules(fragment, &rules), "trend")
}

fn trend_from(extracted: &Extracted, metric: &str) -> TrendStats {
    TrendStats {
        avg: field(extracted, metric, "avg"),
        min: field(extracted, metric, "min"),
        med: field(extracted, metric, "med"),
        max: field(extracted, metric, "max"),
        p90: field(extracted, metric, "p90"),
        p95: field(extracted, metric, "p95"),
    }
}

fn rate_from(extracted: &Extracted, metric: &str) -> RateStats {
    let hits = field(extracted, metric, "hits");
    let total = match field(extracted, metric, "total") {
        t if t > 0.0 => t,
        _ => hits + field(extracted, metric, "misses"),
    };
    RateStats {
        percent: field(extracted, metric, "percent"),
        hits,
        total,
    }
}

fn metrics_from(extracted: &Extracted) -> K6Metrics {
    K6Metrics {
        http_req_duration: trend_from(extracted, "http_req_duration"),
        http_req_waiting: trend_from(extracted, "http_req_waiting"),
        iteration_duration: trend_from(extracted, "iteration_duration"),
        http_reqs: CounterStats {
            count: field(extracted, "http_reqs", "count"),
            rate: field(extracted, "http_reqs", "rate"),
        },
        iterations: CounterStats {
            count: field(extracted, "iterations", "count"),
            rate: field(extracted, "iterations", "rate"),
        },
        http_req_failed: rate_from(extracted, "http_req_failed"),
        checks: rate_from(extracted, "checks"),
        vus: GaugeStats {
            value: field(extracted, "vus", "value"),
            min: field(extracted, "vus", "min"),
            max: field(extracted, "vus", "max"),
        },
        vus_max: GaugeStats {
            value: field(extracted, "vus_max", "value"),
            min: field(extracted, "vus_max", "min"),
            max: field(extracted, "vus_max", "max"),
        },
        data_received: DataStats {
            bytes: field(extracted, "data_received", "bytes"),
            bytes_per_sec: field(extracted, "data_received", "bytes_per_sec"),
        },
        data_sent: DataStats {
            bytes: field(extracted, "data_sent", "bytes"),
            bytes_per_sec: field(extracted, "data_sent", "bytes_per_sec"),
        },
        run_duration_ms: field(extracted, RUN_METRIC, "duration"),
    }
}

fn records_from(test_id: &str, extracted: &Extracted, metrics: &K6Metrics) -> Vec<MetricRecord> {
    let mut records = Vec::new();
    let mut push = |category, name: &str, value: f64, unit: &str, description: &str| {
        records.push(MetricRecord::new(test_id, category, name, value, unit, description));
    };

    let trends = [
        ("http_req_duration", "HTTP request duration", &metrics.http_req_duration),
        ("http_req_waiting", "Time to first byte", &metrics.http_req_waiting),
        ("iteration_duration", "Iteration duration", &metrics.iteration_duration),
    ];
    for (metric, label, stats) in trends {
        if !extracted.contains_key(metric) {
            continue;
        }
        for (stat, value) in [
            ("avg", stats.avg),
            ("min", stats.min),
            ("med", stats.med),
            ("max", stats.max),
            ("p90", stats.p90),
            ("p95", stats.p95),
        ] {
            push(
                MetricCategory::Timing,
                &format!("{}_{}", metric, stat),
                value,
                "ms",
                &format!("{} ({})", label, stat),
            );
        }
    }

    for (metric, label, stats) in [
        ("http_reqs", "HTTP requests", &metrics.http_reqs),
        ("iterations", "Iterations", &metrics.iterations),
    ] {
        if extracted.contains_key(metric) {
            push(MetricCategory::Count, metric, stats.count, "count", label);
            push(
                MetricCategory::Rate,
                &format!("{}_rate", metric),
                stats.rate,
                "per_second",
                &format!("{} per second", label),
            );
        }
    }

    for (metric, label, stats) in [
        ("http_req_failed", "Failed HTTP requests", &metrics.http_req_failed),
        ("checks", "Passed checks", &metrics.checks),
    ] {
        if extracted.contains_key(metric) {
            push(MetricCategory::Rate, metric, stats.percent, "percent", label);
        }
    }

    for (metric, label, stats) in [
        ("vus", "Virtual users", &metrics.vus),
        ("vus_max", "Maximum virtual users", &metrics.vus_max),
    ] {
        if extracted.contains_key(metric) {
            push(MetricCategory::Gauge, metric, stats.value, "vus", label);
        }
    }

    for (metric, label, stats) in [
        ("data_received", "Data received", &metrics.data_received),
        ("data_sent", "Data sent", &metrics.data_sent),
    ] {
        if extracted.contains_key(metric) {
            push(MetricCategory::Size, metric, stats.bytes, "bytes", label);
            push(
                MetricCategory::Rate,
                &format!("{}_rate", metric),
                stats.bytes_per_sec,
                "bytes_per_second",
                &format!("{} per second", label),
            );
        }
    }

    if extracted.contains_key(RUN_METRIC) {
        push(
            MetricCategory::Timing,
            "test_duration",
            metrics.run_duration_ms,
            "ms",
            "Wall-clock test duration",
        );
    }

    records
}

// ============================================================================
// JSON summaries
// ============================================================================

static SUMMARY_STEPS: &[UnwrapStep] = &[
    UnwrapStep { name: "raw", project: identity },
    UnwrapStep { name: "result", project: result_field },
    UnwrapStep { name: "data", project: data_field },
    UnwrapStep { name: "result.data", project: result_data_field },
];

fn looks_like_summary(value: &Value) -> bool {
    value.get("metrics").map(Value::is_object).unwrap_or(false)
}

#[derive(Debug, Clone, Copy)]
enum JsonKind {
    Trend,
    Counter,
    Rate,
    Gauge,
    Data,
}

const JSON_METRICS: &[(&str, JsonKind)] = &[
    ("http_req_duration", JsonKind::Trend),
    ("http_req_waiting", JsonKind::Trend),
    ("iteration_duration", JsonKind::Trend),
    ("http_reqs", JsonKind::Counter),
    ("iterations", JsonKind::Counter),
    ("http_req_failed", JsonKind::Rate),
    ("checks", JsonKind::Rate),
    ("vus", JsonKind::Gauge),
    ("vus_max", JsonKind::Gauge),
    ("data_received", JsonKind::Data),
    ("data_sent", JsonKind::Data),
];

const TREND_KEYS: &[(&str, &str)] = &[
    ("avg", "avg"),
    ("min", "min"),
    ("med", "med"),
    ("max", "max"),
    ("p90", "p(90)"),
    ("p95", "p(95)"),
];

/// Decode a JSON summary into the same shape the text rules produce
fn json_summary(output: &str) -> Option<(Extracted, ThresholdResult)> {
    let decoded = decode_json_payload(output).ok()?;
    let (_, summary) = unwrap_payload(&decoded, SUMMARY_STEPS, looks_like_summary)?;
    let metrics = summary.get("metrics")?;

    let mut extracted = Extracted::new();
    for &(metric, kind) in JSON_METRICS {
        let Some(node) = metrics.get(metric) else {
            continue;
        };
        // handleSummary nests the numbers under `values`
        let values = node.get("values").unwrap_or(node);
        let fields = json_fields(kind, values);
        if !fields.is_empty() {
            extracted.insert(metric, fields);
        }
    }

    let duration = summary
        .get("state")
        .and_then(|state| state.get("testRunDurationMs"))
        .and_then(json_number);
    if let Some(duration) = duration {
        extracted.insert(RUN_METRIC, BTreeMap::from([("duration", duration)]));
    }

    Some((extracted, json_thresholds(metrics)))
}

fn json_fields(kind: JsonKind, values: &Value) -> BTreeMap<&'static str, f64> {
    let get = |key: &str| values.get(key).and_then(json_number);
    let mut fields = BTreeMap::new();
    let mut put = |field: &'static str, value: Option<f64>| {
        if let Some(value) = value {
            fields.insert(field, value);
        }
    };

    match kind {
        JsonKind::Trend => {
            for &(field, key) in TREND_KEYS {
                put(field, get(key));
            }
        }
        JsonKind::Counter => {
            put("count", get("count"));
            put("rate", get("rate"));
        }
        JsonKind::Rate => {
            let ratio = get("value").or_else(|| get("rate"));
            put("percent", ratio.map(|r| r * 100.0));
            put("hits", get("passes"));
            put("misses", get("fails"));
        }
        JsonKind::Gauge => {
            put("value", get("value"));
            put("min", get("min"));
            put("max", get("max"));
        }
        JsonKind::Data => {
            put("bytes", get("count"));
            put("bytes_per_sec", get("rate"));
        }
    }
    fields
}

/// Threshold states keyed by metric.
///
/// `--summary-export` maps each condition to whether it was crossed;
/// `handleSummary` data maps it to `{"ok": bool}`.
fn json_thresholds(metrics: &Value) -> ThresholdResult {
    let mut result = ThresholdResult::default();
    let Some(metrics) = metrics.as_object() else {
        return result;
    };
    for (metric, node) in metrics {
        let Some(conditions) = node.get("thresholds").and_then(Value::as_object) else {
            continue;
        };
        for state in conditions.values() {
            let passed = match state {
                Value::Bool(crossed) => !crossed,
                other => other.get("ok").and_then(Value::as_bool).unwrap_or(true),
            };
            result.record(metric.as_str(), passed);
        }
    }
    result
}

// ============================================================================
// Thresholds
// ============================================================================

static SECTION_HEADER: Lazy<Option<Regex>> = Lazy::new(|| compile(r"^\s*█\s+(\S.*?)\s*$"));

static LEGACY_THRESHOLD: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r"^\s*[✓✗]\s+([A-Za-z_][\w{}:,\s-]*?)\.{2,}:"));

/// Tally the thresholds section.
///
/// Sectioned output: glyph lines inside `█ THRESHOLDS`, keyed by the most
/// recent metric header line. Classic output: glyph-prefixed metric lines.
pub fn parse_thresholds(output: &str) -> ThresholdResult {
    if let Some(section) = thresholds_section(output) {
        let mut metric: Option<&str> = None;
        let mut result = ThresholdResult::default();
        for line in section {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match glyph_outcome(trimmed) {
                Some((passed, rest)) => {
                    let name = metric.unwrap_or_else(|| condition_name(rest));
                    result.record(name, passed);
                }
                None => metric = Some(trimmed),
            }
        }
        return result;
    }

    let Some(re) = LEGACY_THRESHOLD.as_ref() else {
        return ThresholdResult::default();
    };
    let metric_lines = output.lines().filter(|line| re.is_match(line));
    tally_thresholds(metric_lines, |rest| {
        rest.split(|c: char| c == '.' || c == ':')
            .next()
            .unwrap_or(rest)
            .trim()
            .to_string()
    })
}

fn thresholds_section(output: &str) -> Option<Vec<&str>> {
    let header = SECTION_HEADER.as_ref()?;
    let mut lines = output.lines();
    lines.by_ref().find(|line| {
        header
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().eq_ignore_ascii_case("THRESHOLDS"))
            .unwrap_or(false)
    })?;
    Some(lines.take_while(|line| !header.is_match(line)).collect())
}

fn condition_name(rest: &str) -> &str {
    rest.split_whitespace()
        .next()
        .unwrap_or(rest)
        .trim_matches('\'')
}

// ============================================================================
// Failure markers and progress
// ============================================================================

const NETWORK_MARKERS: &[&str] = &[
    "Error executing k6 test:",
    "Request Failed",
    "connection refused",
    "connectex: A connection attempt failed",
];

const THRESHOLD_MARKERS: &[&str] = &["thresholds on metrics", "level=error"];

/// Look for tool-reported failure markers in stdout and stderr
pub fn detect_failure(stdout: &str, stderr: &str) -> Option<String> {
    let lines = || stdout.lines().chain(stderr.lines());

    if let Some(line) = lines().find(|line| NETWORK_MARKERS.iter().any(|m| line.contains(m))) {
        return Some(format!("network error: {}", clip(line.trim())));
    }
    if let Some(line) = lines().find(|line| THRESHOLD_MARKERS.iter().any(|m| line.contains(m))) {
        return Some(format!("threshold violation: {}", clip(line.trim())));
    }
    None
}

fn clip(line: &str) -> &str {
    match line.char_indices().nth(300) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Incremental progress derived from one output line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub percent: Option<u8>,
    pub step: Option<String>,
}

/// Progress stays below this until the run is actually finished
pub const PROGRESS_CAP: u8 = 95;

const SUMMARY_MARKERS: &[&str] = &["THRESHOLDS", "TOTAL RESULTS", "checks", "http_req_duration", "default ✓"];

static PERCENT: Lazy<Option<Regex>> = Lazy::new(|| compile(r"\[\s*(\d+)%\s*\]"));
static ELAPSED: Lazy<Option<Regex>> = Lazy::new(|| compile(r"(\d+(?:\.\d+)?)s/(\d+(?:\.\d+)?)s"));
static VUS: Lazy<Option<Regex>> = Lazy::new(|| compile(r"(\d+)/(\d+)\s+VUs"));

/// Derive progress from a live output line, if it carries any
pub fn parse_progress(line: &str) -> Option<Progress> {
    let mut percent = PERCENT
        .as_ref()
        .and_then(|re| re.captures(line))
        .and_then(|caps| caps.get(1)?.as_str().parse::<u32>().ok());

    if percent.is_none() {
        percent = ELAPSED
            .as_ref()
            .and_then(|re| re.captures(line))
            .and_then(|caps| {
                let elapsed: f64 = caps.get(1)?.as_str().parse().ok()?;
                let total: f64 = caps.get(2)?.as_str().parse().ok()?;
                (total > 0.0).then(|| (elapsed / total * 100.0) as u32)
            });
    }

    let mut step = VUS
        .as_ref()
        .and_then(|re| re.captures(line))
        .and_then(|caps| {
            Some(format!(
                "Running with {}/{} VUs",
                caps.get(1)?.as_str(),
                caps.get(2)?.as_str()
            ))
        });

    if step.is_none() && SUMMARY_MARKERS.iter().any(|m| line.contains(m)) {
        step = Some("Collecting results".to_string());
    }

    let percent = percent.map(|p| p.min(PROGRESS_CAP as u32) as u8);
    if percent.is_none() && step.is_none() {
        return None;
    }
    Some(Progress { percent, step })
}
