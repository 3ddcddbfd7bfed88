//! Lighthouse report parsing

use super::{
    compile, data_field, decode_json_payload, duration_to_ms, identity, json_number,
    parse_number, result_data_field, result_field, size_to_bytes, unwrap_payload, UnwrapStep,
};
use crate::{Error, MetricCategory, MetricRecord, ParsedOutput, Result, RunSummary};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Category ids reported as 0-100 scores
pub const CATEGORIES: &[&str] = &["performance", "accessibility", "best-practices", "seo"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuditUnit {
    Millis,
    Unitless,
    Bytes,
}

struct AuditSpec {
    id: &'static str,
    key: &'static str,
    unit: AuditUnit,
    description: &'static str,
}

const AUDITS: &[AuditSpec] = &[
    AuditSpec { id: "first-contentful-paint", key: "first_contentful_paint", unit: AuditUnit::Millis, description: "First Contentful Paint" },
    AuditSpec { id: "largest-contentful-paint", key: "largest_contentful_paint", unit: AuditUnit::Millis, description: "Largest Contentful Paint" },
    AuditSpec { id: "total-blocking-time", key: "total_blocking_time", unit: AuditUnit::Millis, description: "Total Blocking Time" },
    AuditSpec { id: "cumulative-layout-shift", key: "cumulative_layout_shift", unit: AuditUnit::Unitless, description: "Cumulative Layout Shift" },
    AuditSpec { id: "speed-index", key: "speed_index", unit: AuditUnit::Millis, description: "Speed Index" },
    AuditSpec { id: "interactive", key: "time_to_interactive", unit: AuditUnit::Millis, description: "Time to Interactive" },
    AuditSpec { id: "max-potential-fid", key: "max_potential_fid", unit: AuditUnit::Millis, description: "Max Potential First Input Delay" },
    AuditSpec { id: "total-byte-weight", key: "total_byte_weight", unit: AuditUnit::Bytes, description: "Total page weight" },
];

fn lhr_field(value: &Value) -> Option<&Value> {
    value.get("lhr")
}

/// Nesting levels tried in order until one exposes report fields
static STEPS: &[UnwrapStep] = &[
    UnwrapStep { name: "raw", project: identity },
    UnwrapStep { name: "result", project: result_field },
    UnwrapStep { name: "data", project: data_field },
    UnwrapStep { name: "result.data", project: result_data_field },
    UnwrapStep { name: "lhr", project: lhr_field },
];

fn looks_like_report(value: &Value) -> bool {
    ["categories", "scores", "metrics", "audits", "runtimeError"]
        .iter()
        .any(|key| value.get(key).map(|v| v.is_object()).unwrap_or(false))
}

/// Normalized Lighthouse metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LighthouseMetrics {
    /// Category scores, 0-100
    pub scores: BTreeMap<String, f64>,
    /// Audit values keyed by metric name, in ms / bytes / unitless
    pub audits: BTreeMap<String, f64>,
}

/// Locate the report object inside a raw tool payload
pub fn unwrap_report(raw: &str) -> Result<Value> {
    let decoded = decode_json_payload(raw)?;
    match unwrap_payload(&decoded, STEPS, looks_like_report) {
        Some((step, report)) => {
            debug!("Lighthouse report found via '{}' unwrap", step);
            Ok(report.clone())
        }
        None => Err(Error::OutputDecode(
            "payload does not contain a Lighthouse report".to_string(),
        )),
    }
}

/// Parse a Lighthouse payload.
///
/// Fails only when the payload cannot be decoded or holds no report at all;
/// individual missing scores and audits are simply left out.
pub fn parse(test_id: &str, raw: &str) -> Result<ParsedOutput> {
    let report = unwrap_report(raw)?;
    let metrics = extract(&report);

    let score = if metrics.scores.is_empty() {
        None
    } else {
        let sum: f64 = metrics.scores.values().sum();
        Some((sum / metrics.scores.len() as f64).round())
    };

    let summary = RunSummary {
        score,
        ..Default::default()
    };

    Ok(ParsedOutput {
        recognized: !metrics.scores.is_empty() || !metrics.audits.is_empty(),
        records: records_from(test_id, &metrics),
        metrics: serde_json::to_value(&metrics).unwrap_or_default(),
        summary,
    })
}

fn extract(report: &Value) -> LighthouseMetrics {
    let mut metrics = LighthouseMetrics::default();

    for category in CATEGORIES {
        let raw = report
            .get("scores")
            .and_then(|s| s.get(category))
            .and_then(|s| s.get("score").or(Some(s)))
            .and_then(json_number)
            .or_else(|| {
                report
                    .get("categories")
                    .and_then(|c| c.get(category))
                    .and_then(|c| c.get("score"))
                    .and_then(json_number)
            });
        if let Some(score) = raw {
            let score = if score <= 1.0 { score * 100.0 } else { score };
            metrics.scores.insert(category.to_string(), score.round());
        }
    }

    for audit in AUDITS {
        if let Some(value) = audit_value(report, audit) {
            metrics.audits.insert(audit.key.to_string(), value);
        }
    }

    metrics
}

fn audit_value(report: &Value, audit: &AuditSpec) -> Option<f64> {
    let from_metrics = report.get("metrics").and_then(|m| m.get(audit.id)).and_then(|m| {
        m.get("value")
            .or_else(|| m.get("numericValue"))
            .and_then(json_number)
            .or_else(|| json_number(m))
    });
    if from_metrics.is_some() {
        return from_metrics;
    }

    let audit_node = report.get("audits")?.get(audit.id)?;
    if let Some(value) = audit_node.get("numericValue").and_then(json_number) {
        return Some(value);
    }

    let shown = audit_node.get("displayValue")?.as_str()?;
    let parsed = parse_display_value(shown, audit.unit);
    if parsed.is_none() {
        warn!("Unrecognized {} display value {:?}", audit.id, shown);
    }
    parsed
}

static DISPLAY_TOKEN: Lazy<Option<Regex>> = Lazy::new(|| {
    compile(r"([0-9][0-9,]*(?:\.[0-9]+)?)\s*(ms|s|[kKMG]?i?B)?")
});

/// Interpret a human display value such as `1.2 s`, `340 ms` or `Total size was 1,234 KiB`
fn parse_display_value(display: &str, unit: AuditUnit) -> Option<f64> {
    // Lighthouse separates value and unit with a non-breaking space
    let display = display.replace('\u{a0}', " ");
    let caps = DISPLAY_TOKEN.as_ref()?.captures(&display)?;
    let number = caps.get(1)?.as_str();
    let suffix = caps.get(2).map(|m| m.as_str()).unwrap_or("");

    match unit {
        AuditUnit::Millis => duration_to_ms(&format!("{}{}", number.replace(',', ""), suffix)),
        AuditUnit::Bytes => size_to_bytes(&format!("{} {}", number, suffix)),
        AuditUnit::Unitless => parse_number(number),
    }
}

fn records_from(test_id: &str, metrics: &LighthouseMetrics) -> Vec<MetricRecord> {
    let mut records: Vec<MetricRecord> = metrics
        .scores
        .iter()
        .map(|(category, score)| {
            MetricRecord::new(
                test_id,
                MetricCategory::Score,
                category.as_str(),
                *score,
                "percent",
                format!("{} score", category),
            )
        })
        .collect();

    for audit in AUDITS {
        let Some(value) = metrics.audits.get(audit.key) else {
            continue;
        };
        let (category, unit) = match audit.unit {
            AuditUnit::Millis => (MetricCategory::Timing, "ms"),
            AuditUnit::Unitless => (MetricCategory::Score, "score"),
            AuditUnit::Bytes => (MetricCategory::Size, "bytes"),
        };
        records.push(MetricRecord::new(
            test_id,
            category,
            audit.key,
            *value,
            unit,
            audit.description,
        ));
    }

    records
}

/// Report-level failures: a `runtimeError` or an explicit unsuccessful result
pub fn detect_failure(raw: &str) -> Option<String> {
    let decoded = decode_json_payload(raw).ok()?;
    let report = unwrap_payload(&decoded, STEPS, looks_like_report)
        .map(|(_, report)| report)
        .unwrap_or(&decoded);

    if let Some(err) = report.get("runtimeError").filter(|e| e.is_object()) {
        let code = err.get("code").and_then(Value::as_str).unwrap_or("UNKNOWN");
        let message = err.get("message").and_then(Value::as_str).unwrap_or("");
        return Some(format!("lighthouse runtime error {}: {}", code, message));
    }

    if decoded.get("success").and_then(Value::as_bool) == Some(false) {
        let message = decoded
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("audit reported success=false");
        return Some(message.to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lhr() -> Value {
        json!({
            "categories": {
                "performance": {"score": 0.91},
                "accessibility": {"score": 0.87},
                "best-practices": {"score": 1.0},
                "seo": {"score": 0.9}
            },
            "audits": {
                "first-contentful-paint": {"numericValue": 1234.5, "displayValue": "1.2\u{a0}s"},
                "largest-contentful-paint": {"displayValue": "2.5\u{a0}s"},
                "cumulative-layout-shift": {"numericValue": 0.02},
                "total-byte-weight": {"displayValue": "Total size was 1,234\u{a0}KiB"}
            }
        })
    }

    fn metrics_of(parsed: &ParsedOutput) -> LighthouseMetrics {
        serde_json::from_value(parsed.metrics.clone()).unwrap()
    }

    #[test]
    fn test_raw_report() {
        let parsed = parse("t1", &lhr().to_string()).unwrap();
        assert!(parsed.recognized);

        let metrics = metrics_of(&parsed);
        assert_eq!(metrics.scores["performance"], 91.0);
        assert_eq!(metrics.scores["best-practices"], 100.0);
        assert_eq!(metrics.audits["first_contentful_paint"], 1234.5);
        assert_eq!(metrics.audits["largest_contentful_paint"], 2500.0);
        assert_eq!(metrics.audits["cumulative_layout_shift"], 0.02);
        assert_eq!(metrics.audits["total_byte_weight"], 1_263_616.0);
        assert!(!metrics.audits.contains_key("speed_index"));

        // (91 + 87 + 100 + 90) / 4 = 92
        assert_eq!(parsed.summary.score, Some(92.0));
    }

    #[test]
    fn test_unwrap_strategies_agree() {
        let direct = parse("t1", &lhr().to_string()).unwrap();

        let variants = [
            json!({"result": {"data": lhr()}}),
            json!({"data": lhr()}),
            json!({"lhr": lhr()}),
            json!([{"type": "text", "text": lhr().to_string()}]),
            Value::String(lhr().to_string()),
        ];
        for variant in variants {
            let parsed = parse("t1", &variant.to_string()).unwrap();
            assert_eq!(parsed, direct, "variant {}", variant);
        }
    }

    #[test]
    fn test_scores_and_metrics_shape() {
        let payload = json!({
            "scores": {"performance": {"score": 0.5}, "seo": 0.75},
            "metrics": {
                "speed-index": {"value": 3100},
                "total-blocking-time": 150
            }
        });
        let parsed = parse("t2", &payload.to_string()).unwrap();
        let metrics = metrics_of(&parsed);
        assert_eq!(metrics.scores["performance"], 50.0);
        assert_eq!(metrics.scores["seo"], 75.0);
        assert_eq!(metrics.audits["speed_index"], 3100.0);
        assert_eq!(metrics.audits["total_blocking_time"], 150.0);

        let score_record = parsed
            .records
            .iter()
            .find(|r| r.name == "performance")
            .unwrap();
        assert_eq!(score_record.category, MetricCategory::Score);
        assert_eq!(score_record.unit, "percent");
    }

    #[test]
    fn test_unreadable_display_value_is_skipped() {
        let report = json!({
            "categories": {"performance": {"score": 0.5}},
            "audits": {
                "speed-index": {"displayValue": "n/a"},
                "total-blocking-time": {"displayValue": "340\u{a0}ms"}
            }
        });
        let metrics = metrics_of(&parse("t3", &report.to_string()).unwrap());
        assert!(!metrics.audits.contains_key("speed_index"));
        assert_eq!(metrics.audits["total_blocking_time"], 340.0);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(parse("t", ""), Err(Error::OutputDecode(_))));
        assert!(matches!(parse("t", "<html>"), Err(Error::OutputDecode(_))));
        assert!(matches!(
            parse("t", r#"{"unrelated": true}"#),
            Err(Error::OutputDecode(_))
        ));
    }

    #[test]
    fn test_empty_report_is_not_recognized() {
        let parsed = parse("t", r#"{"categories": {}}"#).unwrap();
        assert!(!parsed.recognized);
        assert!(parsed.records.is_empty());
        assert_eq!(parsed.summary.score, None);
    }

    #[test]
    fn test_detect_failure() {
        assert!(detect_failure(&lhr().to_string()).is_none());

        let runtime = json!({"lhr": {"runtimeError": {"code": "NO_FCP", "message": "no paint"}}});
        let reason = detect_failure(&runtime.to_string()).unwrap();
        assert!(reason.contains("NO_FCP"));

        let unsuccessful = json!({"success": false, "error": "chrome crashed"});
        assert_eq!(
            detect_failure(&unsuccessful.to_string()).as_deref(),
            Some("chrome crashed")
        );
    }

    #[test]
    fn test_parse_is_pure() {
        let raw = lhr().to_string();
        assert_eq!(parse("t1", &raw).unwrap(), parse("t1", &raw).unwrap());
    }
}
