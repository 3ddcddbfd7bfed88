//! Output parsers for the orchestrated tools
//!
//! Every parser here is a pure function from raw tool output to a
//! [`ParsedOutput`](crate::ParsedOutput). Missing sections and unparseable
//! fields degrade to absent values; only a payload that cannot be decoded at
//! all is reported as [`Error::OutputDecode`].
//!
//! Free-text extraction is driven by tables of [`LineRule`]s: a line selector
//! plus `(pattern, field, unit)` tuples, so recognizing a new summary line is a
//! data change. JSON extraction walks an ordered list of [`UnwrapStep`]s and
//! stops at the first nesting level that looks like the expected payload.

pub mod k6;
pub mod lighthouse;
pub mod playwright;

use crate::{Error, Result, ThresholdResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Maximum number of string/content envelopes peeled off a JSON payload
const MAX_ENVELOPE_DEPTH: usize = 4;

/// Compile a built-in pattern. A bad pattern disables its rule instead of panicking.
pub(crate) fn compile(pattern: &str) -> Option<Regex> {
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Disabling output pattern {:?}: {}", pattern, e);
            None
        }
    }
}

// ============================================================================
// Units
// ============================================================================

/// How a captured token is normalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// Duration, normalized to milliseconds
    Millis,
    /// Size, normalized to bytes (a trailing `/s` is ignored)
    Bytes,
    /// Percentage, stored as 0-100
    Percent,
    /// Plain number (a trailing `/s` is ignored)
    Number,
}

impl UnitKind {
    pub fn convert(&self, token: &str) -> Option<f64> {
        let token = token.trim();
        let token = token.strip_suffix("/s").unwrap_or(token);
        match self {
            UnitKind::Millis => duration_to_ms(token),
            UnitKind::Bytes => size_to_bytes(token),
            UnitKind::Percent => parse_number(token.trim_end_matches('%')),
            UnitKind::Number => parse_number(token),
        }
    }
}

static DURATION_PART: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r"([0-9]+(?:\.[0-9]+)?)(ns|µs|μs|us|ms|s|m|h)?"));

static SIZE_TOKEN: Lazy<Option<Regex>> =
    Lazy::new(|| compile(r"^([0-9][0-9,]*(?:\.[0-9]+)?)\s*([kKMGT]?i?B)?$"));

/// Parse a plain number, tolerating thousands separators
pub fn parse_number(token: &str) -> Option<f64> {
    let cleaned: String = token.trim().chars().filter(|c| *c != ',').collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Convert a duration token (`120ms`, `1.2s`, `1m30.5s`, `3µs`) to milliseconds.
///
/// A bare number is taken as milliseconds. Anything that is not fully
/// consumed by number/unit pairs is rejected.
pub fn duration_to_ms(token: &str) -> Option<f64> {
    let re = DURATION_PART.as_ref()?;
    let compact: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }

    let mut total = 0.0;
    let mut consumed = 0;
    for caps in re.captures_iter(&compact) {
        let whole = caps.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let value = parse_number(caps.get(1)?.as_str())?;
        let factor = match caps.get(2).map(|m| m.as_str()) {
            Some("ns") => 0.000_001,
            Some("µs") | Some("μs") | Some("us") => 0.001,
            Some("ms") | None => 1.0,
            Some("s") => 1_000.0,
            Some("m") => 60_000.0,
            Some("h") => 3_600_000.0,
            Some(_) => return None,
        };
        total += value * factor;
    }

    (consumed == compact.len()).then_some(total)
}

/// Convert a size token (`1.2 MB`, `40 kB`, `512KiB`, `1024`) to bytes.
///
/// Decimal suffixes (`kB`, `MB`, ...) use powers of 1000, binary suffixes
/// (`KiB`, `MiB`, ...) powers of 1024. A bare number is taken as bytes.
pub fn size_to_bytes(token: &str) -> Option<f64> {
    let re = SIZE_TOKEN.as_ref()?;
    let caps = re.captures(token.trim())?;
    let value = parse_number(caps.get(1)?.as_str())?;
    let factor = match caps.get(2).map(|m| m.as_str()) {
        None | Some("B") => 1.0,
        Some("kB") | Some("KB") => 1_000.0,
        Some("MB") => 1_000_000.0,
        Some("GB") => 1_000_000_000.0,
        Some("TB") => 1_000_000_000_000.0,
        Some("KiB") | Some("kiB") => 1_024.0,
        Some("MiB") => 1_048_576.0,
        Some("GiB") => 1_073_741_824.0,
        Some("TiB") => 1_099_511_627_776.0,
        Some(_) => return None,
    };
    Some(value * factor)
}

// ============================================================================
// Line rules
// ============================================================================

/// One field captured from a selected line
pub struct FieldRule {
    pub field: &'static str,
    pub pattern: Regex,
    pub unit: UnitKind,
}

/// Selects summary lines for one metric and lists the fields to pull from them
pub struct LineRule {
    pub metric: &'static str,
    pub line: Regex,
    pub fields: Vec<FieldRule>,
}

impl LineRule {
    /// Build a rule from pattern strings. Returns `None` if the line selector is invalid;
    /// invalid field patterns are dropped individually.
    pub fn new(
        metric: &'static str,
        line: &str,
        fields: &[(&'static str, &str, UnitKind)],
    ) -> Option<Self> {
        let line = compile(line)?;
        let fields = fields
            .iter()
            .filter_map(|&(field, pattern, unit)| {
                compile(pattern).map(|pattern| FieldRule {
                    field,
                    pattern,
                    unit,
                })
            })
            .collect();
        Some(Self {
            metric,
            line,
            fields,
        })
    }
}

/// Values extracted per metric, per field
pub type Extracted = BTreeMap<&'static str, BTreeMap<&'static str, f64>>;

/// Run a rule table over text.
///
/// Every line is tested against every rule. For a matching line, each field
/// pattern's first capture group is converted with its unit; when several
/// patterns name the same field, the first that yields a number wins. Later
/// lines for the same metric overwrite earlier ones.
pub fn apply_rules(text: &str, rules: &[LineRule]) -> Extracted {
    let mut extracted = Extracted::new();

    for line in text.lines() {
        for rule in rules {
            if !rule.line.is_match(line) {
                continue;
            }

            let mut values = BTreeMap::new();
            for field in &rule.fields {
                if values.contains_key(field.field) {
                    continue;
                }
                let Some(token) = field
                    .pattern
                    .captures(line)
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str())
                else {
                    continue;
                };
                match field.unit.convert(token) {
                    Some(value) => {
                        values.insert(field.field, value);
                    }
                    None => warn!(
                        "Ignoring non-numeric {}.{} value {:?}",
                        rule.metric, field.field, token
                    ),
                }
            }

            if !values.is_empty() {
                extracted.entry(rule.metric).or_default().extend(values);
            }
        }
    }

    extracted
}

/// Read one extracted field, defaulting to zero
pub fn field(extracted: &Extracted, metric: &str, name: &str) -> f64 {
    extracted
        .get(metric)
        .and_then(|fields| fields.get(name))
        .copied()
        .unwrap_or(0.0)
}

// ============================================================================
// JSON payloads
// ============================================================================

/// One way of reaching the interesting part of a nested payload
pub struct UnwrapStep {
    pub name: &'static str,
    pub project: for<'a> fn(&'a Value) -> Option<&'a Value>,
}

/// Try each step in order and return the first projection accepted by `accept`
pub fn unwrap_payload<'a>(
    value: &'a Value,
    steps: &[UnwrapStep],
    accept: fn(&Value) -> bool,
) -> Option<(&'static str, &'a Value)> {
    steps.iter().find_map(|step| {
        (step.project)(value)
            .filter(|projected| accept(projected))
            .map(|projected| (step.name, projected))
    })
}

pub fn identity(value: &Value) -> Option<&Value> {
    Some(value)
}

pub fn result_field(value: &Value) -> Option<&Value> {
    value.get("result")
}

pub fn data_field(value: &Value) -> Option<&Value> {
    value.get("data")
}

pub fn result_data_field(value: &Value) -> Option<&Value> {
    value.get("result")?.get("data")
}

/// Decode raw output into JSON, peeling text envelopes.
///
/// Handles plain JSON, JSON encoded inside a JSON string, and tool-call
/// content arrays (`[{"type":"text","text":"{...}"}]`, optionally under a
/// `content` key), up to a bounded depth.
pub fn decode_json_payload(raw: &str) -> Result<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::OutputDecode("output is empty".to_string()));
    }

    let mut value: Value = serde_json::from_str(trimmed)
        .map_err(|e| Error::OutputDecode(format!("output is not JSON: {}", e)))?;

    for _ in 0..MAX_ENVELOPE_DEPTH {
        let inner = match &value {
            Value::String(text) => serde_json::from_str(text.trim()).ok(),
            Value::Array(items) => text_content(items),
            Value::Object(map) => match map.get("content") {
                Some(Value::Array(items)) if map.len() <= 2 => text_content(items),
                _ => None,
            },
            _ => None,
        };
        match inner {
            Some(inner) => value = inner,
            None => break,
        }
    }

    Ok(value)
}

fn text_content(items: &[Value]) -> Option<Value> {
    let first = items.first()?;
    if first.get("type").and_then(Value::as_str) != Some("text") {
        return None;
    }
    let text = first.get("text").and_then(Value::as_str)?;
    serde_json::from_str(text.trim()).ok()
}

/// Read a number that may be encoded as a JSON number or a numeric string
pub fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        _ => None,
    }
}

// ============================================================================
// Thresholds
// ============================================================================

/// Classify a glyph-prefixed line: `Some((passed, rest))` for ✓ / ✗ / ✘ lines
pub fn glyph_outcome(line: &str) -> Option<(bool, &str)> {
    let trimmed = line.trim_start();
    let mut chars = trimmed.chars();
    let passed = match chars.next()? {
        '✓' | '✔' => true,
        '✗' | '✘' | '×' => false,
        _ => return None,
    };
    Some((passed, chars.as_str().trim()))
}

/// Tally glyph lines: each pass glyph increments `passed`, each fail glyph
/// increments `failed`; every other line is ignored. `name_of` derives the
/// detail key from the text after the glyph.
pub fn tally_thresholds<'a, I, F>(lines: I, mut name_of: F) -> ThresholdResult
where
    I: IntoIterator<Item = &'a str>,
    F: FnMut(&'a str) -> String,
{
    let mut result = ThresholdResult::default();
    for line in lines {
        if let Some((passed, rest)) = glyph_outcome(line) {
            result.record(name_of(rest), passed);
        }
    }
    result
}
