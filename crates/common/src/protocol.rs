//! Line-delimited JSON protocol spoken by tool server processes
//!
//! One JSON object per line in each direction. Requests carry
//! `{"method": ..., "params": ...}`; responses carry either `{"result": ...}`
//! or `{"error": ...}`. Diagnostics belong on stderr and never reach this codec.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request line sent to a tool process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// Serialize to a single newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Convert a response object into the call outcome.
///
/// Decided by key presence: a non-null `error` always wins, and a present
/// `result` is a success even when it is `null`. An `"error": null` next to
/// a result means no error.
pub fn response_outcome(mut response: Map<String, Value>) -> Result<Value> {
    match response.remove("error") {
        None | Some(Value::Null) => {}
        Some(error) => return Err(Error::Remote(error_message(&error))),
    }
    response
        .remove("result")
        .ok_or_else(|| Error::MalformedResponse("response has neither result nor error".to_string()))
}

/// Classification of one stdout line
#[derive(Debug)]
pub enum Line {
    /// Not JSON at all; progress chatter or banner text
    Noise,
    /// A response envelope (possibly carrying a remote error)
    Response(Result<Value>),
}

/// Classify a single stdout line from a tool server
pub fn decode_line(line: &str) -> Line {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Line::Noise;
    }

    let value: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return Line::Noise,
    };

    Line::Response(decode_value(value, trimmed))
}

fn decode_value(value: Value, raw: &str) -> Result<Value> {
    match value {
        Value::Object(map) if map.contains_key("result") || map.contains_key("error") => {
            response_outcome(map)
        }
        _ => Err(Error::MalformedResponse(format!(
            "unexpected envelope: {}",
            truncate(raw, 200)
        ))),
    }
}

/// Unwrap a whole-output payload that may or may not be an envelope
pub fn unwrap_envelope(value: Value) -> Result<Value> {
    match value {
        Value::Object(map)
            if !map.is_empty() && map.keys().all(|k| k == "result" || k == "error") =>
        {
            response_outcome(map)
        }
        other => Ok(other),
    }
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
