//! Result payload parsing and schema validation
//!
//! Agents report results as JSON or plain text. JSON bodies go through a
//! repair-then-parse step first, because LLM-driven tools routinely wrap
//! payloads in markdown fences or leave trailing commas. Validation against
//! the caller-supplied schema happens here, at the channel boundary; the
//! orchestrator itself never interprets result content.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;

/// A delivered agent result. Produced at most once per run.
#[derive(Debug, Clone, Serialize)]
pub struct AgentResult<T = Value> {
    pub result: T,
    pub received_at: DateTime<Utc>,
}

impl AgentResult<Value> {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            received_at: Utc::now(),
        }
    }

    /// Deserialize the payload into a concrete type, keeping the receipt
    /// timestamp.
    pub fn decode<T: DeserializeOwned>(self) -> serde_json::Result<AgentResult<T>> {
        Ok(AgentResult {
            result: serde_json::from_value(self.result)?,
            received_at: self.received_at,
        })
    }
}

/// Caller-supplied validation applied at the channel boundary.
///
/// Errors carry the first validation issue as a human-readable message,
/// returned verbatim to the agent (HTTP 400 in callback mode).
pub trait ResultSchema: Send + Sync {
    fn validate(&self, value: &Value) -> Result<(), String>;
}

impl<F> ResultSchema for F
where
    F: Fn(&Value) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, value: &Value) -> Result<(), String> {
        self(value)
    }
}

/// Schema backed by a serde type: the payload is valid iff it deserializes.
pub struct TypedSchema<T>(PhantomData<fn() -> T>);

impl<T> TypedSchema<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for TypedSchema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> ResultSchema for TypedSchema<T> {
    fn validate(&self, value: &Value) -> Result<(), String> {
        serde_json::from_value::<T>(value.clone())
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

/// Expected payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Must be JSON (repair-then-parse); malformed input is an error.
    Json,
    /// Trimmed plain text.
    Text,
    /// Try JSON first, fall back to trimmed plain text.
    Auto,
}

/// Parse a raw body into a JSON value per `format`.
pub fn parse_payload(body: &[u8], format: PayloadFormat) -> Result<Value, String> {
    let text = std::str::from_utf8(body).map_err(|_| "invalid request stream".to_string())?;
    match format {
        PayloadFormat::Json => parse_json_repaired(text),
        PayloadFormat::Text => Ok(Value::String(text.trim().to_string())),
        PayloadFormat::Auto => {
            parse_json_repaired(text).or_else(|_| Ok(Value::String(text.trim().to_string())))
        }
    }
}

fn parse_json_repaired(text: &str) -> Result<Value, String> {
    match serde_json::from_str(text) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            for candidate in repair_candidates(text) {
                if let Ok(value) = serde_json::from_str(&candidate) {
                    return Ok(value);
                }
            }
            Err(format!("malformed JSON: {first_err}"))
        }
    }
}

/// Progressively repaired variants of `text`, cheapest first.
fn repair_candidates(text: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    let unfenced = strip_code_fences(text);
    if unfenced != text.trim() {
        candidates.push(unfenced.to_string());
    }

    let decommaed = strip_trailing_commas(unfenced);
    if decommaed != unfenced {
        candidates.push(decommaed.clone());
    }

    // Last resort: the outermost braced region of the body.
    if let (Some(start), Some(end)) = (decommaed.find('{'), decommaed.rfind('}')) {
        if start < end {
            candidates.push(decommaed[start..=end].to_string());
        }
    }

    candidates
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", etc.) on the opening fence.
    let inner = match inner.find('\n') {
        Some(idx) => &inner[idx + 1..],
        None => inner,
    };
    inner.trim_end().strip_suffix("```").unwrap_or(inner).trim()
}

/// Drop commas that directly precede a closing brace/bracket, outside
/// string literals.
fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;
    let chars: Vec<char> = text.chars().collect();

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                let next_meaningful = chars[i + 1..].iter().find(|c| !c.is_whitespace());
                if matches!(next_meaningful, Some('}') | Some(']')) {
                    continue;
                }
                out.push(ch);
            }
            _ => out.push(ch),
        }
    }
    out
}
