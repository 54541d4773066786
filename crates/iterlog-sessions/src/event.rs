//! Typed view of the iteration-related entries on the log bus.
//!
//! Log entries carry a free-form `details` payload. Entries that belong to an
//! iteration have a string `iterationId` and usually a `logType` tag; this
//! module turns those into [`IterationEvent`]s. Anything missing or of the
//! wrong shape is treated as absent.

use chrono::{DateTime, Utc};
use iterlog_logging::LogEntry;
use serde_json::Value;

use crate::types::{SensorKind, SensorReading};

const UNKNOWN_TOOL: &str = "unknown";

/// What an iteration-related log entry says happened.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Sensor(SensorReading),
    ModelPrompt { prompt: String, images: Vec<String> },
    ModelResponse { response: String },
    ToolSuccess { name: String, params: Option<Value> },
    ToolError { name: String, error: Option<String> },
    /// No `logType`, or one this module does not know
    Untagged,
}

/// A log entry attributed to one iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct IterationEvent {
    pub iteration_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

impl IterationEvent {
    /// Returns `None` for entries without a string `details.iterationId`.
    pub fn from_entry(entry: &LogEntry) -> Option<Self> {
        let iteration_id = entry.details.get("iterationId")?.as_str()?.to_string();
        let log_type = entry.details.get("logType").and_then(Value::as_str);
        let content = entry.details.get("content").unwrap_or(&Value::Null);

        let kind = match log_type {
            Some(tag) => parse_kind(tag, content, entry.timestamp),
            None => EventKind::Untagged,
        };

        Some(Self {
            iteration_id,
            agent_id: entry.source.clone(),
            timestamp: entry.timestamp,
            kind,
        })
    }
}

fn parse_kind(tag: &str, content: &Value, timestamp: DateTime<Utc>) -> EventKind {
    if let Some(sensor) = tag.strip_prefix("sensor-") {
        return match SensorKind::from_tag(sensor) {
            Some(kind) => EventKind::Sensor(parse_sensor(kind, content, timestamp)),
            None => EventKind::Untagged,
        };
    }

    match tag {
        "model-prompt" => parse_prompt(content),
        "model-response" => EventKind::ModelResponse {
            response: text_or(content, &["response", "text"]),
        },
        "tool-success" => EventKind::ToolSuccess {
            name: match content {
                Value::String(s) => s.clone(),
                _ => str_field(content, &["tool", "name"]).unwrap_or_else(|| UNKNOWN_TOOL.to_string()),
            },
            params: content.get("params").cloned(),
        },
        "tool-error" => match content {
            Value::String(s) => EventKind::ToolError {
                name: UNKNOWN_TOOL.to_string(),
                error: Some(s.clone()),
            },
            _ => EventKind::ToolError {
                name: str_field(content, &["tool", "name"]).unwrap_or_else(|| UNKNOWN_TOOL.to_string()),
                error: str_field(content, &["error", "message"]),
            },
        },
        _ => EventKind::Untagged,
    }
}

fn parse_sensor(kind: SensorKind, content: &Value, timestamp: DateTime<Utc>) -> SensorReading {
    let byte_size = if kind.is_image() {
        ["byteSize", "size"]
            .iter()
            .find_map(|k| content.get(*k).and_then(Value::as_u64))
    } else {
        None
    };

    let source = match kind {
        SensorKind::Audio | SensorKind::ImageMemory => str_field(content, &["source"]),
        SensorKind::Memory => str_field(content, &["source", "agentId"]),
        _ => None,
    };

    let image_count = match kind {
        SensorKind::ImageMemory => content
            .get("imageCount")
            .and_then(Value::as_u64)
            .or_else(|| {
                content
                    .get("images")
                    .and_then(Value::as_array)
                    .map(|a| a.len() as u64)
            })
            .map(|n| n.min(u32::MAX as u64) as u32),
        _ => None,
    };

    SensorReading {
        kind,
        content: content.clone(),
        timestamp,
        byte_size,
        source,
        image_count,
    }
}

fn parse_prompt(content: &Value) -> EventKind {
    match content {
        Value::Object(_) => {
            let images = content
                .get("images")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|img| match img {
                            Value::String(s) => Some(s.clone()),
                            other => other.get("data").and_then(Value::as_str).map(String::from),
                        })
                        .collect()
                })
                .unwrap_or_default();
            EventKind::ModelPrompt {
                prompt: text_or(content, &["prompt", "text"]),
                images,
            }
        }
        _ => EventKind::ModelPrompt {
            prompt: text_or(content, &[]),
            images: Vec::new(),
        },
    }
}

fn str_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(String::from)
}

/// Plain strings are taken as-is; objects yield the first matching key or
/// their JSON text; null yields an empty string.
fn text_or(value: &Value, keys: &[&str]) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => str_field(other, keys).unwrap_or_else(|| other.to_string()),
    }
}
