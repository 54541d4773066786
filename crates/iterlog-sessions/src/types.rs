use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::{EventKind, IterationEvent};

/// Input channel a sensor reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SensorKind {
    Screenshot,
    Camera,
    Ocr,
    Audio,
    Clipboard,
    Memory,
    ImageMemory,
}

impl SensorKind {
    /// Parse the suffix of a `sensor-*` log tag.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "screenshot" => Some(SensorKind::Screenshot),
            "camera" => Some(SensorKind::Camera),
            "ocr" => Some(SensorKind::Ocr),
            "audio" => Some(SensorKind::Audio),
            "clipboard" => Some(SensorKind::Clipboard),
            "memory" => Some(SensorKind::Memory),
            "image-memory" => Some(SensorKind::ImageMemory),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            SensorKind::Screenshot => "screenshot",
            SensorKind::Camera => "camera",
            SensorKind::Ocr => "ocr",
            SensorKind::Audio => "audio",
            SensorKind::Clipboard => "clipboard",
            SensorKind::Memory => "memory",
            SensorKind::ImageMemory => "image-memory",
        }
    }

    /// Whether readings of this kind carry image payloads.
    pub fn is_image(&self) -> bool {
        matches!(
            self,
            SensorKind::Screenshot | SensorKind::Camera | SensorKind::ImageMemory
        )
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// One capture from one input channel during one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorReading {
    pub kind: SensorKind,
    #[serde(default)]
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

/// One side-effecting action invoked during an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub name: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One run cycle of one agent, built up from the log events that share its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Iteration {
    pub id: String,
    pub agent_id: String,
    pub session_id: String,
    /// 1-based position within the session, fixed when the iteration is first seen
    pub session_iteration_number: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub sensors: Vec<SensorReading>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_response_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tools: Vec<ToolCall>,
    /// Seconds from first event to model response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub has_error: bool,
}

impl Iteration {
    pub fn new(
        id: impl Into<String>,
        agent_id: impl Into<String>,
        session_id: impl Into<String>,
        session_iteration_number: u32,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            session_id: session_id.into(),
            session_iteration_number,
            start_time,
            sensors: Vec::new(),
            model_prompt: None,
            model_images: None,
            model_response: None,
            model_response_time: None,
            tools: Vec::new(),
            duration: None,
            has_error: false,
        }
    }

    /// Fold one event into this iteration.
    pub fn apply(&mut self, event: &IterationEvent) {
        match &event.kind {
            EventKind::Sensor(reading) => self.sensors.push(reading.clone()),
            EventKind::ModelPrompt { prompt, images } => {
                self.model_prompt = Some(prompt.clone());
                self.model_images = Some(images.clone());
            }
            EventKind::ModelResponse { response } => {
                self.model_response = Some(response.clone());
                self.model_response_time = Some(event.timestamp);
                self.duration = Some(seconds_between(self.start_time, event.timestamp));
            }
            EventKind::ToolSuccess { name, params } => self.tools.push(ToolCall {
                name: name.clone(),
                status: ToolStatus::Success,
                params: params.clone(),
                error: None,
                timestamp: event.timestamp,
            }),
            EventKind::ToolError { name, error } => {
                self.tools.push(ToolCall {
                    name: name.clone(),
                    status: ToolStatus::Error,
                    params: None,
                    error: error.clone(),
                    timestamp: event.timestamp,
                });
                self.has_error = true;
            }
            EventKind::Untagged => {}
        }
    }
}

fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}

/// One continuous run of one agent between explicit start and end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub agent_id: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub iterations: Vec<Iteration>,
}

/// Everything archived for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHistory {
    pub agent_id: String,
    /// Id of the most recently archived session
    #[serde(default)]
    pub current_session: String,
    #[serde(default)]
    pub sessions: BTreeMap<String, Session>,
}

impl AgentHistory {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            current_session: String::new(),
            sessions: BTreeMap::new(),
        }
    }
}

/// Estimated storage footprint of one agent, in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    #[serde(rename = "currentSessionMB")]
    pub current_session_mb: f64,
    #[serde(rename = "totalHistoryMB")]
    pub total_history_mb: f64,
}

/// Result of an end-of-session flush.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EndOutcome {
    /// The agent had no current session
    NoSession,
    /// Another flush for this agent has not finished yet
    InProgress,
    /// Written to the archive and purged from memory
    Archived { session_id: String, iterations: usize },
    /// The archive write failed; iterations stay in memory
    Retained { session_id: String },
}

impl EndOutcome {
    pub fn is_archived(&self) -> bool {
        matches!(self, EndOutcome::Archived { .. })
    }
}
