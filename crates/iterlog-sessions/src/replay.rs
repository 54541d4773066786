use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use iterlog_logging::{LogEntry, Logger};
use serde::{Deserialize, Serialize};

use crate::store::IterationStore;
use crate::types::EndOutcome;

/// One line of a replay file.
///
/// A replay file is JSONL: lifecycle calls and log entries in the order
/// they happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReplayLine {
    SessionStart {
        agent_id: String,
        /// Generated when omitted
        #[serde(default)]
        session_id: Option<String>,
    },
    Log(LogEntry),
    SessionEnd {
        agent_id: String,
    },
}

impl ReplayLine {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).with_context(|| {
            format!(
                "Failed to parse replay line: {}",
                line.chars().take(100).collect::<String>()
            )
        })
    }
}

/// Parse a whole replay file. Blank lines are skipped.
pub fn parse_replay(path: &Path) -> Result<Vec<ReplayLine>> {
    let file = File::open(path).with_context(|| format!("Failed to open replay file: {:?}", path))?;
    let reader = BufReader::new(file);

    let mut lines = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| "Failed to read line from replay file")?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = ReplayLine::parse(&line)
            .with_context(|| format!("{}:{}", path.display(), index + 1))?;
        lines.push(parsed);
    }

    Ok(lines)
}

/// Counts of what a replay did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub entries: usize,
    pub sessions_started: usize,
    pub sessions_archived: usize,
    pub sessions_retained: usize,
}

impl ReplaySummary {
    fn record_end(&mut self, outcome: &EndOutcome) {
        match outcome {
            EndOutcome::Archived { .. } => self.sessions_archived += 1,
            EndOutcome::Retained { .. } => self.sessions_retained += 1,
            EndOutcome::NoSession | EndOutcome::InProgress => {}
        }
    }
}

/// Apply one line: lifecycle calls go to the store, log entries go through
/// the logger (which the store is expected to be attached to).
pub async fn apply_line(
    store: &IterationStore,
    logger: &Logger,
    line: ReplayLine,
    summary: &mut ReplaySummary,
) {
    match line {
        ReplayLine::SessionStart {
            agent_id,
            session_id,
        } => {
            let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            store.start_session(&agent_id, &session_id).await;
            summary.sessions_started += 1;
        }
        ReplayLine::Log(entry) => {
            logger.log(entry);
            summary.entries += 1;
        }
        ReplayLine::SessionEnd { agent_id } => {
            let outcome = store.end_session(&agent_id).await;
            summary.record_end(&outcome);
        }
    }
}

pub async fn replay(store: &IterationStore, logger: &Logger, lines: Vec<ReplayLine>) -> ReplaySummary {
    let mut summary = ReplaySummary::default();
    for line in lines {
        apply_line(store, logger, line, &mut summary).await;
    }
    summary
}
