use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Default number of entries the logger keeps in memory.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warning"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// One event on the log bus.
///
/// `source` is the id of the agent that produced the entry. `details` is a
/// free-form payload; consumers pick out the fields they understand and
/// ignore the rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(default = "new_entry_id")]
    pub id: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_level")]
    pub level: LogLevel,
    pub source: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

fn new_entry_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

impl LogEntry {
    pub fn new(source: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: new_entry_id(),
            timestamp: Utc::now(),
            level,
            source: source.into(),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Override the timestamp (replayed or imported entries).
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable format with colors
    #[default]
    Pretty,
    /// JSON lines format for machine consumption
    Json,
    /// Compact single-line format
    Compact,
    /// No console output
    Quiet,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            "quiet" => Ok(LogFormat::Quiet),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Handle returned by [`Logger::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&LogEntry) + Send + Sync>;

struct LoggerInner {
    entries: VecDeque<LogEntry>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
}

/// Append-only log bus with subscribable listeners.
///
/// Entries are kept in a bounded ring, optionally echoed to the console and
/// appended to a JSONL file, then pushed to every listener in registration
/// order.
pub struct Logger {
    format: LogFormat,
    capacity: usize,
    inner: Mutex<LoggerInner>,
    file_writer: Option<Mutex<File>>,
}

impl Logger {
    pub fn new(format: LogFormat) -> Self {
        Self::with_capacity(format, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(format: LogFormat, capacity: usize) -> Self {
        Self {
            format,
            capacity: capacity.max(1),
            inner: Mutex::new(LoggerInner {
                entries: VecDeque::new(),
                listeners: Vec::new(),
                next_listener: 0,
            }),
            file_writer: None,
        }
    }

    /// Also append every entry to a JSONL file
    pub fn with_file(mut self, log_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;

        self.file_writer = Some(Mutex::new(file));
        Ok(self)
    }

    pub fn log(&self, entry: LogEntry) {
        if let Some(ref writer) = self.file_writer {
            if let Ok(mut file) = writer.lock() {
                if let Ok(json) = serde_json::to_string(&entry) {
                    let _ = writeln!(file, "{}", json);
                }
            }
        }

        match self.format {
            LogFormat::Json => self.log_json(&entry),
            LogFormat::Pretty => self.log_pretty(&entry),
            LogFormat::Compact => self.log_compact(&entry),
            LogFormat::Quiet => {}
        }

        // Listeners run outside the lock so they may log or query freely.
        let listeners: Vec<Listener> = match self.inner.lock() {
            Ok(mut inner) => {
                inner.entries.push_back(entry.clone());
                while inner.entries.len() > self.capacity {
                    inner.entries.pop_front();
                }
                inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
            }
            Err(_) => {
                tracing::error!("Logger lock poisoned, dropping entry {}", entry.id);
                return;
            }
        };

        for listener in listeners {
            listener(&entry);
        }
    }

    /// Register a callback invoked with every subsequent entry.
    pub fn add_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LogEntry) + Send + Sync + 'static,
    {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let id = ListenerId(inner.next_listener);
        inner.next_listener += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Snapshot of retained entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner
            .lock()
            .map(|inner| inner.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn entries_for(&self, source: &str) -> Vec<LogEntry> {
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .entries
                    .iter()
                    .filter(|e| e.source == source)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.entries.clear();
        }
    }

    fn log_json(&self, entry: &LogEntry) {
        if let Ok(json) = serde_json::to_string(entry) {
            let _ = writeln!(std::io::stderr(), "{}", json);
        }
    }

    fn log_pretty(&self, entry: &LogEntry) {
        let mut stderr = std::io::stderr();
        let timestamp = entry.timestamp.format("%H:%M:%S");
        let level = match entry.level {
            LogLevel::Debug => "DEBUG".dimmed(),
            LogLevel::Info => " INFO".bright_blue(),
            LogLevel::Warning => " WARN".bright_yellow(),
            LogLevel::Error => "ERROR".bright_red(),
        };
        let tag = entry
            .details
            .get("logType")
            .and_then(|v| v.as_str())
            .map(|t| format!(" {}", t.dimmed()))
            .unwrap_or_default();
        let _ = writeln!(
            stderr,
            "{} {} {}{} {}",
            timestamp.to_string().dimmed(),
            level,
            format!("[{}]", entry.source).bright_cyan(),
            tag,
            Self::truncate(&entry.message, 120)
        );
    }

    fn log_compact(&self, entry: &LogEntry) {
        let _ = writeln!(
            std::io::stderr(),
            "[{}] {}:{} {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.source,
            entry.level,
            Self::truncate(&entry.message, 80)
        );
    }

    fn truncate(s: &str, max_chars: usize) -> String {
        if s.chars().count() > max_chars {
            let cut: String = s.chars().take(max_chars.saturating_sub(3)).collect();
            format!("{}...", cut)
        } else {
            s.to_string()
        }
    }
}
