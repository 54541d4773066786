use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use notify::{Event, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use iterlog_logging::Logger;
use iterlog_sessions::{apply_line, IterationEvent, IterationStore, ReplayLine, ReplaySummary};

use crate::sessions::iteration_line;

/// Reads complete lines appended to a file since the last call.
pub struct Tail {
    path: PathBuf,
    offset: u64,
    /// Bytes after the last newline, decoded once their line is complete
    partial: Vec<u8>,
}

impl Tail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    /// New complete lines. A trailing line without a newline is held back
    /// until it is finished. A file that shrank is read again from the start.
    pub fn read_new_lines(&mut self) -> Result<Vec<String>> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to open {}", self.path.display())),
        };

        let len = file.metadata()?.len();
        if len < self.offset {
            tracing::info!("{} was truncated, reading from the start", self.path.display());
            self.offset = 0;
            self.partial.clear();
        }

        file.seek(SeekFrom::Start(self.offset))?;
        let read = file.read_to_end(&mut self.partial)?;
        self.offset += read as u64;

        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return Ok(Vec::new());
        };

        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);
        Ok(String::from_utf8_lossy(&complete)
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect())
    }
}

/// Follow a replay file until Ctrl-C, then flush every current session.
pub async fn watch_file(
    store: Arc<IterationStore>,
    logger: Arc<Logger>,
    path: &Path,
    poll_interval: Duration,
) -> Result<()> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Flushing current sessions...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let (tx, mut rx) = mpsc::unbounded_channel::<()>();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            if event.kind.is_modify() || event.kind.is_create() {
                let _ = tx.send(());
            }
        }
    })?;

    let watch_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    watcher
        .watch(watch_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", watch_dir.display()))?;

    eprintln!(
        "{} {} {}",
        "Watching".bright_blue(),
        path.display(),
        "(Ctrl-C to stop)".dimmed()
    );

    store.attach(&logger);
    let mut tail = Tail::new(path);
    let mut summary = ReplaySummary::default();

    while !interrupted.load(Ordering::SeqCst) {
        for line in tail.read_new_lines()? {
            feed_line(&store, &logger, &line, &mut summary).await;
        }

        tokio::select! {
            _ = rx.recv() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    for (agent, outcome) in crate::flush_current_sessions(&store).await {
        eprintln!("  {} {:?}", agent.bold(), outcome);
    }
    eprintln!(
        "{} entries, {} session(s) started",
        summary.entries, summary.sessions_started
    );
    Ok(())
}

async fn feed_line(store: &IterationStore, logger: &Logger, line: &str, summary: &mut ReplaySummary) {
    let parsed = match ReplayLine::parse(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!("Skipping line: {:#}", e);
            return;
        }
    };

    let touched = match &parsed {
        ReplayLine::Log(entry) => IterationEvent::from_entry(entry).map(|e| e.iteration_id),
        _ => None,
    };

    apply_line(store, logger, parsed, summary).await;

    if let Some(iteration) = touched.and_then(|id| store.iteration(&id)) {
        println!("{} {}", iteration.agent_id.bold(), iteration_line(&iteration));
    }
}
