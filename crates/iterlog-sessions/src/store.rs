use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Utc};
use iterlog_db::KvStore;
use iterlog_logging::{ListenerId, LogEntry, Logger};
use serde::Serialize;

use crate::archive::SessionArchive;
use crate::event::IterationEvent;
use crate::stats::{self, DEFAULT_IMAGE_ESTIMATE_BYTES};
use crate::types::{EndOutcome, Iteration, Session, StorageUsage, ToolCall};

/// Default number of events held while session pointers are still loading.
pub const DEFAULT_PENDING_CAPACITY: usize = 512;

/// Every in-memory iteration, keyed by iteration id.
pub type IterationSnapshot = HashMap<String, Iteration>;

type StoreListener = Arc<dyn Fn(&IterationSnapshot) + Send + Sync>;

/// Tunables for [`IterationStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Bytes counted per image when a sensor reading has no recorded size
    pub image_estimate_bytes: u64,
    /// Events without a resolvable session kept until pointers are loaded
    pub pending_capacity: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            image_estimate_bytes: DEFAULT_IMAGE_ESTIMATE_BYTES,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
        }
    }
}

/// Diagnostic dump of the store's internal state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDebug {
    pub current_sessions: BTreeMap<String, String>,
    pub counters: BTreeMap<String, u32>,
    /// In-memory iteration count per session id
    pub iterations_by_session: BTreeMap<String, usize>,
    pub pending_events: usize,
    pub pointers_loaded: bool,
    pub flushing: Vec<String>,
    pub listeners: usize,
}

#[derive(Default)]
struct StoreState {
    iterations: IterationSnapshot,
    /// agent id -> current session id
    current_sessions: HashMap<String, String>,
    /// session id -> highest iteration number handed out
    counters: HashMap<String, u32>,
    pending: VecDeque<IterationEvent>,
    pointers_loaded: bool,
    /// agents with an end-of-session flush in flight
    flushing: HashSet<String>,
}

impl StoreState {
    /// Apply one event. Returns whether anything changed.
    fn apply(&mut self, event: IterationEvent, pending_capacity: usize) -> bool {
        if !self.iterations.contains_key(&event.iteration_id) {
            let Some(session_id) = self.current_sessions.get(&event.agent_id).cloned() else {
                self.hold_or_drop(event, pending_capacity);
                return false;
            };

            let counter = self.counters.entry(session_id.clone()).or_insert(0);
            *counter += 1;
            let iteration = Iteration::new(
                event.iteration_id.clone(),
                event.agent_id.clone(),
                session_id,
                *counter,
                event.timestamp,
            );
            self.iterations.insert(event.iteration_id.clone(), iteration);
        }

        if let Some(iteration) = self.iterations.get_mut(&event.iteration_id) {
            iteration.apply(&event);
        }
        true
    }

    fn hold_or_drop(&mut self, event: IterationEvent, capacity: usize) {
        if self.pointers_loaded || capacity == 0 {
            tracing::debug!(
                "dropping event for iteration {}: agent {} has no current session",
                event.iteration_id,
                event.agent_id
            );
            return;
        }

        if self.pending.len() >= capacity {
            if let Some(evicted) = self.pending.pop_front() {
                tracing::debug!("pending queue full, dropping event for {}", evicted.iteration_id);
            }
        }
        self.pending.push_back(event);
    }

    /// Re-apply held events whose agent now has a session. The rest stay
    /// queued, or are dropped once pointers are loaded.
    fn replay_pending(&mut self, pending_capacity: usize) -> bool {
        let held = std::mem::take(&mut self.pending);
        let mut changed = false;
        for event in held {
            if self.current_sessions.contains_key(&event.agent_id)
                || self.iterations.contains_key(&event.iteration_id)
            {
                changed |= self.apply(event, pending_capacity);
            } else {
                self.hold_or_drop(event, pending_capacity);
            }
        }
        changed
    }

    fn is_current(&self, iteration: &Iteration) -> bool {
        self.current_sessions.get(&iteration.agent_id) == Some(&iteration.session_id)
    }

    fn current_iterations(&self, agent_id: &str) -> Vec<&Iteration> {
        let Some(session_id) = self.current_sessions.get(agent_id) else {
            return Vec::new();
        };
        let mut iterations: Vec<&Iteration> = self
            .iterations
            .values()
            .filter(|i| i.agent_id == agent_id && &i.session_id == session_id)
            .collect();
        iterations.sort_by_key(|i| i.session_iteration_number);
        iterations
    }

    /// Group every in-memory iteration of the agent into sessions, the
    /// current one first. Older sessions only exist here if an earlier
    /// flush failed.
    fn collect_sessions(&self, agent_id: &str, current: &str) -> Vec<Session> {
        let mut grouped: BTreeMap<&str, Vec<Iteration>> = BTreeMap::new();
        grouped.entry(current).or_default();
        for iteration in self.iterations.values().filter(|i| i.agent_id == agent_id) {
            grouped
                .entry(iteration.session_id.as_str())
                .or_default()
                .push(iteration.clone());
        }

        let now = Utc::now();
        let mut sessions: Vec<Session> = grouped
            .into_iter()
            .map(|(session_id, iterations)| build_session(agent_id, session_id, iterations, now))
            .collect();
        sessions.sort_by_key(|s| s.session_id != current);
        sessions
    }

    /// In-memory iterations of one session, if there are any.
    fn session_remainder(&self, agent_id: &str, session_id: &str) -> Option<Session> {
        let iterations: Vec<Iteration> = self
            .iterations
            .values()
            .filter(|i| i.agent_id == agent_id && i.session_id == session_id)
            .cloned()
            .collect();
        if iterations.is_empty() {
            return None;
        }
        Some(build_session(agent_id, session_id, iterations, Utc::now()))
    }

    fn purge(&mut self, sessions: &[Session]) {
        for session in sessions {
            for iteration in &session.iterations {
                self.iterations.remove(&iteration.id);
            }
        }
    }

    fn pointer_table(&self) -> HashMap<String, String> {
        self.current_sessions.clone()
    }
}

fn build_session(
    agent_id: &str,
    session_id: &str,
    mut iterations: Vec<Iteration>,
    now: DateTime<Utc>,
) -> Session {
    iterations.sort_by_key(|i| i.session_iteration_number);
    Session {
        session_id: session_id.to_string(),
        agent_id: agent_id.to_string(),
        start_time: iterations.first().map(|i| i.start_time).unwrap_or(now),
        end_time: Some(now),
        iterations,
    }
}

/// Aggregates iteration events into per-session records and archives
/// sessions when they end.
///
/// Construct once and share as `Arc<IterationStore>`. Event handling is
/// synchronous; only storage access is async.
pub struct IterationStore {
    archive: SessionArchive,
    options: StoreOptions,
    state: Mutex<StoreState>,
    listeners: Mutex<Vec<(u64, StoreListener)>>,
    next_listener: AtomicU64,
}

/// Handle for a registered store listener.
pub struct Subscription {
    id: u64,
    store: Weak<IterationStore>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving updates.
    pub fn cancel(self) {
        if let Some(store) = self.store.upgrade() {
            store.unsubscribe(self.id);
        }
    }
}

impl IterationStore {
    /// Create a store whose pointers have not been loaded yet. Events for
    /// agents without a session are held until [`Self::load_pointers`] runs.
    pub fn new(store: Arc<dyn KvStore>, options: StoreOptions) -> Self {
        Self {
            archive: SessionArchive::new(store),
            options,
            state: Mutex::new(StoreState::default()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Create a store and load persisted session pointers.
    pub async fn open(store: Arc<dyn KvStore>, options: StoreOptions) -> Arc<Self> {
        let this = Arc::new(Self::new(store, options));
        this.load_pointers().await;
        this
    }

    /// Subscribe to a logger. Every entry is routed through [`Self::handle`].
    pub fn attach(self: &Arc<Self>, logger: &Logger) -> ListenerId {
        let store = Arc::clone(self);
        logger.add_listener(move |entry| store.handle(entry))
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self) {
        let listeners: Vec<StoreListener> = match self.listeners.lock() {
            Ok(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, l)| Arc::clone(l)).collect(),
        };
        if listeners.is_empty() {
            return;
        }

        let snapshot = self.state().iterations.clone();
        for listener in listeners {
            listener(&snapshot);
        }
    }

    // ------------------------------------------------------------------
    // Event aggregation
    // ------------------------------------------------------------------

    /// Fold one log entry into the iteration map. Entries without an
    /// iteration id are ignored.
    pub fn handle(&self, entry: &LogEntry) {
        let Some(event) = IterationEvent::from_entry(entry) else {
            return;
        };

        let changed = self.state().apply(event, self.options.pending_capacity);
        if changed {
            self.notify();
        }
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    /// Populate the pointer table from storage. Pointers set in this run
    /// take precedence over stored ones.
    pub async fn load_pointers(&self) {
        let stored = self.archive.load_pointers().await;

        let changed = {
            let mut state = self.state();
            for (agent_id, session_id) in stored {
                state.current_sessions.entry(agent_id).or_insert(session_id);
            }
            state.pointers_loaded = true;
            state.replay_pending(self.options.pending_capacity)
        };

        tracing::debug!("session pointers loaded");
        if changed {
            self.notify();
        }
    }

    /// Make `session_id` the agent's current session.
    ///
    /// A different session still current for the agent is flushed first.
    /// Restarting the current session is a no-op.
    pub async fn start_session(&self, agent_id: &str, session_id: &str) {
        let previous = self.state().current_sessions.get(agent_id).cloned();
        match previous {
            Some(ref prev) if prev == session_id => {
                tracing::debug!("session {} already current for {}", session_id, agent_id);
                return;
            }
            Some(prev) => {
                let outcome = self.end_session(agent_id).await;
                if !outcome.is_archived() {
                    tracing::warn!(
                        "previous session {} of {} was not archived ({:?}); it stays in memory",
                        prev,
                        agent_id,
                        outcome
                    );
                }
            }
            None => {}
        }

        let pointers = {
            let mut state = self.state();
            state
                .current_sessions
                .insert(agent_id.to_string(), session_id.to_string());
            state.counters.insert(session_id.to_string(), 0);
            state.replay_pending(self.options.pending_capacity);
            state.pointer_table()
        };

        tracing::info!("started session {} for {}", session_id, agent_id);
        self.archive.save_pointers(&pointers).await;
        self.notify();
    }

    /// Archive the agent's current session and drop it from memory.
    ///
    /// The in-memory iterations are removed only after the archive write
    /// succeeds; on failure they stay and [`EndOutcome::Retained`] is
    /// returned. Iterations the session gains while a write is in flight
    /// are archived by a follow-up write before the pointer is cleared.
    pub async fn end_session(&self, agent_id: &str) -> EndOutcome {
        let (session_id, mut batch) = {
            let mut state = self.state();
            let Some(session_id) = state.current_sessions.get(agent_id).cloned() else {
                return EndOutcome::NoSession;
            };
            if !state.flushing.insert(agent_id.to_string()) {
                return EndOutcome::InProgress;
            }
            let sessions = state.collect_sessions(agent_id, &session_id);
            (session_id, sessions)
        };

        let mut flushed: HashSet<String> = HashSet::new();
        let mut archived = 0;

        let pointers = loop {
            let written = self
                .archive
                .archive_sessions(agent_id, &session_id, &batch)
                .await;

            let mut state = self.state();
            if let Err(e) = written {
                state.flushing.remove(agent_id);
                drop(state);
                tracing::error!(
                    "Failed to archive session {} for {}: {}",
                    session_id,
                    agent_id,
                    e
                );
                return EndOutcome::Retained { session_id };
            }

            state.purge(&batch);
            for session in &batch {
                flushed.insert(session.session_id.clone());
                if session.session_id == session_id {
                    archived += session.iterations.len();
                }
            }

            match state.session_remainder(agent_id, &session_id) {
                Some(late) => {
                    tracing::debug!(
                        "{} iteration(s) reached session {} during its flush",
                        late.iterations.len(),
                        session_id
                    );
                    batch = vec![late];
                }
                None => {
                    for id in &flushed {
                        state.counters.remove(id);
                    }
                    if state.current_sessions.get(agent_id) == Some(&session_id) {
                        state.current_sessions.remove(agent_id);
                    }
                    state.flushing.remove(agent_id);
                    break state.pointer_table();
                }
            }
        };

        tracing::info!("ended session {} for {}", session_id, agent_id);
        self.archive.save_pointers(&pointers).await;
        self.notify();
        EndOutcome::Archived {
            session_id,
            iterations: archived,
        }
    }

    /// Delete the agent's archive and empty its current session. The
    /// session itself stays current.
    pub async fn clear_all_history(&self, agent_id: &str) {
        self.archive.clear_history(agent_id).await;

        {
            let mut state = self.state();
            if let Some(session_id) = state.current_sessions.get(agent_id).cloned() {
                state
                    .iterations
                    .retain(|_, i| !(i.agent_id == agent_id && i.session_id == session_id));
                state.counters.insert(session_id, 0);
            }
        }

        self.notify();
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn current_session(&self, agent_id: &str) -> Option<String> {
        self.state().current_sessions.get(agent_id).cloned()
    }

    /// Iterations of the agent's current session, in session order.
    pub fn iterations_for_agent(&self, agent_id: &str) -> Vec<Iteration> {
        self.state()
            .current_iterations(agent_id)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Look up an iteration belonging to its agent's current session.
    pub fn iteration(&self, id: &str) -> Option<Iteration> {
        let state = self.state();
        state
            .iterations
            .get(id)
            .filter(|i| state.is_current(i))
            .cloned()
    }

    /// Up to `limit` tool calls, newest first, across iterations.
    pub fn last_tools(&self, agent_id: &str, limit: usize) -> Vec<ToolCall> {
        self.state()
            .current_iterations(agent_id)
            .into_iter()
            .rev()
            .flat_map(|i| i.tools.iter().rev())
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn tools_from_last_iteration(&self, agent_id: &str) -> Vec<ToolCall> {
        self.state()
            .current_iterations(agent_id)
            .last()
            .map(|i| i.tools.clone())
            .unwrap_or_default()
    }

    pub async fn historical_sessions(&self, agent_id: &str) -> Vec<Session> {
        self.archive.historical_sessions(agent_id).await
    }

    /// Estimated footprint of the current session, and of the current
    /// session plus everything archived for the agent.
    pub async fn storage_usage(&self, agent_id: &str) -> StorageUsage {
        let estimate = self.options.image_estimate_bytes;
        let current = {
            let state = self.state();
            stats::iterations_bytes(state.current_iterations(agent_id), estimate)
        };
        let history = self.archive.historical_sessions(agent_id).await;
        let archived = stats::sessions_bytes(&history, estimate);

        StorageUsage {
            current_session_mb: stats::bytes_to_mb(current),
            total_history_mb: stats::bytes_to_mb(current + archived),
        }
    }

    pub fn debug(&self) -> StoreDebug {
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        };
        let state = self.state();

        let mut iterations_by_session = BTreeMap::new();
        for iteration in state.iterations.values() {
            *iterations_by_session
                .entry(iteration.session_id.clone())
                .or_insert(0) += 1;
        }
        let mut flushing: Vec<String> = state.flushing.iter().cloned().collect();
        flushing.sort();

        StoreDebug {
            current_sessions: state
                .current_sessions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            counters: state.counters.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            iterations_by_session,
            pending_events: state.pending.len(),
            pointers_loaded: state.pointers_loaded,
            flushing,
            listeners,
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Register a callback invoked with the full iteration map after every
    /// change.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&IterationSnapshot) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        match self.listeners.lock() {
            Ok(mut listeners) => listeners.push((id, Arc::new(listener))),
            Err(poisoned) => poisoned.into_inner().push((id, Arc::new(listener))),
        }
        Subscription {
            id,
            store: Arc::downgrade(self),
        }
    }

    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }
}
