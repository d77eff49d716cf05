//! Optional diagnostic hook and a collector implementation
//!
//! A transport takes an `Arc<dyn DiagnosticHook>` at construction and reports
//! state changes, traffic and errors to it. [`DiagnosticsCollector`] turns
//! those reports into bounded session and error histories for a debug panel.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::error::TransportError;
use crate::protocol::ControlMessage;
use crate::state_machine::TransportState;

/// Maximum number of finished sessions to retain
const MAX_SESSION_HISTORY: usize = 50;

/// Maximum number of errors to retain
const MAX_ERROR_HISTORY: usize = 20;

/// Observer of transport internals; every method defaults to a no-op
pub trait DiagnosticHook: Send + Sync {
    fn state_changed(&self, _from: TransportState, _to: TransportState) {}

    fn message_sent(&self, _message: &ControlMessage) {}

    fn message_received(&self, _message: &ControlMessage) {}

    fn error(&self, _error: &TransportError) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOutcome {
    /// Ended by a disconnect after reaching `ready`
    Completed,
    /// Ended by a disconnect before reaching `ready`
    Abandoned,
    /// Ended in the `error` state
    Failed,
}

/// One connect-to-disconnect span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    /// Unix timestamp when `connect()` started (seconds)
    pub started_at: u64,
    /// Time from `connecting` to the first `ready`, if reached
    pub time_to_ready_ms: Option<u64>,
    pub reconnects: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub duration_ms: u64,
    pub outcome: SessionOutcome,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub message: String,
    pub terminal: bool,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsSummary {
    pub total_sessions: u64,
    pub completed_sessions: u64,
    pub failed_sessions: u64,
    pub total_reconnects: u64,
    /// Average time to `ready` across sessions that got there
    pub avg_time_to_ready_ms: u64,
    pub current_state: TransportState,
    pub last_error: Option<ErrorRecord>,
}

struct SessionInProgress {
    session_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    time_to_ready: Option<u64>,
    reconnects: u32,
    messages_sent: u64,
    messages_received: u64,
    last_error: Option<String>,
}

impl SessionInProgress {
    fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: Instant::now(),
            started_at_unix: unix_now(),
            time_to_ready: None,
            reconnects: 0,
            messages_sent: 0,
            messages_received: 0,
            last_error: None,
        }
    }

    fn finish(self, outcome: SessionOutcome) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.to_string(),
            started_at: self.started_at_unix,
            time_to_ready_ms: self.time_to_ready,
            reconnects: self.reconnects,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            outcome,
            error_message: self.last_error,
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Default)]
struct CollectorState {
    /// Newest first
    sessions: VecDeque<SessionRecord>,
    /// Newest first
    errors: VecDeque<ErrorRecord>,
    current: Option<SessionInProgress>,
    state: TransportState,
    total_sessions: u64,
    completed_sessions: u64,
    total_reconnects: u64,
}

impl CollectorState {
    fn finish_session(&mut self, outcome: SessionOutcome) {
        let Some(session) = self.current.take() else {
            return;
        };
        let record = session.finish(outcome.clone());
        log::info!(
            "Diagnostics: session {} ended ({:?}) after {}ms, {} reconnects",
            record.session_id,
            outcome,
            record.duration_ms,
            record.reconnects
        );
        if outcome == SessionOutcome::Completed {
            self.completed_sessions += 1;
        }
        self.sessions.push_front(record);
        while self.sessions.len() > MAX_SESSION_HISTORY {
            self.sessions.pop_back();
        }
    }
}

/// Collects bounded session and error histories
#[derive(Default)]
pub struct DiagnosticsCollector {
    state: Mutex<CollectorState>,
}

impl DiagnosticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn summary(&self) -> DiagnosticsSummary {
        let state = self.lock();
        let ready: Vec<u64> = state
            .sessions
            .iter()
            .filter_map(|s| s.time_to_ready_ms)
            .collect();
        let avg = if ready.is_empty() {
            0
        } else {
            ready.iter().sum::<u64>() / ready.len() as u64
        };

        let failed = state
            .sessions
            .iter()
            .filter(|s| s.outcome == SessionOutcome::Failed)
            .count() as u64;

        DiagnosticsSummary {
            total_sessions: state.total_sessions,
            completed_sessions: state.completed_sessions,
            failed_sessions: failed,
            total_reconnects: state.total_reconnects,
            avg_time_to_ready_ms: avg,
            current_state: state.state,
            last_error: state.errors.front().cloned(),
        }
    }

    /// Finished sessions, newest first
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.lock().sessions.iter().cloned().collect()
    }

    /// Errors, newest first
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.lock().errors.iter().cloned().collect()
    }

    pub fn has_active_session(&self) -> bool {
        self.lock().current.is_some()
    }
}

impl DiagnosticHook for DiagnosticsCollector {
    fn state_changed(&self, from: TransportState, to: TransportState) {
        let mut state = self.lock();
        state.state = to;

        match to {
            TransportState::Connecting if !from.is_active() => {
                if state.current.is_some() {
                    log::warn!("Diagnostics: discarding unfinished session");
                    state.finish_session(SessionOutcome::Abandoned);
                }
                state.current = Some(SessionInProgress::new());
                state.total_sessions += 1;
            }
            TransportState::Ready => {
                if let Some(session) = state.current.as_mut() {
                    if session.time_to_ready.is_none() {
                        session.time_to_ready = Some(session.started_at.elapsed().as_millis() as u64);
                    }
                }
            }
            // A failed retry comes back from connecting; only a lost session counts
            TransportState::Reconnecting
                if matches!(from, TransportState::Connected | TransportState::Ready) =>
            {
                if let Some(session) = state.current.as_mut() {
                    session.reconnects += 1;
                }
                state.total_reconnects += 1;
            }
            TransportState::Disconnected => {
                let reached_ready = state
                    .current
                    .as_ref()
                    .is_some_and(|s| s.time_to_ready.is_some());
                state.finish_session(if reached_ready {
                    SessionOutcome::Completed
                } else {
                    SessionOutcome::Abandoned
                });
            }
            TransportState::Error => state.finish_session(SessionOutcome::Failed),
            _ => {}
        }
    }

    fn message_sent(&self, _message: &ControlMessage) {
        if let Some(session) = self.lock().current.as_mut() {
            session.messages_sent += 1;
        }
    }

    fn message_received(&self, _message: &ControlMessage) {
        if let Some(session) = self.lock().current.as_mut() {
            session.messages_received += 1;
        }
    }

    fn error(&self, error: &TransportError) {
        if error.is_cancellation() {
            return;
        }
        let mut state = self.lock();
        let session_id = state.current.as_mut().map(|s| {
            s.last_error = Some(error.to_string());
            s.session_id.to_string()
        });

        let record = ErrorRecord {
            timestamp: unix_now(),
            message: error.to_string(),
            terminal: error.is_terminal(),
            session_id,
        };
        log::debug!("Diagnostics: recording error - {:?}", record);

        state.errors.push_front(record);
        while state.errors.len() > MAX_ERROR_HISTORY {
            state.errors.pop_back();
        }
    }
}
