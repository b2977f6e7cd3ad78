//! Connection state machine.

use chrono::{DateTime, Utc};
use knight_core::{error::KnightError, event::DisconnectReason};
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Lifecycle phase of the single logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Resolving,
    Connecting,
    Open,
    Closing,
    Reconnecting,
    Terminated,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Resolving => "resolving",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Reconnecting => "reconnecting",
            Self::Terminated => "terminated",
        }
    }

    /// Whether the state machine allows `self -> to`.
    pub fn can_transition(self, to: Phase) -> bool {
        use Phase::*;
        match (self, to) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Idle, Resolving) => true,
            (Resolving, Connecting | Reconnecting | Closing) => true,
            (Connecting, Open | Reconnecting | Closing) => true,
            (Open, Reconnecting | Closing) => true,
            (Reconnecting, Resolving) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state. Mutated only through the methods below.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    phase: Phase,
    retry_count: u32,
    session_id: Option<String>,
    last_activity_at: Option<DateTime<Utc>>,
    terminal_reason: Option<DisconnectReason>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ConnectionState {
    /// Fresh state, optionally with an externally supplied session id.
    pub fn new(session_id: Option<String>) -> Self {
        Self {
            phase: Phase::Idle,
            retry_count: 0,
            session_id,
            last_activity_at: None,
            terminal_reason: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn last_activity_at(&self) -> Option<DateTime<Utc>> {
        self.last_activity_at
    }

    pub fn terminal_reason(&self) -> Option<&DisconnectReason> {
        self.terminal_reason.as_ref()
    }

    /// Move to `to`, rejecting anything the state machine forbids.
    pub fn transition(&mut self, to: Phase) -> Result<(), KnightError> {
        if self.phase == Phase::Terminated {
            return Err(KnightError::Terminated);
        }
        if !self.phase.can_transition(to) {
            return Err(KnightError::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.phase = to;
        Ok(())
    }

    /// Enter `resolving` for a new connection attempt.
    ///
    /// Rejected while an attempt is connecting or open.
    pub fn begin_attempt(&mut self) -> Result<(), KnightError> {
        match self.phase {
            Phase::Connecting | Phase::Open => Err(KnightError::Overlap(self.phase.to_string())),
            _ => self.transition(Phase::Resolving),
        }
    }

    /// Record a successful handshake. Generates the session id on first open.
    pub fn mark_open<F>(&mut self, generate_id: F) -> Result<&str, KnightError>
    where
        F: FnOnce() -> String,
    {
        self.transition(Phase::Open)?;
        self.retry_count = 0;
        self.touch();
        Ok(self.session_id.get_or_insert_with(generate_id).as_str())
    }

    /// Enter `reconnecting` and bump the retry count.
    ///
    /// Returns the count before the increment, which sizes the backoff.
    pub fn schedule_retry(&mut self) -> Result<u32, KnightError> {
        self.transition(Phase::Reconnecting)?;
        let previous = self.retry_count;
        self.retry_count = self.retry_count.saturating_add(1);
        Ok(previous)
    }

    /// Final state. A second call keeps the first reason.
    pub fn terminate(&mut self, reason: Option<DisconnectReason>) {
        if self.phase == Phase::Terminated {
            return;
        }
        self.phase = Phase::Terminated;
        self.terminal_reason = reason;
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Some(Utc::now());
    }
}

/// Shared handle to the state, for readers outside the manager.
#[derive(Debug, Clone, Default)]
pub struct StateHandle(Arc<Mutex<ConnectionState>>);

impl StateHandle {
    pub fn new(state: ConnectionState) -> Self {
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn snapshot(&self) -> ConnectionState {
        self.lock().clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut ConnectionState) -> R) -> R {
        f(&mut self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}
