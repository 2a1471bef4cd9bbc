// Per-host lifecycle state machine with timers and bounded history.
use crate::core::types::{LifecycleState, StateError, TransitionRecord};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Cap on in-memory transition history; oldest entries are evicted.
pub const MAX_HISTORY: usize = 50;

/// Tracked lifecycle of one managed host. Owned exclusively by the
/// Supervisor; everything else sees clones or summaries.
///
/// Invariants upheld here:
/// - transitions follow the guarded table unless forced (forced ones are
///   marked in history),
/// - `startup_started_at` is set exactly while in Starting,
/// - `state_changed_at` never moves backwards,
/// - history is append-only and bounded.
#[derive(Debug, Clone)]
pub struct AppState {
    hostname: String,
    current_state: LifecycleState,
    state_changed_at: DateTime<Utc>,
    startup_started_at: Option<DateTime<Utc>>,
    history: VecDeque<TransitionRecord>,
}

impl AppState {
    /// Fresh app in Stopped, as created on first discovery.
    pub fn new(hostname: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.into(),
            current_state: LifecycleState::Stopped,
            state_changed_at: now,
            startup_started_at: None,
            history: VecDeque::new(),
        }
    }

    /// Rebuild an app from persisted fields. The restored state is entered
    /// through the forced path (marker reason `restored_from_disk`), then the
    /// persisted timestamps are reinstated verbatim.
    pub fn restore(
        hostname: impl Into<String>,
        state: LifecycleState,
        state_changed_at: DateTime<Utc>,
        startup_started_at: Option<DateTime<Utc>>,
        history: Vec<TransitionRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut app = Self::new(hostname, state_changed_at);
        app.history = history.into_iter().collect();
        while app.history.len() > MAX_HISTORY {
            app.history.pop_front();
        }
        app.force_transition_to(state, "restored_from_disk", now);

        app.state_changed_at = state_changed_at;
        app.startup_started_at = if state == LifecycleState::Starting {
            startup_started_at.or(Some(state_changed_at))
        } else {
            None
        };
        app
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn current_state(&self) -> LifecycleState {
        self.current_state
    }

    pub fn state_changed_at(&self) -> DateTime<Utc> {
        self.state_changed_at
    }

    pub fn startup_started_at(&self) -> Option<DateTime<Utc>> {
        self.startup_started_at
    }

    pub fn history(&self) -> &VecDeque<TransitionRecord> {
        &self.history
    }

    /// Guarded transition. Same-state is a no-op; anything outside the
    /// allowed table is a `StateError`.
    pub fn transition_to(
        &mut self,
        to: LifecycleState,
        now: DateTime<Utc>,
    ) -> Result<(), StateError> {
        if to == self.current_state {
            return Ok(());
        }
        if !allowed(self.current_state, to) {
            return Err(StateError::InvalidTransition {
                hostname: self.hostname.clone(),
                from: self.current_state,
                to,
            });
        }
        self.apply(to, None, false, now);
        Ok(())
    }

    /// Transition bypassing the guard, recorded with `forced: true`. Used for
    /// timeouts, sync corrections, and recovery only.
    pub fn force_transition_to(&mut self, to: LifecycleState, reason: &str, now: DateTime<Utc>) {
        self.apply(to, Some(reason.to_string()), true, now);
    }

    /// Recovery hammer: force back to Stopped.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.force_transition_to(LifecycleState::Stopped, "reset", now);
    }

    pub fn active(&self) -> bool {
        matches!(
            self.current_state,
            LifecycleState::Running | LifecycleState::Idle
        )
    }

    pub fn inactive(&self) -> bool {
        matches!(
            self.current_state,
            LifecycleState::Stopped | LifecycleState::Stopping
        )
    }

    pub fn stable(&self) -> bool {
        matches!(
            self.current_state,
            LifecycleState::Stopped | LifecycleState::Running | LifecycleState::Idle
        )
    }

    pub fn transitioning(&self) -> bool {
        matches!(
            self.current_state,
            LifecycleState::Starting | LifecycleState::Stopping
        )
    }

    /// Seconds spent in the current state as of `now`.
    pub fn seconds_in_state(&self, now: DateTime<Utc>) -> i64 {
        (now - self.state_changed_at).num_seconds()
    }

    fn apply(
        &mut self,
        to: LifecycleState,
        reason: Option<String>,
        forced: bool,
        now: DateTime<Utc>,
    ) {
        // state_changed_at is monotone even if the wall clock steps back
        let now = now.max(self.state_changed_at);
        let from = self.current_state;

        self.current_state = to;
        self.state_changed_at = now;
        self.startup_started_at = if to == LifecycleState::Starting {
            Some(now)
        } else {
            None
        };

        self.history.push_back(TransitionRecord {
            from,
            to,
            timestamp: now,
            reason,
            forced,
        });
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
    }
}

fn allowed(from: LifecycleState, to: LifecycleState) -> bool {
    use LifecycleState::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Starting, Running)
            | (Starting, Stopped)
            | (Running, Idle)
            | (Running, Stopping)
            | (Idle, Running)
            | (Idle, Starting)
            | (Idle, Stopping)
            | (Stopping, Stopped)
    )
}
