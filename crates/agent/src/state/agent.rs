//! Agent state — lifecycle states, the transition table and the shared cell
//! that publishes them.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

/// Lifecycle of one agent instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Terminal: the instance cannot be started again.
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Created => "created",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
            AgentState::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        use AgentState::*;
        match (self, next) {
            (Failed, _) | (Stopped, _) => false,
            (_, Failed) => true,
            (Created, Starting)
            | (Starting, Running)
            | (Starting, Stopping)
            | (Running, Stopping)
            | (Stopping, Stopped) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Stopped | AgentState::Failed)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state plus a broadcast of every change.
pub struct StateCell {
    tx: watch::Sender<AgentState>,
    since: Mutex<DateTime<Utc>>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(AgentState::Created);
        Self {
            tx,
            since: Mutex::new(Utc::now()),
        }
    }

    pub fn get(&self) -> AgentState {
        *self.tx.borrow()
    }

    /// Move to `next` if the table allows it. Returns false (and leaves the
    /// state alone) otherwise.
    pub fn transition(&self, next: AgentState) -> bool {
        let mut from = None;
        let changed = self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                from = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });
        if let Some(from) = from {
            *self.since.lock() = Utc::now();
            debug!("Agent state {} -> {}", from, next);
        }
        changed
    }

    /// When the current state was entered.
    pub fn since(&self) -> DateTime<Utc> {
        *self.since.lock()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.tx.subscribe()
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use AgentState::*;

    #[test]
    fn test_happy_path_transitions() {
        assert!(Created.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
    }

    #[test]
    fn test_failed_is_terminal() {
        for next in [Created, Starting, Running, Stopping, Stopped, Failed] {
            assert!(!Failed.can_transition_to(next), "failed -> {}", next);
        }
        assert!(Failed.is_terminal());
    }

    #[test]
    fn test_any_live_state_can_fail() {
        for from in [Created, Starting, Running, Stopping] {
            assert!(from.can_transition_to(Failed), "{} -> failed", from);
        }
    }

    #[test]
    fn test_no_restart_after_stop() {
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Created.can_transition_to(Running));
    }

    #[tokio::test]
    async fn test_cell_publishes_changes() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();

        let created_at = cell.since();
        assert!(cell.transition(Starting));
        assert!(!cell.transition(Stopped));
        assert!(cell.since() >= created_at);
        assert_eq!(cell.get(), Starting);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Starting);

        assert!(cell.transition(Failed));
        let state = *rx.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(state, Failed);
    }
}
