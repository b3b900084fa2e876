use serde::{Deserialize, Serialize};
use std::fmt;

/// Oldest transitions are forgotten past this many entries.
const HISTORY_LIMIT: usize = 64;

// ---------------------------------------------------------------------------
// EngineState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineState::Stopped => "Stopped",
            EngineState::Starting => "Starting",
            EngineState::Running => "Running",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// EngineEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineEvent {
    Start,
    SessionReady,
    SessionFailed,
    Stop,
    /// Auth expired and could not be recovered.
    AuthLost,
}

impl fmt::Display for EngineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineEvent::Start => "Start",
            EngineEvent::SessionReady => "SessionReady",
            EngineEvent::SessionFailed => "SessionFailed",
            EngineEvent::Stop => "Stop",
            EngineEvent::AuthLost => "AuthLost",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: EngineState,
        event: EngineEvent,
    },
}

// ---------------------------------------------------------------------------
// EngineStateMachine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineStateMachine {
    current: EngineState,
    history: Vec<(EngineState, EngineEvent, EngineState)>,
}

impl EngineStateMachine {
    /// Create a new state machine starting in `Stopped`.
    pub fn new() -> Self {
        Self {
            current: EngineState::Stopped,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.current
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> &[(EngineState, EngineEvent, EngineState)] {
        &self.history
    }

    /// Attempt a state transition driven by `event`.
    ///
    /// Valid transitions:
    /// - Stopped  + Start         -> Starting
    /// - Starting + SessionReady  -> Running
    /// - Starting + SessionFailed -> Stopped
    /// - Starting + Stop          -> Stopped
    /// - Running  + Stop          -> Stopped
    /// - Running  + AuthLost      -> Stopped
    pub fn transition(&mut self, event: EngineEvent) -> Result<EngineState, StateMachineError> {
        let next = match (self.current, event) {
            (EngineState::Stopped, EngineEvent::Start) => EngineState::Starting,
            (EngineState::Starting, EngineEvent::SessionReady) => EngineState::Running,
            (EngineState::Starting, EngineEvent::SessionFailed) => EngineState::Stopped,
            (EngineState::Starting, EngineEvent::Stop) => EngineState::Stopped,
            (EngineState::Running, EngineEvent::Stop) => EngineState::Stopped,
            (EngineState::Running, EngineEvent::AuthLost) => EngineState::Stopped,
            _ => {
                return Err(StateMachineError::InvalidTransition {
                    state: self.current,
                    event,
                });
            }
        };

        let from = self.current;
        self.current = next;
        if self.history.len() == HISTORY_LIMIT {
            self.history.remove(0);
        }
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "engine state transition");
        Ok(next)
    }

    pub fn can_transition(&self, event: EngineEvent) -> bool {
        matches!(
            (self.current, event),
            (EngineState::Stopped, EngineEvent::Start)
                | (EngineState::Starting, EngineEvent::SessionReady)
                | (EngineState::Starting, EngineEvent::SessionFailed)
                | (EngineState::Starting, EngineEvent::Stop)
                | (EngineState::Running, EngineEvent::Stop)
                | (EngineState::Running, EngineEvent::AuthLost)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self.current, EngineState::Starting | EngineState::Running)
    }
}

impl Default for EngineStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
