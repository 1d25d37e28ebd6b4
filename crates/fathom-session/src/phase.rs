//! Workflow phase machine.
//!
//! Six phases form a ring with single-successor transitions; the step counter
//! advances once per completed lap. Each phase carries a fixed allowlist of
//! operation names; `transition` is legal everywhere.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fathom_core::DebugError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Planning,
    Coding,
    Breakpointing,
    Debugging,
    Explaining,
    Confirming,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Planning,
        Phase::Coding,
        Phase::Breakpointing,
        Phase::Debugging,
        Phase::Explaining,
        Phase::Confirming,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Planning => "PLANNING",
            Phase::Coding => "CODING",
            Phase::Breakpointing => "BREAKPOINTING",
            Phase::Debugging => "DEBUGGING",
            Phase::Explaining => "EXPLAINING",
            Phase::Confirming => "CONFIRMING",
        }
    }

    /// The single phase reachable from this one.
    pub fn successor(self) -> Phase {
        match self {
            Phase::Planning => Phase::Coding,
            Phase::Coding => Phase::Breakpointing,
            Phase::Breakpointing => Phase::Debugging,
            Phase::Debugging => Phase::Explaining,
            Phase::Explaining => Phase::Confirming,
            Phase::Confirming => Phase::Planning,
        }
    }

    /// Operation names legal while this phase is current.
    pub fn allowed_tools(self) -> &'static [&'static str] {
        match self {
            Phase::Planning => &["read", "glob", "grep", "task", "transition"],
            Phase::Coding => &[
                "read",
                "glob",
                "grep",
                "edit",
                "write",
                "bash",
                "apply_patch",
                "transition",
            ],
            Phase::Breakpointing => &[
                "set_breakpoints",
                "remove_breakpoints",
                "list_breakpoints",
                "read",
                "transition",
            ],
            Phase::Debugging => &[
                "start_debug_session",
                "continue",
                "step_over",
                "step_into",
                "step_out",
                "get_variables",
                "get_call_stack",
                "evaluate",
                "list_breakpoints",
                "transition",
            ],
            Phase::Explaining => &["transition"],
            Phase::Confirming => &["stop_debug_session", "transition"],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = PhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| PhaseError::UnknownPhase(s.to_string()))
    }
}

pub fn is_tool_allowed(phase: Phase, tool: &str) -> bool {
    phase.allowed_tools().contains(&tool)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseError {
    #[error("Cannot transition from {from} to {to}. Valid transitions: {valid}")]
    InvalidTransition {
        from: Phase,
        to: Phase,
        valid: Phase,
    },

    #[error("unknown phase: {0}")]
    UnknownPhase(String),
}

impl From<PhaseError> for DebugError {
    fn from(err: PhaseError) -> Self {
        DebugError::State(err.to_string())
    }
}

/// Workflow position of one debug session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseState {
    pub session_id: String,
    pub current_phase: Phase,
    pub current_step: u32,
    pub total_steps: Option<u32>,
    pub step_descriptions: Vec<String>,
    pub auto_confirm: bool,
}

impl PhaseState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            current_phase: Phase::Planning,
            current_step: 0,
            total_steps: None,
            step_descriptions: Vec::new(),
            auto_confirm: false,
        }
    }

    /// Move to `to` when it is the current phase's successor. The step
    /// counter advances only on the lap-completing CONFIRMING -> PLANNING
    /// edge.
    pub fn transition(&mut self, to: Phase) -> Result<(), PhaseError> {
        let from = self.current_phase;
        if from.successor() != to {
            return Err(PhaseError::InvalidTransition {
                from,
                to,
                valid: from.successor(),
            });
        }
        if from == Phase::Confirming && to == Phase::Planning {
            self.current_step += 1;
        }
        self.current_phase = to;
        Ok(())
    }
}

/// Process-wide phase states, keyed by session id. Entries are never
/// collected implicitly; call [`clear`](Self::clear) when a session ends.
#[derive(Debug, Default)]
pub struct PhaseRegistry {
    states: Mutex<HashMap<String, PhaseState>>,
}

impl PhaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the session's phase state, creating a fresh one at
    /// PLANNING when none exists.
    pub fn get_or_create(&self, session_id: &str) -> PhaseState {
        self.states
            .lock()
            .expect("poisoned")
            .entry(session_id.to_string())
            .or_insert_with(|| PhaseState::new(session_id))
            .clone()
    }

    /// Transition the session's state in place and return a snapshot.
    pub fn transition(&self, session_id: &str, to: Phase) -> Result<PhaseState, PhaseError> {
        let mut states = self.states.lock().expect("poisoned");
        let state = states
            .entry(session_id.to_string())
            .or_insert_with(|| PhaseState::new(session_id));
        state.transition(to)?;
        Ok(state.clone())
    }

    /// Mutate the session's state (plan metadata, auto-confirm).
    pub fn update(&self, session_id: &str, mutate: impl FnOnce(&mut PhaseState)) -> PhaseState {
        let mut states = self.states.lock().expect("poisoned");
        let state = states
            .entry(session_id.to_string())
            .or_insert_with(|| PhaseState::new(session_id));
        mutate(state);
        state.clone()
    }

    pub fn clear(&self, session_id: &str) {
        self.states.lock().expect("poisoned").remove(session_id);
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.states.lock().expect("poisoned").contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn starts_at_planning_with_step_zero() {
        let state = PhaseState::new("session-1");
        assert_eq!(state.current_phase, Phase::Planning);
        assert_eq!(state.current_step, 0);
        assert_eq!(state.total_steps, None);
        assert!(!state.auto_confirm);
    }

    #[test]
    fn only_the_successor_is_reachable() {
        let mut state = PhaseState::new("session-1");
        state.transition(Phase::Coding).unwrap();
        assert_eq!(state.current_step, 0);

        let err = state.transition(Phase::Debugging).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot transition from CODING to DEBUGGING. Valid transitions: BREAKPOINTING"
        );
        // A failed transition leaves the state untouched.
        assert_eq!(state.current_phase, Phase::Coding);
    }

    #[test]
    fn step_advances_only_on_completed_laps() {
        let mut state = PhaseState::new("session-1");
        for lap in 1..=2 {
            for phase in [
                Phase::Coding,
                Phase::Breakpointing,
                Phase::Debugging,
                Phase::Explaining,
                Phase::Confirming,
            ] {
                state.transition(phase).unwrap();
                assert_eq!(state.current_step, lap - 1);
            }
            state.transition(Phase::Planning).unwrap();
            assert_eq!(state.current_step, lap);
        }
    }

    #[test]
    fn transition_is_legal_in_every_phase() {
        for phase in Phase::ALL {
            assert!(is_tool_allowed(phase, "transition"), "{phase}");
        }
    }

    #[test]
    fn allowlists_gate_debug_operations() {
        assert!(is_tool_allowed(Phase::Debugging, "step_over"));
        assert!(is_tool_allowed(Phase::Debugging, "evaluate"));
        assert!(!is_tool_allowed(Phase::Coding, "step_over"));
        assert!(is_tool_allowed(Phase::Breakpointing, "set_breakpoints"));
        assert!(!is_tool_allowed(Phase::Debugging, "set_breakpoints"));
        assert!(is_tool_allowed(Phase::Confirming, "stop_debug_session"));
        assert!(!is_tool_allowed(Phase::Explaining, "read"));
        assert!(is_tool_allowed(Phase::Coding, "apply_patch"));
    }

    #[test]
    fn registry_returns_existing_state() {
        let registry = PhaseRegistry::new();
        registry.transition("session-1", Phase::Coding).unwrap();

        let state = registry.get_or_create("session-1");
        assert_eq!(state.current_phase, Phase::Coding);

        let fresh = registry.get_or_create("session-2");
        assert_eq!(fresh.current_phase, Phase::Planning);
    }

    #[test]
    fn clear_drops_the_entry() {
        let registry = PhaseRegistry::new();
        registry.get_or_create("session-1");
        assert!(registry.contains("session-1"));

        registry.clear("session-1");
        assert!(!registry.contains("session-1"));

        // Re-creation starts over at PLANNING.
        let state = registry.get_or_create("session-1");
        assert_eq!(state.current_phase, Phase::Planning);
        assert_eq!(state.current_step, 0);
    }

    #[test]
    fn phases_parse_from_their_names() {
        assert_eq!(Phase::from_str("PLANNING").unwrap(), Phase::Planning);
        assert_eq!(Phase::from_str("debugging").unwrap(), Phase::Debugging);
        assert!(Phase::from_str("SHIPPING").is_err());
    }

    #[test]
    fn serializes_in_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&Phase::Breakpointing).unwrap(),
            "\"BREAKPOINTING\""
        );
    }
}
