//! Result and state shapes of one step execution.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskloop_core_types::ExecPhase;

use crate::task_loop::validator::CommandKind;

/// Per-call overrides; anything unset falls back to the engine config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StepOptions {
    pub max_iterations: Option<u32>,
    /// Wall-clock budget for the whole step.
    pub timeout_ms: Option<u64>,
    /// Wall-clock budget for each investigation cycle.
    pub investigation_timeout_ms: Option<u64>,
}

/// One command the loop actually dispatched to the page backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutedCommand {
    pub command: CommandKind,
    pub params: Value,
    /// Iteration (1-based) that issued the command.
    pub iteration: u32,
}

/// Outcome of one step, returned to the caller and mirrored onto the event
/// stream. Accumulated context (commands, results, reasoning) is kept even
/// when the step fails.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub step_index: u32,
    pub iterations: u32,
    pub executed_commands: Vec<ExecutedCommand>,
    pub command_results: Vec<Value>,
    pub reasoning: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_page_state: Option<Value>,
}

/// Live phase/iteration tracker for one step, mirrored into the registry.
#[derive(Clone, Debug)]
pub struct ExecutionState {
    pub phase: ExecPhase,
    pub iteration: u32,
    pub reflections_used: u32,
    pub started_at: Instant,
}

impl ExecutionState {
    pub fn new() -> Self {
        Self {
            phase: ExecPhase::Initializing,
            iteration: 0,
            reflections_used: 0,
            started_at: Instant::now(),
        }
    }

    /// Terminal phases are sticky.
    pub fn advance(&mut self, phase: ExecPhase) {
        if !self.phase.is_terminal() {
            self.phase = phase;
        }
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_phase_is_sticky() {
        let mut state = ExecutionState::new();
        state.advance(ExecPhase::QueryingReasoner);
        assert_eq!(state.phase, ExecPhase::QueryingReasoner);
        state.advance(ExecPhase::Failed);
        state.advance(ExecPhase::ExecutingCommand);
        assert_eq!(state.phase, ExecPhase::Failed);
    }
}
