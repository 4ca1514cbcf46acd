use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use taskloop_core_types::{ErrorKind, ExecPhase, SessionId, SessionStatus};

/// Registry-wide limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Hard cap on concurrently registered sessions.
    pub max_sessions: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_sessions: 256 }
    }
}

/// Optional caller-supplied session configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub label: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Last-known state of one step execution, written by the loop.
#[derive(Clone, Debug)]
pub struct StepSnapshot {
    pub phase: ExecPhase,
    pub iteration: u32,
    pub updated_at: Instant,
}

/// Per-session counters; read-only snapshot, no effect on control flow.
#[derive(Clone, Debug, Default)]
pub struct SessionMetrics {
    pub steps_attempted: u64,
    pub steps_completed: u64,
    pub total_iterations: u64,
    pub reflections_used: u64,
    pub errors_by_kind: HashMap<ErrorKind, u64>,
}

impl SessionMetrics {
    pub fn record_outcome(&mut self, outcome: &StepOutcome) {
        self.steps_attempted += 1;
        if outcome.completed {
            self.steps_completed += 1;
        }
        self.total_iterations += outcome.iterations as u64;
        self.reflections_used += outcome.reflections as u64;
        if let Some(kind) = outcome.error_kind {
            *self.errors_by_kind.entry(kind).or_insert(0) += 1;
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.steps_attempted == 0 {
            return 0.0;
        }
        self.steps_completed as f64 / self.steps_attempted as f64
    }
}

/// Outcome summary handed to the registry when a step finishes.
#[derive(Clone, Debug)]
pub struct StepOutcome {
    pub step_index: u32,
    pub completed: bool,
    pub iterations: u32,
    pub reflections: u32,
    pub error_kind: Option<ErrorKind>,
}

/// Per-workflow session context held by the registry.
#[derive(Clone, Debug)]
pub struct WorkflowSession {
    pub session_id: SessionId,
    pub workflow_session_id: String,
    pub status: SessionStatus,
    pub config: SessionConfig,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub execution_states: HashMap<u32, StepSnapshot>,
    pub metrics: SessionMetrics,
}

impl WorkflowSession {
    pub fn new(workflow_session_id: impl Into<String>, config: SessionConfig) -> (SessionId, Self) {
        let id = SessionId::new();
        let now = Instant::now();
        let ctx = Self {
            session_id: id.clone(),
            workflow_session_id: workflow_session_id.into(),
            status: SessionStatus::Initializing,
            config,
            created_at: now,
            last_activity: now,
            execution_states: HashMap::new(),
            metrics: SessionMetrics::default(),
        };
        (id, ctx)
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Status transition table: monotonic except Active/Paused; terminal states
/// only move to Cleanup.
pub fn can_transition(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::*;
    if from == to {
        return true;
    }
    match from {
        Initializing => matches!(to, Active | Failed | Cancelled | Cleanup),
        Active => matches!(to, Paused | Completed | Failed | Cancelled | Cleanup),
        Paused => matches!(to, Active | Completed | Failed | Cancelled | Cleanup),
        Completed | Failed | Cancelled => matches!(to, Cleanup),
        Cleanup => false,
    }
}
