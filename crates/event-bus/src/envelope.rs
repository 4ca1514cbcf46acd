//! Typed event envelope exported to external observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskloop_core_types::{EventId, SessionId};

/// Event taxonomy covering step lifecycle, investigation lifecycle, and
/// reasoning/command telemetry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskLoopEventType {
    StepStarted,
    StepCompleted,
    StepFailed,
    InvestigationStarted,
    InvestigationCompleted,
    InvestigationFailed,
    InvestigationPhaseStarted,
    InvestigationPhaseCompleted,
    InvestigationToolStarted,
    InvestigationToolCompleted,
    ElementDiscovered,
    WorkingMemoryUpdated,
    AiReasoningUpdate,
    CommandExecuted,
    ProgressUpdate,
}

impl TaskLoopEventType {
    pub fn is_terminal_step_event(&self) -> bool {
        matches!(self, Self::StepCompleted | Self::StepFailed)
    }
}

/// Immutable event envelope; constructed once at publish time and never
/// mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskLoopEvent {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: TaskLoopEventType,
    pub session_id: SessionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<u32>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TaskLoopEvent {
    /// Build an envelope with a fresh id and a capture-time timestamp.
    pub fn capture(
        event_type: TaskLoopEventType,
        session_id: SessionId,
        step_index: Option<u32>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            event_type,
            session_id,
            step_index,
            payload,
            timestamp: Utc::now(),
        }
    }
}
