//! Shared primitives for the taskloop execution core.
//!
//! Holds the identifier newtypes, the phase/status vocabulary shared between
//! the session registry and the execution loop, and the common error type
//! carrying category plus session/step context.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Engine-internal session identifier, generated at session creation.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned to every published event envelope.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a workflow session.
///
/// Transitions are monotonic except the Active/Paused pair; terminal states
/// (Completed, Failed, Cancelled) are never left again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Cleanup,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Cleanup => "cleanup",
        };
        f.write_str(label)
    }
}

/// Phase of a single step execution inside the ACT-REFLECT loop.
///
/// Completed and Failed are terminal and never revisited.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecPhase {
    Initializing,
    GeneratingPrompt,
    QueryingReasoner,
    ProcessingResponse,
    Investigating,
    ExecutingCommand,
    Reflecting,
    Validating,
    Completed,
    Failed,
}

impl ExecPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExecPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Initializing => "initializing",
            Self::GeneratingPrompt => "generating_prompt",
            Self::QueryingReasoner => "querying_reasoner",
            Self::ProcessingResponse => "processing_response",
            Self::Investigating => "investigating",
            Self::ExecutingCommand => "executing_command",
            Self::Reflecting => "reflecting",
            Self::Validating => "validating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Phase of the page-investigation sub-cycle, attempted in declaration order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationPhase {
    InitialAssessment,
    FocusedExploration,
    SelectorDetermination,
}

impl InvestigationPhase {
    /// Next phase in the fixed order, or None after SelectorDetermination.
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::InitialAssessment => Some(Self::FocusedExploration),
            Self::FocusedExploration => Some(Self::SelectorDetermination),
            Self::SelectorDetermination => None,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, Self::SelectorDetermination)
    }
}

impl fmt::Display for InvestigationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::InitialAssessment => "initial_assessment",
            Self::FocusedExploration => "focused_exploration",
            Self::SelectorDetermination => "selector_determination",
        };
        f.write_str(label)
    }
}

/// Category of a taskloop error, used for counting and propagation policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    SessionNotFound,
    DuplicateSession,
    SessionLimit,
    InvalidTransition,
    Reasoner,
    CommandExecution,
    PromptGeneration,
    InvestigationPhase,
    InvestigationTool,
    UnsupportedTool,
    Timeout,
    WorkingMemory,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::SessionNotFound => "session_not_found",
            Self::DuplicateSession => "duplicate_session",
            Self::SessionLimit => "session_limit",
            Self::InvalidTransition => "invalid_transition",
            Self::Reasoner => "reasoner",
            Self::CommandExecution => "command_execution",
            Self::PromptGeneration => "prompt_generation",
            Self::InvestigationPhase => "investigation_phase",
            Self::InvestigationTool => "investigation_tool",
            Self::UnsupportedTool => "unsupported_tool",
            Self::Timeout => "timeout",
            Self::WorkingMemory => "working_memory",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared error type carried across taskloop crates.
///
/// Displays as its human-readable message; the kind and the optional
/// session/step context travel alongside for counting and logging.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskLoopError {
    kind: ErrorKind,
    message: String,
    session: Option<SessionId>,
    step: Option<u32>,
}

impl TaskLoopError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            session: None,
            step: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn reasoner(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Reasoner, message)
    }

    pub fn command(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CommandExecution, message)
    }

    pub fn prompt(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PromptGeneration, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn session(&self) -> Option<&SessionId> {
        self.session.as_ref()
    }

    pub fn step(&self) -> Option<u32> {
        self.step
    }

    /// One-line rendering with context, for log records.
    pub fn log_line(&self) -> String {
        let mut line = format!("[{}] {}", self.kind, self.message);
        if let Some(session) = &self.session {
            line.push_str(&format!(" (session {session}"));
            if let Some(step) = self.step {
                line.push_str(&format!(", step {step}"));
            }
            line.push(')');
        } else if let Some(step) = self.step {
            line.push_str(&format!(" (step {step})"));
        }
        line
    }
}
