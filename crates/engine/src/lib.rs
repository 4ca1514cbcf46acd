//! ACT-REFLECT execution core.
//!
//! The engine repeatedly asks a reasoning service what to do for one step of
//! a workflow, optionally grounds that reasoning with a three-phase page
//! investigation, executes the resulting command, and decides whether to
//! continue, retry, or stop.
//!
//! # Architecture
//!
//! ```text
//! while phase not terminal && iteration < max:
//!     act:     [investigate] -> prompt -> reasoner -> validate -> execute
//!     reflect: proceed | retry | abort   (when enabled and warranted)
//! ```
//!
//! External collaborators (reasoner, command executor, prompt builder,
//! working-memory store) are injected as trait objects; the engine is an
//! ordinary value constructed once by the process bootstrapper, never a
//! hidden global.

pub mod collaborators;
pub mod investigation;
pub mod metrics;
pub mod task_loop;

pub use collaborators::{
    CommandExecutor, CommandResponse, PromptBuilder, PromptContext, Reasoner, ReasonerReply,
    ReasonerStatus, WorkingMemoryStore,
};
pub use investigation::{
    aggregate_confidence, tools_for_phase, DiscoveredElement, InvestigationCycleResult,
    InvestigationEngine, InvestigationState, PhaseResult, ToolKind, ToolResult,
};
pub use metrics::{snapshot as engine_metrics_snapshot, EngineMetricsSnapshot};
pub use task_loop::{
    CommandKind, ExecutedCommand, ExecutionState, FlowControl, InvestigationConfig,
    ReasonerDecision, ReflectVerdict, StepOptions, StepResult, TaskLoopConfig, TaskLoopEngine,
};
