//! The ACT-REFLECT execution loop itself.
//!
//! `controller` drives iterations; `validator` turns raw reasoner output into
//! a typed decision; `config` and `types` hold the knobs and the result
//! shapes.

pub mod config;
pub mod controller;
pub mod types;
pub mod validator;

pub use config::{InvestigationConfig, TaskLoopConfig};
pub use controller::TaskLoopEngine;
pub use types::{ExecutedCommand, ExecutionState, StepOptions, StepResult};
pub use validator::{
    normalize_confidence, CommandKind, FlowControl, ReasonerDecision, ReflectVerdict,
};
