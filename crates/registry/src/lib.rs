//! Workflow-session registry.
//!
//! The registry is the only structure shared across concurrently running
//! sessions: a dashmap of per-session contexts guarded by per-entry locks,
//! with best-effort lifecycle hooks, a health snapshot, prometheus gauges,
//! and explicit growth bounds (capacity limit plus idle sweep).

pub mod api;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod model;
pub mod state;

pub use api::{SessionLifecycleHooks, SessionRegistry};
pub use errors::RegistryError;
pub use health::RegistryHealth;
pub use model::{RegistryConfig, SessionConfig, SessionMetrics, StepOutcome, StepSnapshot, WorkflowSession};
pub use state::SessionRegistryImpl;
