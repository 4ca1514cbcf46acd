use std::time::Instant;

use async_trait::async_trait;

use taskloop_core_types::{ExecPhase, SessionId, SessionStatus, TaskLoopError};

use crate::health::RegistryHealth;
use crate::model::{SessionConfig, StepOutcome, WorkflowSession};

/// Lifecycle observer invoked best-effort after registry mutations commit.
/// A failing hook is logged and never rolls back the mutation nor prevents
/// later hooks from running.
pub trait SessionLifecycleHooks: Send + Sync {
    fn on_created(&self, _session: &WorkflowSession) -> Result<(), TaskLoopError> {
        Ok(())
    }

    fn on_status_changed(
        &self,
        _workflow_session_id: &str,
        _from: SessionStatus,
        _to: SessionStatus,
    ) -> Result<(), TaskLoopError> {
        Ok(())
    }

    fn on_destroyed(&self, _workflow_session_id: &str) -> Result<(), TaskLoopError> {
        Ok(())
    }

    fn on_error(&self, _workflow_session_id: &str, _error: &TaskLoopError) -> Result<(), TaskLoopError> {
        Ok(())
    }
}

#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Register a session keyed by the caller's workflow session id.
    /// Fails with `DuplicateSession` when the key is already registered and
    /// `SessionLimit` when at capacity.
    async fn create(
        &self,
        workflow_session_id: &str,
        config: Option<SessionConfig>,
    ) -> Result<SessionId, TaskLoopError>;

    /// Idempotent: destroying a missing session is a no-op.
    async fn destroy(&self, workflow_session_id: &str) -> Result<(), TaskLoopError>;

    async fn update_status(
        &self,
        workflow_session_id: &str,
        status: SessionStatus,
    ) -> Result<(), TaskLoopError>;

    async fn record_activity(&self, workflow_session_id: &str) -> Result<(), TaskLoopError>;

    async fn get_status(&self, workflow_session_id: &str) -> Result<SessionStatus, TaskLoopError>;

    async fn get_last_activity(&self, workflow_session_id: &str)
        -> Result<Instant, TaskLoopError>;

    async fn get_session(&self, workflow_session_id: &str)
        -> Result<WorkflowSession, TaskLoopError>;

    /// Record the current phase/iteration of one step execution.
    async fn record_step(
        &self,
        workflow_session_id: &str,
        step_index: u32,
        phase: ExecPhase,
        iteration: u32,
    ) -> Result<(), TaskLoopError>;

    /// Fold a finished step into the per-session counters.
    async fn record_step_outcome(
        &self,
        workflow_session_id: &str,
        outcome: StepOutcome,
    ) -> Result<(), TaskLoopError>;

    async fn session_list(&self) -> Vec<WorkflowSession>;

    /// Counts of sessions by status; never fails.
    fn health_check(&self) -> RegistryHealth;
}
