use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use taskloop_core_types::{ExecPhase, SessionId, SessionStatus, TaskLoopError};

use crate::{
    api::{SessionLifecycleHooks, SessionRegistry},
    errors::RegistryError,
    health::RegistryHealth,
    metrics,
    model::{can_transition, RegistryConfig, SessionConfig, StepOutcome, StepSnapshot, WorkflowSession},
};

/// Concurrent in-memory registry: one dashmap entry per workflow session,
/// each guarded by its own lock so sessions never contend with each other.
pub struct SessionRegistryImpl {
    sessions: DashMap<String, Arc<RwLock<WorkflowSession>>>,
    config: RegistryConfig,
    hooks: RwLock<Vec<Arc<dyn SessionLifecycleHooks>>>,
}

impl SessionRegistryImpl {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RegistryConfig::default())
    }

    pub fn register_hooks(&self, hooks: Arc<dyn SessionLifecycleHooks>) {
        self.hooks.write().push(hooks);
    }

    fn ensure_session(
        &self,
        workflow_session_id: &str,
    ) -> Result<Arc<RwLock<WorkflowSession>>, TaskLoopError> {
        self.sessions
            .get(workflow_session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                RegistryError::NotFound
                    .into_task_error(format!("workflow session {workflow_session_id}"))
            })
    }

    /// Invoke every registered hook; one hook's failure must not prevent the
    /// others from running.
    fn notify<F>(&self, mut f: F)
    where
        F: FnMut(&dyn SessionLifecycleHooks) -> Result<(), TaskLoopError>,
    {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            if let Err(err) = f(hook.as_ref()) {
                warn!("session lifecycle hook failed: {}", err.log_line());
            }
        }
    }

    /// Forward a step-level error to the lifecycle observers, best-effort.
    pub fn notify_error(&self, workflow_session_id: &str, error: &TaskLoopError) {
        self.notify(|h| h.on_error(workflow_session_id, error));
    }

    /// Evict terminal sessions and sessions idle longer than `max_idle`.
    /// Returns the number of sessions removed.
    pub fn sweep_idle(&self, max_idle: Duration) -> usize {
        let victims: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let ctx = entry.value().read();
                ctx.status.is_terminal()
                    || ctx.status == SessionStatus::Cleanup
                    || ctx.last_activity.elapsed() >= max_idle
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for wid in victims {
            if self.sessions.remove(&wid).is_some() {
                removed += 1;
                debug!(workflow_session_id = %wid, "session swept");
                self.notify(|h| h.on_destroyed(&wid));
            }
        }
        if removed > 0 {
            metrics::record_sessions_swept(removed);
            metrics::set_session_count(self.sessions.len());
        }
        removed
    }
}

#[async_trait]
impl SessionRegistry for SessionRegistryImpl {
    async fn create(
        &self,
        workflow_session_id: &str,
        config: Option<SessionConfig>,
    ) -> Result<SessionId, TaskLoopError> {
        if self.sessions.len() >= self.config.max_sessions {
            return Err(RegistryError::LimitReached
                .into_task_error(format!("max {} sessions", self.config.max_sessions)));
        }
        match self.sessions.entry(workflow_session_id.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyExists
                .into_task_error(format!("workflow session {workflow_session_id}"))),
            Entry::Vacant(slot) => {
                let (id, ctx) = WorkflowSession::new(workflow_session_id, config.unwrap_or_default());
                let snapshot = ctx.clone();
                slot.insert(Arc::new(RwLock::new(ctx)));
                metrics::set_session_count(self.sessions.len());
                metrics::record_session_created();
                self.notify(|h| h.on_created(&snapshot));
                Ok(id)
            }
        }
    }

    async fn destroy(&self, workflow_session_id: &str) -> Result<(), TaskLoopError> {
        if self.sessions.remove(workflow_session_id).is_some() {
            metrics::set_session_count(self.sessions.len());
            metrics::record_session_destroyed();
            self.notify(|h| h.on_destroyed(workflow_session_id));
        }
        Ok(())
    }

    async fn update_status(
        &self,
        workflow_session_id: &str,
        status: SessionStatus,
    ) -> Result<(), TaskLoopError> {
        let session = self.ensure_session(workflow_session_id)?;
        let previous = {
            let mut ctx = session.write();
            if !can_transition(ctx.status, status) {
                return Err(RegistryError::InvalidTransition
                    .into_task_error(format!("{} -> {}", ctx.status, status)));
            }
            let previous = ctx.status;
            ctx.status = status;
            ctx.touch();
            previous
        };
        if previous != status {
            self.notify(|h| h.on_status_changed(workflow_session_id, previous, status));
        }
        Ok(())
    }

    async fn record_activity(&self, workflow_session_id: &str) -> Result<(), TaskLoopError> {
        let session = self.ensure_session(workflow_session_id)?;
        session.write().touch();
        Ok(())
    }

    async fn get_status(&self, workflow_session_id: &str) -> Result<SessionStatus, TaskLoopError> {
        let session = self.ensure_session(workflow_session_id)?;
        let status = session.read().status;
        Ok(status)
    }

    async fn get_last_activity(
        &self,
        workflow_session_id: &str,
    ) -> Result<Instant, TaskLoopError> {
        let session = self.ensure_session(workflow_session_id)?;
        let at = session.read().last_activity;
        Ok(at)
    }

    async fn get_session(
        &self,
        workflow_session_id: &str,
    ) -> Result<WorkflowSession, TaskLoopError> {
        let session = self.ensure_session(workflow_session_id)?;
        let ctx = session.read().clone();
        Ok(ctx)
    }

    async fn record_step(
        &self,
        workflow_session_id: &str,
        step_index: u32,
        phase: ExecPhase,
        iteration: u32,
    ) -> Result<(), TaskLoopError> {
        let session = self.ensure_session(workflow_session_id)?;
        let mut ctx = session.write();
        ctx.execution_states.insert(
            step_index,
            StepSnapshot {
                phase,
                iteration,
                updated_at: Instant::now(),
            },
        );
        ctx.touch();
        Ok(())
    }

    async fn record_step_outcome(
        &self,
        workflow_session_id: &str,
        outcome: StepOutcome,
    ) -> Result<(), TaskLoopError> {
        let session = self.ensure_session(workflow_session_id)?;
        let mut ctx = session.write();
        ctx.metrics.record_outcome(&outcome);
        ctx.touch();
        metrics::record_step_outcome(outcome.completed);
        Ok(())
    }

    async fn session_list(&self) -> Vec<WorkflowSession> {
        self.sessions
            .iter()
            .map(|entry| entry.value().read().clone())
            .collect()
    }

    fn health_check(&self) -> RegistryHealth {
        let mut health = RegistryHealth::default();
        for entry in self.sessions.iter() {
            health.observe(entry.value().read().status);
        }
        health
    }
}
