//! The ACT-REFLECT loop controller.
//!
//! One `process_step` call owns one step: it iterates ACT (optional
//! investigation, prompt, reasoner, validate, execute) and, when warranted,
//! REFLECT (proceed, retry, abort) until the reasoner stops the step or the
//! iteration budget runs out. Control requests (pause, resume, cancel) only
//! gate the next iteration; an in-flight collaborator call is never
//! interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use taskloop_core_types::{ErrorKind, ExecPhase, SessionId, SessionStatus, TaskLoopError};
use taskloop_event_bus::{EventPublisher, TaskLoopEventType};
use taskloop_registry::{SessionLifecycleHooks, SessionRegistry, StepOutcome};

use crate::collaborators::{
    CommandExecutor, PromptBuilder, PromptContext, Reasoner, ReasonerStatus, WorkingMemoryStore,
};
use crate::investigation::InvestigationEngine;
use crate::metrics;
use crate::task_loop::config::TaskLoopConfig;
use crate::task_loop::types::{ExecutedCommand, ExecutionState, StepOptions, StepResult};
use crate::task_loop::validator::{CommandKind, FlowControl, ReasonerDecision, ReflectVerdict};

/// Per-step control flags, honoured between iterations only.
struct StepControl {
    cancelled: AtomicBool,
    paused: AtomicBool,
    resume: Notify,
}

impl StepControl {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            resume: Notify::new(),
        }
    }
}

/// Accumulated context of one step run; survives into the result even when
/// the step fails partway.
#[derive(Default)]
struct RunState {
    iterations: u32,
    reflections: u32,
    executed_commands: Vec<ExecutedCommand>,
    command_results: Vec<Value>,
    reasoning: Vec<String>,
    final_page_state: Option<Value>,
}

enum LoopEnd {
    Success,
    Failure(String),
}

pub struct TaskLoopEngine {
    config: TaskLoopConfig,
    registry: Arc<dyn SessionRegistry>,
    reasoner: Arc<dyn Reasoner>,
    executor: Arc<dyn CommandExecutor>,
    prompts: Arc<dyn PromptBuilder>,
    memory: Arc<dyn WorkingMemoryStore>,
    publisher: Arc<EventPublisher>,
    investigation: InvestigationEngine,
    controls: DashMap<(String, u32), Arc<StepControl>>,
}

impl TaskLoopEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TaskLoopConfig,
        registry: Arc<dyn SessionRegistry>,
        reasoner: Arc<dyn Reasoner>,
        executor: Arc<dyn CommandExecutor>,
        prompts: Arc<dyn PromptBuilder>,
        memory: Arc<dyn WorkingMemoryStore>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        let investigation = InvestigationEngine::new(
            config.investigation.clone(),
            executor.clone(),
            memory.clone(),
            publisher.clone(),
        );
        Self {
            config,
            registry,
            reasoner,
            executor,
            prompts,
            memory,
            publisher,
            investigation,
            controls: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TaskLoopConfig {
        &self.config
    }

    pub fn investigation(&self) -> &InvestigationEngine {
        &self.investigation
    }

    /// Request a pause; takes effect before the step's next iteration.
    pub fn pause_step(&self, workflow_session_id: &str, step_index: u32) {
        let control = self.control_for(workflow_session_id, step_index);
        control.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume_step(&self, workflow_session_id: &str, step_index: u32) {
        let control = self.control_for(workflow_session_id, step_index);
        control.paused.store(false, Ordering::SeqCst);
        control.resume.notify_one();
    }

    /// Request cancellation; the step fails before its next iteration. A
    /// paused step is woken so it can observe the cancellation.
    pub fn cancel_step(&self, workflow_session_id: &str, step_index: u32) {
        let control = self.control_for(workflow_session_id, step_index);
        control.cancelled.store(true, Ordering::SeqCst);
        control.paused.store(false, Ordering::SeqCst);
        control.resume.notify_one();
    }

    fn control_for(&self, workflow_session_id: &str, step_index: u32) -> Arc<StepControl> {
        self.controls
            .entry((workflow_session_id.to_string(), step_index))
            .or_insert_with(|| Arc::new(StepControl::new()))
            .clone()
    }

    /// Drop every control flag held for a session. A pause or cancel request
    /// against a step that never runs would otherwise keep its entry forever.
    pub fn release_controls(&self, workflow_session_id: &str) {
        self.controls.retain(|key, _| key.0 != workflow_session_id);
    }

    /// Lifecycle observer that releases a session's control flags when the
    /// session is destroyed. Register it with the concrete registry next to
    /// the engine's construction.
    pub fn lifecycle_hooks(self: &Arc<Self>) -> Arc<dyn SessionLifecycleHooks> {
        Arc::new(ControlSweeper {
            engine: Arc::downgrade(self),
        })
    }

    /// Execute one workflow step to completion. Ordinary automation failures
    /// are folded into the returned [`StepResult`] along with whatever
    /// context had accumulated; `Err` is reserved for calls that could never
    /// run (unknown session, session in a terminal state).
    pub async fn process_step(
        &self,
        workflow_session_id: &str,
        step_index: u32,
        step_content: &str,
        options: StepOptions,
    ) -> Result<StepResult, TaskLoopError> {
        let started = Instant::now();

        let session = self
            .registry
            .get_session(workflow_session_id)
            .await
            .map(|ctx| ctx.session_id)
            .map_err(|err| err.with_step(step_index))?;

        self.status_gate(workflow_session_id)
            .await
            .map_err(|err| err.with_session(session.clone()).with_step(step_index))?;

        metrics::record_step_attempted();
        self.publisher
            .publish(
                TaskLoopEventType::StepStarted,
                session.clone(),
                Some(step_index),
                json!({ "step_index": step_index }),
            )
            .await;

        let control = self.control_for(workflow_session_id, step_index);
        let mut run = RunState::default();
        let loop_future = self.run_loop(
            &session,
            workflow_session_id,
            step_index,
            step_content,
            &options,
            control.as_ref(),
            &mut run,
        );
        let outcome = match options.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), loop_future).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TaskLoopError::timeout(format!("step timed out after {ms}ms"))),
            },
            None => loop_future.await,
        };
        self.controls
            .remove(&(workflow_session_id.to_string(), step_index));

        let (success, error, error_kind) = match outcome {
            Ok(LoopEnd::Success) => (true, None, None),
            Ok(LoopEnd::Failure(message)) => (false, Some(message), None),
            Err(err) => {
                let err = err.with_session(session.clone()).with_step(step_index);
                warn!("step failed: {}", err.log_line());
                (false, Some(err.to_string()), Some(err.kind()))
            }
        };

        let terminal = if success {
            ExecPhase::Completed
        } else {
            ExecPhase::Failed
        };
        self.record_phase(workflow_session_id, step_index, terminal, run.iterations)
            .await;
        self.record_outcome(
            workflow_session_id,
            StepOutcome {
                step_index,
                completed: success,
                iterations: run.iterations,
                reflections: run.reflections,
                error_kind,
            },
        )
        .await;

        if success {
            metrics::record_step_completed();
            info!(
                session = %session,
                step_index,
                iterations = run.iterations,
                "step completed"
            );
            self.publisher
                .publish(
                    TaskLoopEventType::StepCompleted,
                    session.clone(),
                    Some(step_index),
                    json!({ "iterations": run.iterations }),
                )
                .await;
        } else {
            metrics::record_step_failed();
            self.publisher
                .publish(
                    TaskLoopEventType::StepFailed,
                    session.clone(),
                    Some(step_index),
                    json!({ "error": error.clone(), "iterations": run.iterations }),
                )
                .await;
        }

        Ok(StepResult {
            success,
            step_index,
            iterations: run.iterations,
            executed_commands: run.executed_commands,
            command_results: run.command_results,
            reasoning: run.reasoning,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            final_page_state: run.final_page_state,
        })
    }

    /// Bump a fresh session to Active; refuse steps on terminal sessions.
    async fn status_gate(&self, workflow_session_id: &str) -> Result<(), TaskLoopError> {
        match self.registry.get_status(workflow_session_id).await? {
            SessionStatus::Initializing => {
                if let Err(err) = self
                    .registry
                    .update_status(workflow_session_id, SessionStatus::Active)
                    .await
                {
                    warn!("session activation failed: {}", err.log_line());
                }
                Ok(())
            }
            SessionStatus::Active | SessionStatus::Paused => Ok(()),
            status => Err(TaskLoopError::new(
                ErrorKind::InvalidTransition,
                format!("session is {status}, cannot execute steps"),
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        &self,
        session: &SessionId,
        workflow_session_id: &str,
        step_index: u32,
        step_content: &str,
        options: &StepOptions,
        control: &StepControl,
        run: &mut RunState,
    ) -> Result<LoopEnd, TaskLoopError> {
        let max_iterations = options
            .max_iterations
            .unwrap_or(self.config.max_iterations)
            .max(1);
        let mut exec = ExecutionState::new();

        for iteration in 1..=max_iterations {
            self.gate(control, session, workflow_session_id, step_index, iteration)
                .await?;
            run.iterations = iteration;
            exec.iteration = iteration;
            metrics::record_iteration();

            let memory = match self.memory.get_working_memory(workflow_session_id).await {
                Ok(Value::Null) => None,
                Ok(value) => Some(value),
                Err(err) => {
                    warn!("working memory read failed: {}", err.log_line());
                    None
                }
            };

            let mut act_error: Option<TaskLoopError> = None;

            let mut investigation_summary: Option<String> = None;
            if self.config.enable_investigation {
                exec.advance(ExecPhase::Investigating);
                self.record_phase(workflow_session_id, step_index, exec.phase, iteration)
                    .await;
                self.publisher
                    .publish_progress(
                        session.clone(),
                        step_index,
                        exec.phase.to_string(),
                        iteration,
                    )
                    .await;
                match self
                    .investigation
                    .run_cycle(
                        session,
                        workflow_session_id,
                        step_index,
                        options.investigation_timeout_ms,
                    )
                    .await
                {
                    Ok(cycle) => investigation_summary = Some(cycle.context_summary()),
                    Err(err) => act_error = Some(err),
                }
            }

            let mut decision: Option<ReasonerDecision> = None;
            if act_error.is_none() {
                exec.advance(ExecPhase::GeneratingPrompt);
                self.record_phase(workflow_session_id, step_index, exec.phase, iteration)
                    .await;
                self.publisher
                    .publish_progress(
                        session.clone(),
                        step_index,
                        exec.phase.to_string(),
                        iteration,
                    )
                    .await;
                let ctx = PromptContext {
                    workflow_session_id,
                    step_index,
                    step_content,
                    iteration,
                    working_memory: memory.as_ref(),
                };
                let prompt = match &investigation_summary {
                    Some(summary) => self.prompts.action_with_investigation_prompt(&ctx, summary),
                    None => self.prompts.step_prompt(&ctx),
                }
                .map_err(|err| TaskLoopError::prompt(format!("prompt generation failed: {err}")))?;

                exec.advance(ExecPhase::QueryingReasoner);
                self.record_phase(workflow_session_id, step_index, exec.phase, iteration)
                    .await;
                self.publisher
                    .publish_progress(
                        session.clone(),
                        step_index,
                        exec.phase.to_string(),
                        iteration,
                    )
                    .await;
                let reply = self.reasoner.send_request(&prompt).await.map_err(|err| {
                    TaskLoopError::reasoner(format!("reasoning request failed: {err}"))
                })?;

                exec.advance(ExecPhase::ProcessingResponse);
                self.record_phase(workflow_session_id, step_index, exec.phase, iteration)
                    .await;
                self.publisher
                    .publish_progress(
                        session.clone(),
                        step_index,
                        exec.phase.to_string(),
                        iteration,
                    )
                    .await;
                let data = match reply.status {
                    ReasonerStatus::Success => reply.data.unwrap_or(Value::Null),
                    ReasonerStatus::Error => {
                        let message = reply
                            .error
                            .unwrap_or_else(|| "unknown reasoner failure".to_string());
                        return Err(TaskLoopError::reasoner(format!(
                            "reasoning request failed: {message}"
                        )));
                    }
                };

                exec.advance(ExecPhase::Validating);
                self.record_phase(workflow_session_id, step_index, exec.phase, iteration)
                    .await;
                self.publisher
                    .publish_progress(
                        session.clone(),
                        step_index,
                        exec.phase.to_string(),
                        iteration,
                    )
                    .await;
                let parsed = ReasonerDecision::parse(&data)?;
                if let Some(reasoning) = &parsed.reasoning {
                    run.reasoning.push(reasoning.clone());
                    self.publisher
                        .publish(
                            TaskLoopEventType::AiReasoningUpdate,
                            session.clone(),
                            Some(step_index),
                            json!({ "iteration": iteration, "reasoning": reasoning }),
                        )
                        .await;
                }
                decision = Some(parsed);
            }

            if act_error.is_none() {
                if let Some(kind) = decision.as_ref().and_then(|d| d.command) {
                    exec.advance(ExecPhase::ExecutingCommand);
                    self.record_phase(workflow_session_id, step_index, exec.phase, iteration)
                        .await;
                    self.publisher
                        .publish_progress(
                            session.clone(),
                            step_index,
                            exec.phase.to_string(),
                            iteration,
                        )
                        .await;
                    let params = decision
                        .as_ref()
                        .map(|d| d.params.clone())
                        .unwrap_or(Value::Null);
                    match self
                        .execute_command(session, step_index, iteration, kind, &params, run)
                        .await
                    {
                        Ok(()) => {}
                        // Malformed parameters are the reasoner's fault, not
                        // the page's; fail the step rather than reflect.
                        Err(err) if err.kind() == ErrorKind::Validation => return Err(err),
                        Err(err) => act_error = Some(err),
                    }
                }
            }

            let confidence = decision.as_ref().and_then(|d| d.confidence);
            let low_confidence =
                confidence.is_some_and(|c| c < self.config.reflection_confidence_threshold);
            if act_error.is_some() || low_confidence {
                if self.config.enable_reflection {
                    exec.advance(ExecPhase::Reflecting);
                    self.record_phase(workflow_session_id, step_index, exec.phase, iteration)
                        .await;
                    self.publisher
                        .publish_progress(
                            session.clone(),
                            step_index,
                            exec.phase.to_string(),
                            iteration,
                        )
                        .await;
                    run.reflections += 1;
                    exec.reflections_used = run.reflections;
                    metrics::record_reflection();

                    let act_summary = match (&act_error, confidence) {
                        (Some(err), _) => format!("action failed: {err}"),
                        (None, Some(c)) => {
                            format!("action succeeded with low confidence {c:.2}")
                        }
                        (None, None) => "action succeeded".to_string(),
                    };
                    let ctx = PromptContext {
                        workflow_session_id,
                        step_index,
                        step_content,
                        iteration,
                        working_memory: memory.as_ref(),
                    };
                    let verdict = self.reflect(&ctx, &act_summary).await?;
                    debug!(?verdict, iteration, "reflection verdict");
                    match verdict {
                        ReflectVerdict::Abort => {
                            let message = act_error
                                .map(|err| err.to_string())
                                .unwrap_or_else(|| "aborted after reflection".to_string());
                            return Ok(LoopEnd::Failure(message));
                        }
                        ReflectVerdict::Retry => continue,
                        ReflectVerdict::Proceed => {}
                    }
                } else if let Some(err) = act_error {
                    return Err(err);
                }
            }

            if let Some(decision) = &decision {
                match decision.flow_control {
                    FlowControl::StopSuccess => {
                        exec.advance(ExecPhase::Completed);
                        return Ok(LoopEnd::Success);
                    }
                    FlowControl::StopFailure => {
                        let message = decision
                            .reasoning
                            .clone()
                            .unwrap_or_else(|| "reasoner requested stop_failure".to_string());
                        return Ok(LoopEnd::Failure(message));
                    }
                    FlowControl::Continue => {}
                }
            }
        }

        Ok(LoopEnd::Failure("maximum iterations exceeded".to_string()))
    }

    /// Honour pause/cancel between iterations. A pause is mirrored into the
    /// session status; a cancellation fails the step.
    async fn gate(
        &self,
        control: &StepControl,
        session: &SessionId,
        workflow_session_id: &str,
        step_index: u32,
        iteration: u32,
    ) -> Result<(), TaskLoopError> {
        loop {
            if control.cancelled.load(Ordering::SeqCst) {
                return Err(TaskLoopError::new(ErrorKind::Internal, "step cancelled")
                    .with_session(session.clone())
                    .with_step(step_index));
            }
            if !control.paused.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Err(err) = self
                .registry
                .update_status(workflow_session_id, SessionStatus::Paused)
                .await
            {
                debug!("pause status update failed: {}", err.log_line());
            }
            self.publisher
                .publish_progress(session.clone(), step_index, "paused", iteration)
                .await;
            control.resume.notified().await;
            if let Err(err) = self
                .registry
                .update_status(workflow_session_id, SessionStatus::Active)
                .await
            {
                debug!("resume status update failed: {}", err.log_line());
            }
        }
    }

    async fn execute_command(
        &self,
        session: &SessionId,
        step_index: u32,
        iteration: u32,
        kind: CommandKind,
        params: &Value,
        run: &mut RunState,
    ) -> Result<(), TaskLoopError> {
        let response = match kind {
            CommandKind::OpenPage => {
                let url = str_param(params, "url")?;
                self.executor.open_page(session, url).await
            }
            CommandKind::ClickElement => {
                let selector = str_param(params, "selector")?;
                self.executor.click_element(session, selector).await
            }
            CommandKind::InputText => {
                let selector = str_param(params, "selector")?;
                let text = str_param(params, "text")?;
                self.executor.input_text(session, selector, text).await
            }
            CommandKind::SaveVariable => {
                let name = str_param(params, "name")?;
                let value = params.get("value").cloned().unwrap_or(Value::Null);
                self.executor.save_variable(session, name, &value).await
            }
            CommandKind::GetDom => self.executor.get_dom(session).await,
            CommandKind::GetContent => {
                let selector = params.get("selector").and_then(Value::as_str);
                let attribute = params.get("attribute").and_then(Value::as_str);
                let multiple = params
                    .get("multiple")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                self.executor
                    .get_content(session, selector, attribute, multiple)
                    .await
            }
            CommandKind::GetSubDom => {
                let selector = str_param(params, "selector")?;
                self.executor
                    .get_sub_dom(session, selector, self.config.investigation.max_sub_dom_size)
                    .await
            }
        }
        .map_err(|err| TaskLoopError::command(format!("command execution failed: {err}")))?;

        if !response.success {
            return Err(TaskLoopError::command(format!(
                "command execution failed: {}",
                response.error_message()
            )));
        }

        run.executed_commands.push(ExecutedCommand {
            command: kind,
            params: params.clone(),
            iteration,
        });
        let result = serde_json::to_value(&response).unwrap_or(Value::Null);
        run.command_results.push(result.clone());
        if response.dom.is_some() || response.metadata.is_some() {
            run.final_page_state = Some(result);
        }
        self.publisher
            .publish(
                TaskLoopEventType::CommandExecuted,
                session.clone(),
                Some(step_index),
                json!({ "command": kind.as_str(), "iteration": iteration }),
            )
            .await;
        Ok(())
    }

    async fn reflect(
        &self,
        ctx: &PromptContext<'_>,
        act_summary: &str,
    ) -> Result<ReflectVerdict, TaskLoopError> {
        let prompt = self
            .prompts
            .reflection_prompt(ctx, act_summary)
            .map_err(|err| TaskLoopError::prompt(format!("prompt generation failed: {err}")))?;
        let reply = self
            .reasoner
            .send_request(&prompt)
            .await
            .map_err(|err| TaskLoopError::reasoner(format!("reasoning request failed: {err}")))?;
        match reply.status {
            ReasonerStatus::Success => Ok(ReflectVerdict::parse(&reply.data.unwrap_or(Value::Null))),
            ReasonerStatus::Error => Err(TaskLoopError::reasoner(format!(
                "reasoning request failed: {}",
                reply
                    .error
                    .unwrap_or_else(|| "unknown reasoner failure".to_string())
            ))),
        }
    }

    async fn record_phase(
        &self,
        workflow_session_id: &str,
        step_index: u32,
        phase: ExecPhase,
        iteration: u32,
    ) {
        if let Err(err) = self
            .registry
            .record_step(workflow_session_id, step_index, phase, iteration)
            .await
        {
            debug!("step state record failed: {}", err.log_line());
        }
    }

    async fn record_outcome(&self, workflow_session_id: &str, outcome: StepOutcome) {
        if let Err(err) = self
            .registry
            .record_step_outcome(workflow_session_id, outcome)
            .await
        {
            debug!("step outcome record failed: {}", err.log_line());
        }
    }
}

struct ControlSweeper {
    engine: Weak<TaskLoopEngine>,
}

impl SessionLifecycleHooks for ControlSweeper {
    fn on_destroyed(&self, workflow_session_id: &str) -> Result<(), TaskLoopError> {
        if let Some(engine) = self.engine.upgrade() {
            engine.release_controls(workflow_session_id);
        }
        Ok(())
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, TaskLoopError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| TaskLoopError::validation(format!("command parameter '{key}' missing")))
}
