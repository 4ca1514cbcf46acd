//! End-to-end properties of the ACT-REFLECT loop, driven through mock
//! collaborators and a real in-process registry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use taskloop_core_types::{ErrorKind, InvestigationPhase, SessionId, TaskLoopError};
use taskloop_engine::{
    CommandExecutor, CommandResponse, DiscoveredElement, PromptBuilder, PromptContext, Reasoner,
    ReasonerReply, StepOptions, TaskLoopConfig, TaskLoopEngine, WorkingMemoryStore,
};
use taskloop_event_bus::{EventPublisher, EventSink, TaskLoopEvent, TaskLoopEventType};
use taskloop_registry::{SessionRegistry, SessionRegistryImpl};

struct ScriptedReasoner {
    script: Mutex<VecDeque<ReasonerReply>>,
    fallback: ReasonerReply,
    calls: AtomicUsize,
}

impl ScriptedReasoner {
    fn new(script: Vec<ReasonerReply>, fallback: ReasonerReply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn send_request(&self, _prompt: &str) -> Result<ReasonerReply, TaskLoopError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

struct BrokenReasoner;

#[async_trait]
impl Reasoner for BrokenReasoner {
    async fn send_request(&self, _prompt: &str) -> Result<ReasonerReply, TaskLoopError> {
        Err(TaskLoopError::reasoner("connection refused"))
    }
}

/// Page backend double: records every call, optionally failing clicks.
struct PageExecutor {
    fail_clicks: bool,
    clicks: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl PageExecutor {
    fn new(fail_clicks: bool) -> Arc<Self> {
        Arc::new(Self {
            fail_clicks,
            clicks: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn respond(&self) -> Result<CommandResponse, TaskLoopError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CommandResponse::ok_with_dom(
            r#"<button id="submit" class="btn">Go</button><input id="email">"#,
        ))
    }
}

#[async_trait]
impl CommandExecutor for PageExecutor {
    async fn open_page(
        &self,
        _session: &SessionId,
        _url: &str,
    ) -> Result<CommandResponse, TaskLoopError> {
        self.respond()
    }

    async fn click_element(
        &self,
        _session: &SessionId,
        selector: &str,
    ) -> Result<CommandResponse, TaskLoopError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.clicks.lock().push(selector.to_string());
        if self.fail_clicks {
            Ok(CommandResponse::failed("element not found"))
        } else {
            Ok(CommandResponse::ok())
        }
    }

    async fn input_text(
        &self,
        _session: &SessionId,
        _selector: &str,
        _text: &str,
    ) -> Result<CommandResponse, TaskLoopError> {
        self.respond()
    }

    async fn save_variable(
        &self,
        _session: &SessionId,
        _name: &str,
        _value: &Value,
    ) -> Result<CommandResponse, TaskLoopError> {
        self.respond()
    }

    async fn get_dom(&self, _session: &SessionId) -> Result<CommandResponse, TaskLoopError> {
        self.respond()
    }

    async fn get_content(
        &self,
        _session: &SessionId,
        _selector: Option<&str>,
        _attribute: Option<&str>,
        _multiple: bool,
    ) -> Result<CommandResponse, TaskLoopError> {
        self.respond()
    }

    async fn get_sub_dom(
        &self,
        _session: &SessionId,
        _selector: &str,
        _max_size: usize,
    ) -> Result<CommandResponse, TaskLoopError> {
        self.respond()
    }

    async fn capture_screenshot(
        &self,
        _session: &SessionId,
    ) -> Result<CommandResponse, TaskLoopError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CommandResponse {
            success: true,
            screenshot_id: Some("shot".to_string()),
            metadata: Some(json!({ "width": 1280 })),
            ..Default::default()
        })
    }
}

/// Prompt double recording which template the loop asked for.
#[derive(Default)]
struct RecordingPrompts {
    templates: Mutex<Vec<&'static str>>,
}

impl PromptBuilder for RecordingPrompts {
    fn step_prompt(&self, ctx: &PromptContext<'_>) -> Result<String, TaskLoopError> {
        self.templates.lock().push("step");
        Ok(format!("step {} iteration {}", ctx.step_index, ctx.iteration))
    }

    fn investigation_prompt(
        &self,
        _ctx: &PromptContext<'_>,
        phase: InvestigationPhase,
    ) -> Result<String, TaskLoopError> {
        self.templates.lock().push("investigation");
        Ok(format!("investigate {phase}"))
    }

    fn action_with_investigation_prompt(
        &self,
        ctx: &PromptContext<'_>,
        investigation_summary: &str,
    ) -> Result<String, TaskLoopError> {
        self.templates.lock().push("action_with_investigation");
        Ok(format!(
            "step {} with context:\n{investigation_summary}",
            ctx.step_index
        ))
    }

    fn reflection_prompt(
        &self,
        _ctx: &PromptContext<'_>,
        act_summary: &str,
    ) -> Result<String, TaskLoopError> {
        self.templates.lock().push("reflection");
        Ok(format!("reflect on: {act_summary}"))
    }
}

struct NullMemory;

#[async_trait]
impl WorkingMemoryStore for NullMemory {
    async fn get_working_memory(&self, _workflow_session_id: &str) -> Result<Value, TaskLoopError> {
        Ok(Value::Null)
    }

    async fn update_working_memory(
        &self,
        _workflow_session_id: &str,
        _memory: Value,
    ) -> Result<(), TaskLoopError> {
        Ok(())
    }

    async fn add_page_element_discovery(
        &self,
        _workflow_session_id: &str,
        _element: &DiscoveredElement,
    ) -> Result<(), TaskLoopError> {
        Ok(())
    }
}

struct ThrowingSink;

#[async_trait]
impl EventSink for ThrowingSink {
    async fn deliver(&self, _event: &TaskLoopEvent) -> Result<(), TaskLoopError> {
        Err(TaskLoopError::internal("observer down"))
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<TaskLoopEvent>>,
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn deliver(&self, event: &TaskLoopEvent) -> Result<(), TaskLoopError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

fn continue_click(selector: &str) -> ReasonerReply {
    ReasonerReply::success(json!({
        "flow_control": "continue",
        "command": { "type": "CLICK_ELEMENT", "params": { "selector": selector } },
        "reasoning": "clicking",
    }))
}

fn stop_success() -> ReasonerReply {
    ReasonerReply::success(json!({ "flow_control": "stop_success", "reasoning": "done" }))
}

fn verdict(v: &str) -> ReasonerReply {
    ReasonerReply::success(json!({ "verdict": v }))
}

const WID: &str = "wf-1";

async fn engine_with(
    config: TaskLoopConfig,
    reasoner: Arc<dyn Reasoner>,
    executor: Arc<dyn CommandExecutor>,
    prompts: Arc<RecordingPrompts>,
    publisher: Arc<EventPublisher>,
) -> (Arc<TaskLoopEngine>, Arc<SessionRegistryImpl>) {
    let registry = Arc::new(SessionRegistryImpl::with_defaults());
    registry.create(WID, None).await.unwrap();
    let engine = Arc::new(TaskLoopEngine::new(
        config,
        registry.clone(),
        reasoner,
        executor,
        prompts,
        Arc::new(NullMemory),
        publisher,
    ));
    (engine, registry)
}

#[tokio::test]
async fn continue_never_completes_and_hits_the_iteration_budget() {
    let reasoner = ScriptedReasoner::new(Vec::new(), continue_click(".btn"));
    let executor = PageExecutor::new(false);
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal().with_max_iterations(4),
        reasoner.clone(),
        executor.clone(),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "click until done", StepOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.iterations, 4);
    assert_eq!(result.error.as_deref(), Some("maximum iterations exceeded"));
    assert_eq!(executor.clicks.lock().len(), 4);
    assert_eq!(reasoner.calls(), 4);
}

#[tokio::test]
async fn stop_success_completes_on_the_first_iteration() {
    let reasoner = ScriptedReasoner::new(vec![stop_success()], stop_success());
    let executor = PageExecutor::new(false);
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        reasoner,
        executor.clone(),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "nothing to do", StepOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.iterations, 1);
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn stop_failure_fails_with_the_reasoner_explanation() {
    let reply = ReasonerReply::success(json!({
        "flow_control": "stop_failure",
        "reasoning": "form is gone",
    }));
    let reasoner = ScriptedReasoner::new(vec![reply.clone()], reply);
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        reasoner,
        PageExecutor::new(false),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "submit the form", StepOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.iterations, 1);
    assert_eq!(result.error.as_deref(), Some("form is gone"));
}

#[tokio::test]
async fn malformed_reply_fails_before_any_command_runs() {
    let reply = ReasonerReply::success(json!({ "flow_control": "continue" }));
    let reasoner = ScriptedReasoner::new(vec![reply.clone()], reply);
    let executor = PageExecutor::new(false);
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        reasoner,
        executor.clone(),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "do something", StepOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("requires an accompanying command")));
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn reasoner_transport_failure_is_fatal() {
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        Arc::new(BrokenReasoner),
        PageExecutor::new(false),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "do something", StepOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("reasoning request failed")));
    assert_eq!(result.iterations, 1);
}

#[tokio::test]
async fn failed_command_reflects_then_retries_to_success() {
    let reasoner = ScriptedReasoner::new(
        vec![continue_click(".gone"), verdict("retry"), stop_success()],
        stop_success(),
    );
    let executor = PageExecutor::new(true);
    let (engine, registry) = engine_with(
        TaskLoopConfig::minimal()
            .with_reflection(true)
            .with_max_iterations(5),
        reasoner.clone(),
        executor,
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "click the button", StepOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.iterations, 2);
    assert_eq!(reasoner.calls(), 3);
    let session = registry.get_session(WID).await.unwrap();
    assert_eq!(session.metrics.reflections_used, 1);
    assert_eq!(session.metrics.steps_completed, 1);
}

#[tokio::test]
async fn reflection_abort_fails_with_the_act_error() {
    let reasoner = ScriptedReasoner::new(
        vec![continue_click(".gone"), verdict("abort")],
        stop_success(),
    );
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal().with_reflection(true),
        reasoner,
        PageExecutor::new(true),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "click the button", StepOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("command execution failed")));
}

#[tokio::test]
async fn failed_command_without_reflection_is_fatal() {
    let reasoner = ScriptedReasoner::new(vec![continue_click(".gone")], stop_success());
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        reasoner,
        PageExecutor::new(true),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "click the button", StepOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.iterations, 1);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("element not found")));
}

#[tokio::test]
async fn low_confidence_success_is_reflected_then_proceeds() {
    let low_confidence_stop = ReasonerReply::success(json!({
        "flow_control": "stop_success",
        "confidence": 0.3,
    }));
    let reasoner = ScriptedReasoner::new(
        vec![low_confidence_stop, verdict("proceed")],
        stop_success(),
    );
    let prompts = Arc::new(RecordingPrompts::default());
    let (engine, registry) = engine_with(
        TaskLoopConfig::minimal().with_reflection(true),
        reasoner.clone(),
        PageExecutor::new(false),
        prompts.clone(),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "verify the page", StepOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(reasoner.calls(), 2);
    assert!(prompts.templates.lock().contains(&"reflection"));
    let session = registry.get_session(WID).await.unwrap();
    assert_eq!(session.metrics.reflections_used, 1);
}

#[tokio::test]
async fn click_then_stop_scenario_records_one_command() {
    let reasoner = ScriptedReasoner::new(
        vec![continue_click(".btn"), stop_success()],
        stop_success(),
    );
    let executor = PageExecutor::new(false);
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        reasoner,
        executor.clone(),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "click the button", StepOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.iterations, 2);
    assert_eq!(result.executed_commands.len(), 1);
    assert_eq!(result.executed_commands[0].params["selector"], ".btn");
    assert_eq!(*executor.clicks.lock(), vec![".btn".to_string()]);
}

#[tokio::test]
async fn investigation_feeds_the_action_prompt() {
    let reasoner = ScriptedReasoner::new(vec![stop_success()], stop_success());
    let prompts = Arc::new(RecordingPrompts::default());
    let (engine, _) = engine_with(
        TaskLoopConfig::default()
            .with_reflection(false)
            .with_investigation(true),
        reasoner,
        PageExecutor::new(false),
        prompts.clone(),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "find the submit button", StepOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert!(prompts
        .templates
        .lock()
        .contains(&"action_with_investigation"));
}

#[tokio::test]
async fn throwing_event_sink_never_changes_the_outcome() {
    let publisher = EventPublisher::new(8, vec![Arc::new(ThrowingSink)]);
    let reasoner = ScriptedReasoner::new(
        vec![continue_click(".btn"), stop_success()],
        stop_success(),
    );
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        reasoner,
        PageExecutor::new(false),
        Arc::new(RecordingPrompts::default()),
        publisher.clone(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "click the button", StepOptions::default())
        .await
        .unwrap();
    publisher.shutdown().await;

    assert!(result.success);
    assert_eq!(result.iterations, 2);
}

#[tokio::test]
async fn every_act_phase_appears_on_the_progress_stream() {
    let sink = Arc::new(CollectingSink::default());
    let publisher = EventPublisher::new(16, vec![sink.clone()]);
    let reasoner = ScriptedReasoner::new(vec![stop_success()], stop_success());
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        reasoner,
        PageExecutor::new(false),
        Arc::new(RecordingPrompts::default()),
        publisher.clone(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "nothing to do", StepOptions::default())
        .await
        .unwrap();
    publisher.shutdown().await;

    assert!(result.success);
    let phases: Vec<String> = sink
        .events
        .lock()
        .iter()
        .filter(|e| e.event_type == TaskLoopEventType::ProgressUpdate)
        .filter_map(|e| e.payload["phase"].as_str().map(str::to_string))
        .collect();
    assert_eq!(
        phases,
        vec![
            "generating_prompt",
            "querying_reasoner",
            "processing_response",
            "validating",
        ]
    );
}

#[tokio::test]
async fn reflection_proceed_on_continue_runs_another_iteration() {
    let hesitant_click = ReasonerReply::success(json!({
        "flow_control": "continue",
        "command": { "type": "CLICK_ELEMENT", "params": { "selector": ".btn" } },
        "confidence": 0.3,
    }));
    let reasoner = ScriptedReasoner::new(
        vec![hesitant_click, verdict("proceed"), stop_success()],
        stop_success(),
    );
    let executor = PageExecutor::new(false);
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal()
            .with_reflection(true)
            .with_max_iterations(3),
        reasoner.clone(),
        executor.clone(),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(WID, 0, "click the button", StepOptions::default())
        .await
        .unwrap();

    // Proceed accepts the ACT outcome; its `continue` verdict still means
    // another iteration, not a completed step.
    assert!(result.success);
    assert_eq!(result.iterations, 2);
    assert_eq!(reasoner.calls(), 3);
    assert_eq!(executor.clicks.lock().len(), 1);
}

#[tokio::test]
async fn cancellation_stops_before_the_next_iteration() {
    let reasoner = ScriptedReasoner::new(Vec::new(), continue_click(".btn"));
    let executor = PageExecutor::new(false);
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal().with_max_iterations(5),
        reasoner,
        executor.clone(),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    engine.cancel_step(WID, 0);
    let result = engine
        .process_step(WID, 0, "click forever", StepOptions::default())
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("step cancelled")));
    assert_eq!(executor.calls(), 0);
}

#[tokio::test]
async fn destroying_a_session_releases_pending_step_controls() {
    let reasoner = ScriptedReasoner::new(Vec::new(), stop_success());
    let (engine, registry) = engine_with(
        TaskLoopConfig::minimal(),
        reasoner,
        PageExecutor::new(false),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;
    registry.register_hooks(engine.lifecycle_hooks());

    // Cancel a step that never runs, then recycle the session. Without the
    // sweep the stale flag would cancel the recreated session's step.
    engine.cancel_step(WID, 7);
    registry.destroy(WID).await.unwrap();
    registry.create(WID, None).await.unwrap();

    let result = engine
        .process_step(WID, 7, "fresh start", StepOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.iterations, 1);
}

#[tokio::test]
async fn paused_step_waits_for_resume() {
    let reasoner = ScriptedReasoner::new(vec![stop_success()], stop_success());
    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        reasoner,
        PageExecutor::new(false),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    engine.pause_step(WID, 0);
    let runner = engine.clone();
    let handle = tokio::spawn(async move {
        runner
            .process_step(WID, 0, "wait for it", StepOptions::default())
            .await
    });

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!handle.is_finished());
    engine.resume_step(WID, 0);

    let result = handle.await.unwrap().unwrap();
    assert!(result.success);
    assert_eq!(result.iterations, 1);
}

#[tokio::test]
async fn step_timeout_fails_the_step() {
    struct SlowReasoner;

    #[async_trait]
    impl Reasoner for SlowReasoner {
        async fn send_request(&self, _prompt: &str) -> Result<ReasonerReply, TaskLoopError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(stop_success())
        }
    }

    let (engine, _) = engine_with(
        TaskLoopConfig::minimal(),
        Arc::new(SlowReasoner),
        PageExecutor::new(false),
        Arc::new(RecordingPrompts::default()),
        EventPublisher::disabled(),
    )
    .await;

    let result = engine
        .process_step(
            WID,
            0,
            "slow step",
            StepOptions {
                timeout_ms: Some(50),
                ..StepOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result
        .error
        .as_deref()
        .is_some_and(|e| e.contains("timed out")));
}

#[tokio::test]
async fn unknown_session_is_rejected_without_side_effects() {
    let executor = PageExecutor::new(false);
    let registry = Arc::new(SessionRegistryImpl::with_defaults());
    let engine = TaskLoopEngine::new(
        TaskLoopConfig::minimal(),
        registry,
        ScriptedReasoner::new(Vec::new(), stop_success()),
        executor.clone(),
        Arc::new(RecordingPrompts::default()),
        Arc::new(NullMemory),
        EventPublisher::disabled(),
    );

    let err = engine
        .process_step("nobody", 0, "anything", StepOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::SessionNotFound);
    assert_eq!(err.step(), Some(0));
    assert_eq!(executor.calls(), 0);
}
