//! Investigation cycle orchestration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};

use taskloop_core_types::{InvestigationPhase, SessionId, TaskLoopError};
use taskloop_event_bus::{EventPublisher, TaskLoopEventType};

use crate::collaborators::{CommandExecutor, WorkingMemoryStore};
use crate::investigation::elements::extract_elements;
use crate::investigation::types::{
    DiscoveredElement, InvestigationCycleResult, InvestigationState, PhaseResult, ToolKind,
    ToolResult,
};
use crate::metrics;
use crate::task_loop::config::InvestigationConfig;

/// Tool selection is fixed per phase, not chosen by the caller.
pub fn tools_for_phase(phase: InvestigationPhase) -> &'static [ToolKind] {
    match phase {
        InvestigationPhase::InitialAssessment => &[ToolKind::ScreenshotAnalysis],
        InvestigationPhase::FocusedExploration => {
            &[ToolKind::TextExtraction, ToolKind::SubDomExtraction]
        }
        InvestigationPhase::SelectorDetermination => {
            &[ToolKind::SubDomExtraction, ToolKind::FullDomRetrieval]
        }
    }
}

/// Phase confidence: arithmetic mean over all attempted tools, failures
/// included at their reported (zero) confidence. Zero tools means zero
/// confidence, never a division by zero.
pub fn aggregate_confidence(results: &[ToolResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    results.iter().map(|r| r.confidence).sum::<f64>() / results.len() as f64
}

/// Runs the three-phase investigation sub-cycle against the page-automation
/// backend and folds discoveries into working memory and the event stream.
pub struct InvestigationEngine {
    config: InvestigationConfig,
    executor: Arc<dyn CommandExecutor>,
    memory: Arc<dyn WorkingMemoryStore>,
    publisher: Arc<EventPublisher>,
}

impl InvestigationEngine {
    pub fn new(
        config: InvestigationConfig,
        executor: Arc<dyn CommandExecutor>,
        memory: Arc<dyn WorkingMemoryStore>,
        publisher: Arc<EventPublisher>,
    ) -> Self {
        Self {
            config,
            executor,
            memory,
            publisher,
        }
    }

    pub fn config(&self) -> &InvestigationConfig {
        &self.config
    }

    /// Run a full cycle. An inconclusive cycle (round cap hit below the
    /// confidence threshold) is still a successful cycle with
    /// `ready_for_action: false`; only a timeout or a transport-level fault
    /// is an error.
    pub async fn run_cycle(
        &self,
        session: &SessionId,
        workflow_session_id: &str,
        step_index: u32,
        timeout_ms: Option<u64>,
    ) -> Result<InvestigationCycleResult, TaskLoopError> {
        let cycle = self.run_cycle_inner(session, workflow_session_id, step_index);
        let outcome = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), cycle).await {
                Ok(result) => result,
                Err(_) => Err(TaskLoopError::timeout(format!(
                    "investigation timed out after {ms}ms"
                ))
                .with_session(session.clone())
                .with_step(step_index)),
            },
            None => cycle.await,
        };
        if let Err(err) = &outcome {
            self.publisher
                .publish(
                    TaskLoopEventType::InvestigationFailed,
                    session.clone(),
                    Some(step_index),
                    json!({ "error": err.to_string() }),
                )
                .await;
        }
        outcome
    }

    async fn run_cycle_inner(
        &self,
        session: &SessionId,
        workflow_session_id: &str,
        step_index: u32,
    ) -> Result<InvestigationCycleResult, TaskLoopError> {
        let mut state = InvestigationState::new(self.config.max_investigation_rounds);
        self.publisher
            .publish(
                TaskLoopEventType::InvestigationStarted,
                session.clone(),
                Some(step_index),
                json!({ "max_rounds": state.max_investigation_rounds }),
            )
            .await;

        let mut phases = Vec::new();
        let mut ready = false;
        loop {
            let phase = state.current_phase;
            state.begin_phase(phase);
            let result = self
                .run_phase(session, workflow_session_id, step_index, phase)
                .await;

            state.investigation_round += 1;
            state.phases_completed.push(phase);
            for tool_result in &result.tool_results {
                state.tools_used.push(tool_result.tool);
                state
                    .elements_discovered
                    .extend(tool_result.elements.iter().cloned());
            }

            ready = result.ready_for_action;
            let next = result.recommended_next;
            phases.push(result);

            if ready || state.rounds_exhausted() {
                break;
            }
            match next {
                Some(phase) => state.begin_phase(phase),
                None => break,
            }
        }

        let result = InvestigationCycleResult {
            success: true,
            ready_for_action: ready,
            rounds: state.investigation_round,
            phases,
            elements_discovered: state.elements_discovered.clone(),
            duration_ms: state.started_at.elapsed().as_millis() as u64,
        };
        metrics::record_investigation_cycle(ready);
        self.publisher
            .publish(
                TaskLoopEventType::InvestigationCompleted,
                session.clone(),
                Some(step_index),
                json!({
                    "ready_for_action": result.ready_for_action,
                    "rounds": result.rounds,
                    "elements_discovered": result.elements_discovered.len(),
                }),
            )
            .await;
        Ok(result)
    }

    /// Run one phase: invoke its fixed tool set, forward discoveries, and
    /// aggregate confidence into a readiness/advance recommendation. A tool
    /// failure never aborts the phase.
    pub async fn run_phase(
        &self,
        session: &SessionId,
        workflow_session_id: &str,
        step_index: u32,
        phase: InvestigationPhase,
    ) -> PhaseResult {
        self.publisher
            .publish(
                TaskLoopEventType::InvestigationPhaseStarted,
                session.clone(),
                Some(step_index),
                json!({ "phase": phase.to_string() }),
            )
            .await;

        let mut tool_results = Vec::new();
        for tool in tools_for_phase(phase) {
            self.publisher
                .publish(
                    TaskLoopEventType::InvestigationToolStarted,
                    session.clone(),
                    Some(step_index),
                    json!({ "tool": tool.to_string(), "phase": phase.to_string() }),
                )
                .await;

            let result = self.run_tool(session, *tool).await;

            self.publisher
                .publish(
                    TaskLoopEventType::InvestigationToolCompleted,
                    session.clone(),
                    Some(step_index),
                    json!({
                        "tool": tool.to_string(),
                        "success": result.success,
                        "confidence": result.confidence,
                    }),
                )
                .await;

            self.forward_discoveries(session, workflow_session_id, step_index, &result.elements)
                .await;
            tool_results.push(result);
        }

        let confidence = aggregate_confidence(&tool_results);
        let ready_for_action = phase.is_final() && confidence >= self.config.confidence_threshold;
        let recommended_next = if ready_for_action {
            None
        } else if confidence >= self.config.confidence_threshold {
            phase.next()
        } else {
            Some(phase)
        };

        debug!(
            phase = %phase,
            confidence,
            ready_for_action,
            "investigation phase finished"
        );
        self.publisher
            .publish(
                TaskLoopEventType::InvestigationPhaseCompleted,
                session.clone(),
                Some(step_index),
                json!({
                    "phase": phase.to_string(),
                    "confidence": confidence,
                    "ready_for_action": ready_for_action,
                }),
            )
            .await;

        PhaseResult {
            phase,
            tool_results,
            confidence,
            ready_for_action,
            recommended_next,
        }
    }

    /// Invoke a single tool with phase-appropriate defaults. Failures are
    /// recorded as failed results with zero confidence, never raised.
    pub async fn run_tool(&self, session: &SessionId, tool: ToolKind) -> ToolResult {
        let start = Instant::now();
        let outcome = match tool {
            ToolKind::ScreenshotAnalysis => self.screenshot_analysis(session).await,
            ToolKind::TextExtraction => self.text_extraction(session).await,
            ToolKind::SubDomExtraction => self.sub_dom_extraction(session).await,
            ToolKind::FullDomRetrieval => self.full_dom_retrieval(session).await,
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let mut result = match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!(tool = %tool, "investigation tool failed: {}", err.log_line());
                ToolResult::failed(tool, err.to_string(), duration_ms)
            }
        };
        result.duration_ms = duration_ms;
        result
    }

    async fn forward_discoveries(
        &self,
        session: &SessionId,
        workflow_session_id: &str,
        step_index: u32,
        elements: &[DiscoveredElement],
    ) {
        for element in elements {
            self.publisher
                .publish(
                    TaskLoopEventType::ElementDiscovered,
                    session.clone(),
                    Some(step_index),
                    json!({
                        "selector": element.selector,
                        "element_type": element.element_type,
                        "confidence": element.confidence,
                        "discovery_method": element.discovery_method,
                    }),
                )
                .await;
            match self
                .memory
                .add_page_element_discovery(workflow_session_id, element)
                .await
            {
                Ok(()) => {
                    self.publisher
                        .publish(
                            TaskLoopEventType::WorkingMemoryUpdated,
                            session.clone(),
                            Some(step_index),
                            json!({ "selector": element.selector }),
                        )
                        .await;
                }
                Err(err) => {
                    warn!("working memory update failed: {}", err.log_line());
                }
            }
        }
    }

    async fn screenshot_analysis(&self, session: &SessionId) -> Result<ToolResult, TaskLoopError> {
        let response = self.executor.capture_screenshot(session).await?;
        if !response.success {
            return Ok(ToolResult::failed(
                ToolKind::ScreenshotAnalysis,
                response.error_message(),
                0,
            ));
        }
        let mut confidence = 0.5;
        if response.screenshot_id.is_some() {
            confidence += 0.2;
        }
        if response.metadata.is_some() {
            confidence += 0.1;
        }
        Ok(ToolResult {
            success: true,
            tool: ToolKind::ScreenshotAnalysis,
            output: json!({ "screenshot_id": response.screenshot_id }),
            elements: Vec::new(),
            confidence,
            duration_ms: 0,
            error: None,
        })
    }

    async fn text_extraction(&self, session: &SessionId) -> Result<ToolResult, TaskLoopError> {
        let response = self
            .executor
            .get_content(session, Some("body"), None, false)
            .await?;
        if !response.success {
            return Ok(ToolResult::failed(
                ToolKind::TextExtraction,
                response.error_message(),
                0,
            ));
        }
        let content = response.dom.unwrap_or_default();
        let truncated: String = content.chars().take(self.config.max_text_content).collect();
        let confidence = if truncated.is_empty() {
            0.1
        } else {
            let ratio = (truncated.len() as f64 / self.config.max_text_content as f64).min(1.0);
            0.3 + 0.5 * ratio
        };
        Ok(ToolResult {
            success: true,
            tool: ToolKind::TextExtraction,
            output: json!({ "content_chars": truncated.len() }),
            elements: Vec::new(),
            confidence,
            duration_ms: 0,
            error: None,
        })
    }

    async fn sub_dom_extraction(&self, session: &SessionId) -> Result<ToolResult, TaskLoopError> {
        let response = self
            .executor
            .get_sub_dom(session, "body", self.config.max_sub_dom_size)
            .await?;
        if !response.success {
            return Ok(ToolResult::failed(
                ToolKind::SubDomExtraction,
                response.error_message(),
                0,
            ));
        }
        let fragment = response.dom.unwrap_or_default();
        let elements = extract_elements(
            &fragment,
            "sub_dom_extraction",
            self.config.max_elements_per_tool,
        );
        let confidence = if fragment.is_empty() {
            0.1
        } else {
            (0.3 + 0.05 * elements.len() as f64).min(0.9)
        };
        Ok(ToolResult {
            success: true,
            tool: ToolKind::SubDomExtraction,
            output: json!({ "fragment_bytes": fragment.len(), "elements": elements.len() }),
            elements,
            confidence,
            duration_ms: 0,
            error: None,
        })
    }

    async fn full_dom_retrieval(&self, session: &SessionId) -> Result<ToolResult, TaskLoopError> {
        let response = self.executor.get_dom(session).await?;
        if !response.success {
            return Ok(ToolResult::failed(
                ToolKind::FullDomRetrieval,
                response.error_message(),
                0,
            ));
        }
        let dom = response.dom.unwrap_or_default();
        if dom.len() > self.config.max_dom_size {
            // Fails the tool, not the phase.
            return Ok(ToolResult::failed(
                ToolKind::FullDomRetrieval,
                format!(
                    "page exceeds maximum DOM size ({} bytes)",
                    self.config.max_dom_size
                ),
                0,
            ));
        }
        let elements = extract_elements(
            &dom,
            "full_dom_retrieval",
            self.config.max_elements_per_tool,
        );
        let confidence = if dom.is_empty() {
            0.1
        } else {
            (0.4 + 0.05 * elements.len() as f64).min(0.95)
        };
        Ok(ToolResult {
            success: true,
            tool: ToolKind::FullDomRetrieval,
            output: json!({ "dom_bytes": dom.len(), "elements": elements.len() }),
            elements,
            confidence,
            duration_ms: 0,
            error: None,
        })
    }
}
