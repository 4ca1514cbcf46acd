//! Data types for the investigation sub-cycle.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use taskloop_core_types::InvestigationPhase;

/// Investigation tools, selected per phase by a fixed table rather than
/// freely by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    ScreenshotAnalysis,
    TextExtraction,
    SubDomExtraction,
    FullDomRetrieval,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ScreenshotAnalysis => "screenshot_analysis",
            Self::TextExtraction => "text_extraction",
            Self::SubDomExtraction => "sub_dom_extraction",
            Self::FullDomRetrieval => "full_dom_retrieval",
        };
        f.write_str(label)
    }
}

/// Page element surfaced by a tool invocation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiscoveredElement {
    pub selector: String,
    pub element_type: String,
    pub confidence: f64,
    pub discovery_method: String,
}

/// Result of one tool invocation; consumed by the phase that produced it and
/// never persisted beyond it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub tool: ToolKind,
    pub output: serde_json::Value,
    pub elements: Vec<DiscoveredElement>,
    /// Canonical confidence in [0,1].
    pub confidence: f64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn failed(tool: ToolKind, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            tool,
            output: serde_json::Value::Null,
            elements: Vec::new(),
            confidence: 0.0,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// Outcome of one investigation phase attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: InvestigationPhase,
    pub tool_results: Vec<ToolResult>,
    /// Arithmetic mean over all attempted tools; 0 when none ran.
    pub confidence: f64,
    /// True only for SelectorDetermination at or above threshold.
    pub ready_for_action: bool,
    /// Phase to attempt next; the same phase means retry.
    pub recommended_next: Option<InvestigationPhase>,
}

/// Mutable state of one investigation cycle, owned by the engine that runs it.
#[derive(Clone, Debug)]
pub struct InvestigationState {
    pub current_phase: InvestigationPhase,
    pub phases_completed: Vec<InvestigationPhase>,
    pub investigation_round: u32,
    pub max_investigation_rounds: u32,
    pub tools_used: Vec<ToolKind>,
    pub elements_discovered: Vec<DiscoveredElement>,
    pub started_at: Instant,
    pub phase_started_at: Instant,
}

impl InvestigationState {
    pub fn new(max_investigation_rounds: u32) -> Self {
        let now = Instant::now();
        Self {
            current_phase: InvestigationPhase::InitialAssessment,
            phases_completed: Vec::new(),
            investigation_round: 0,
            max_investigation_rounds: max_investigation_rounds.max(1),
            tools_used: Vec::new(),
            elements_discovered: Vec::new(),
            started_at: now,
            phase_started_at: now,
        }
    }

    pub fn begin_phase(&mut self, phase: InvestigationPhase) {
        self.current_phase = phase;
        self.phase_started_at = Instant::now();
    }

    pub fn rounds_exhausted(&self) -> bool {
        self.investigation_round >= self.max_investigation_rounds
    }
}

/// Final outcome of a full investigation cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvestigationCycleResult {
    /// The cycle itself completed; an inconclusive cycle is still a success.
    pub success: bool,
    pub ready_for_action: bool,
    pub rounds: u32,
    pub phases: Vec<PhaseResult>,
    pub elements_discovered: Vec<DiscoveredElement>,
    pub duration_ms: u64,
}

impl InvestigationCycleResult {
    /// Synthesized context folded into the action prompt.
    pub fn context_summary(&self) -> String {
        let mut summary = String::new();
        for result in &self.phases {
            summary.push_str(&format!(
                "phase {} confidence {:.2}\n",
                result.phase, result.confidence
            ));
        }
        if self.elements_discovered.is_empty() {
            summary.push_str("no elements discovered\n");
        } else {
            summary.push_str("discovered elements:\n");
            for element in self.elements_discovered.iter().take(20) {
                summary.push_str(&format!(
                    "  {} ({}, confidence {:.2})\n",
                    element.selector, element.element_type, element.confidence
                ));
            }
        }
        summary.push_str(&format!(
            "ready_for_action: {} after {} round(s)\n",
            self.ready_for_action, self.rounds
        ));
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_starts_at_initial_assessment() {
        let state = InvestigationState::new(4);
        assert_eq!(state.current_phase, InvestigationPhase::InitialAssessment);
        assert_eq!(state.investigation_round, 0);
        assert!(!state.rounds_exhausted());
    }

    #[test]
    fn summary_mentions_elements_and_readiness() {
        let result = InvestigationCycleResult {
            success: true,
            ready_for_action: true,
            rounds: 3,
            phases: Vec::new(),
            elements_discovered: vec![DiscoveredElement {
                selector: "#submit".to_string(),
                element_type: "button".to_string(),
                confidence: 0.9,
                discovery_method: "id_attribute".to_string(),
            }],
            duration_ms: 12,
        };
        let summary = result.context_summary();
        assert!(summary.contains("#submit"));
        assert!(summary.contains("ready_for_action: true"));
    }
}
