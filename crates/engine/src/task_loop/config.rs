//! Loop and investigation configuration.

use serde::{Deserialize, Serialize};

/// Limits of the page-investigation sub-cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationConfig {
    /// Phase confidence required to advance (and, on the final phase, to be
    /// action-ready).
    pub confidence_threshold: f64,
    /// Phase attempts allowed per cycle, retries included.
    pub max_investigation_rounds: u32,
    /// Character cap on extracted page text.
    pub max_text_content: usize,
    /// Byte cap requested for sub-DOM fragments.
    pub max_sub_dom_size: usize,
    /// Byte cap on full-DOM retrieval; an oversized page fails the tool.
    pub max_dom_size: usize,
    /// Element discoveries reported per tool invocation.
    pub max_elements_per_tool: usize,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.75,
            max_investigation_rounds: 6,
            max_text_content: 5_000,
            max_sub_dom_size: 50_000,
            max_dom_size: 100_000,
            max_elements_per_tool: 25,
        }
    }
}

/// Tunables of the ACT-REFLECT loop.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskLoopConfig {
    /// Iterations allowed per step before the step fails.
    pub max_iterations: u32,
    /// Run the investigation sub-cycle before reasoning.
    pub enable_investigation: bool,
    /// Run the REFLECT pass after a failed or low-confidence ACT.
    pub enable_reflection: bool,
    /// ACT confidence below this warrants reflection even on success.
    pub reflection_confidence_threshold: f64,
    pub investigation: InvestigationConfig,
}

impl Default for TaskLoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            enable_investigation: true,
            enable_reflection: true,
            reflection_confidence_threshold: 0.7,
            investigation: InvestigationConfig::default(),
        }
    }
}

impl TaskLoopConfig {
    /// Bare loop for tests and simple deployments: no investigation, no
    /// reflection, few iterations.
    pub fn minimal() -> Self {
        Self {
            max_iterations: 3,
            enable_investigation: false,
            enable_reflection: false,
            ..Self::default()
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_investigation(mut self, enabled: bool) -> Self {
        self.enable_investigation = enabled;
        self
    }

    pub fn with_reflection(mut self, enabled: bool) -> Self {
        self.enable_reflection = enabled;
        self
    }

    pub fn with_reflection_confidence_threshold(mut self, threshold: f64) -> Self {
        self.reflection_confidence_threshold = threshold.clamp(0.0, 1.0);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = TaskLoopConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert!(config.enable_investigation);
        assert!(config.enable_reflection);
        assert!((config.investigation.confidence_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.investigation.max_dom_size, 100_000);
    }

    #[test]
    fn minimal_disables_optional_passes() {
        let config = TaskLoopConfig::minimal();
        assert!(!config.enable_investigation);
        assert!(!config.enable_reflection);
        assert_eq!(config.max_iterations, 3);
    }

    #[test]
    fn builders_clamp_inputs() {
        let config = TaskLoopConfig::default()
            .with_max_iterations(0)
            .with_reflection_confidence_threshold(1.5);
        assert_eq!(config.max_iterations, 1);
        assert!((config.reflection_confidence_threshold - 1.0).abs() < f64::EPSILON);
    }
}
