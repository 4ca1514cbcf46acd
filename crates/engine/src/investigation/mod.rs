//! Three-phase page-investigation sub-cycle.
//!
//! Before acting, the loop can ground its reasoning in actual page state:
//! Initial Assessment (screenshot analysis), Focused Exploration (text and
//! sub-DOM extraction), Selector Determination (sub-DOM and full-DOM
//! retrieval). Each phase aggregates tool confidences into a readiness
//! decision; only Selector Determination can ever be action-ready.

pub mod elements;
pub mod engine;
pub mod types;

pub use elements::extract_elements;
pub use engine::{aggregate_confidence, tools_for_phase, InvestigationEngine};
pub use types::{
    DiscoveredElement, InvestigationCycleResult, InvestigationState, PhaseResult, ToolKind,
    ToolResult,
};
