//! Contracts of the external collaborators the loop calls into.
//!
//! The page-automation backend, reasoning client, prompt component, and
//! working-memory store all live outside this core; the loop only depends on
//! the trait surfaces below and treats every call as a suspension point.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskloop_core_types::{InvestigationPhase, SessionId, TaskLoopError};

use crate::investigation::DiscoveredElement;

/// Verdict of the reasoning service transport layer.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonerStatus {
    Success,
    Error,
}

/// Reply from one reasoning request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReasonerReply {
    pub status: ReasonerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReasonerReply {
    pub fn success(data: Value) -> Self {
        Self {
            status: ReasonerStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReasonerStatus::Error,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Reasoning/AI network client.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn send_request(&self, prompt: &str) -> Result<ReasonerReply, TaskLoopError>;
}

/// Response from the page-automation backend for one command.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dom: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn ok_with_dom(dom: impl Into<String>) -> Self {
        Self {
            success: true,
            dom: Some(dom.into()),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .unwrap_or_else(|| "unknown command failure".to_string())
    }
}

/// Page-automation backend, addressed by session id; the loop never holds
/// page state beyond what the current decision needs.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn open_page(
        &self,
        session: &SessionId,
        url: &str,
    ) -> Result<CommandResponse, TaskLoopError>;

    async fn click_element(
        &self,
        session: &SessionId,
        selector: &str,
    ) -> Result<CommandResponse, TaskLoopError>;

    async fn input_text(
        &self,
        session: &SessionId,
        selector: &str,
        text: &str,
    ) -> Result<CommandResponse, TaskLoopError>;

    async fn save_variable(
        &self,
        session: &SessionId,
        name: &str,
        value: &Value,
    ) -> Result<CommandResponse, TaskLoopError>;

    async fn get_dom(&self, session: &SessionId) -> Result<CommandResponse, TaskLoopError>;

    async fn get_content(
        &self,
        session: &SessionId,
        selector: Option<&str>,
        attribute: Option<&str>,
        multiple: bool,
    ) -> Result<CommandResponse, TaskLoopError>;

    async fn get_sub_dom(
        &self,
        session: &SessionId,
        selector: &str,
        max_size: usize,
    ) -> Result<CommandResponse, TaskLoopError>;

    async fn capture_screenshot(
        &self,
        session: &SessionId,
    ) -> Result<CommandResponse, TaskLoopError>;
}

/// Context handed to the prompt component.
#[derive(Clone, Debug)]
pub struct PromptContext<'a> {
    pub workflow_session_id: &'a str,
    pub step_index: u32,
    pub step_content: &'a str,
    pub iteration: u32,
    pub working_memory: Option<&'a Value>,
}

/// Prompt-templating component: pure functions from step context to
/// renderable text. A failure here aborts the step.
pub trait PromptBuilder: Send + Sync {
    fn step_prompt(&self, ctx: &PromptContext<'_>) -> Result<String, TaskLoopError>;

    fn investigation_prompt(
        &self,
        ctx: &PromptContext<'_>,
        phase: InvestigationPhase,
    ) -> Result<String, TaskLoopError>;

    fn action_with_investigation_prompt(
        &self,
        ctx: &PromptContext<'_>,
        investigation_summary: &str,
    ) -> Result<String, TaskLoopError>;

    fn reflection_prompt(
        &self,
        ctx: &PromptContext<'_>,
        act_summary: &str,
    ) -> Result<String, TaskLoopError>;
}

/// Long-term context store keyed by workflow session id. Writes are
/// best-effort from the loop's perspective.
#[async_trait]
pub trait WorkingMemoryStore: Send + Sync {
    async fn get_working_memory(&self, workflow_session_id: &str)
        -> Result<Value, TaskLoopError>;

    async fn update_working_memory(
        &self,
        workflow_session_id: &str,
        memory: Value,
    ) -> Result<(), TaskLoopError>;

    async fn add_page_element_discovery(
        &self,
        workflow_session_id: &str,
        element: &DiscoveredElement,
    ) -> Result<(), TaskLoopError>;
}
