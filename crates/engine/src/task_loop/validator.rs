//! Validation of raw reasoner replies into typed loop decisions.
//!
//! The reasoner speaks JSON; everything here normalizes that JSON at the
//! boundary so the loop only ever sees well-formed decisions. A malformed
//! reply is a validation error and fails the step without touching the page.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use taskloop_core_types::{ErrorKind, TaskLoopError};

/// What the reasoner wants the loop to do after this iteration.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    /// Keep iterating; requires an accompanying command.
    Continue,
    StopSuccess,
    StopFailure,
}

impl FlowControl {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "continue" => Some(Self::Continue),
            "stop_success" => Some(Self::StopSuccess),
            "stop_failure" => Some(Self::StopFailure),
            _ => None,
        }
    }
}

/// Page commands the loop is allowed to dispatch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    OpenPage,
    ClickElement,
    InputText,
    SaveVariable,
    GetDom,
    GetContent,
    GetSubDom,
}

impl CommandKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "OPEN_PAGE" => Some(Self::OpenPage),
            "CLICK_ELEMENT" => Some(Self::ClickElement),
            "INPUT_TEXT" => Some(Self::InputText),
            "SAVE_VARIABLE" => Some(Self::SaveVariable),
            "GET_DOM" => Some(Self::GetDom),
            "GET_CONTENT" => Some(Self::GetContent),
            "GET_SUB_DOM" => Some(Self::GetSubDom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenPage => "OPEN_PAGE",
            Self::ClickElement => "CLICK_ELEMENT",
            Self::InputText => "INPUT_TEXT",
            Self::SaveVariable => "SAVE_VARIABLE",
            Self::GetDom => "GET_DOM",
            Self::GetContent => "GET_CONTENT",
            Self::GetSubDom => "GET_SUB_DOM",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated decision extracted from one reasoner reply.
#[derive(Clone, Debug)]
pub struct ReasonerDecision {
    pub flow_control: FlowControl,
    pub command: Option<CommandKind>,
    pub params: Value,
    pub reasoning: Option<String>,
    /// Canonical confidence in [0,1], when the reasoner reported one.
    pub confidence: Option<f64>,
}

impl ReasonerDecision {
    pub fn parse(data: &Value) -> Result<Self, TaskLoopError> {
        let flow = data
            .get("flow_control")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskLoopError::validation("flow control missing from reasoner reply"))?;
        let flow_control = FlowControl::parse(flow).ok_or_else(|| {
            TaskLoopError::validation(format!("unknown flow control '{flow}'"))
        })?;

        let (command, params) = match data.get("command") {
            None | Some(Value::Null) => (None, Value::Null),
            Some(entry) => {
                let name = entry.get("type").and_then(Value::as_str).ok_or_else(|| {
                    TaskLoopError::validation("command entry missing 'type'")
                })?;
                let kind = CommandKind::parse(name).ok_or_else(|| {
                    TaskLoopError::new(
                        ErrorKind::UnsupportedTool,
                        format!("unsupported command '{name}'"),
                    )
                })?;
                let params = entry.get("params").cloned().unwrap_or(Value::Null);
                (Some(kind), params)
            }
        };

        if flow_control == FlowControl::Continue && command.is_none() {
            return Err(TaskLoopError::validation(
                "flow control 'continue' requires an accompanying command",
            ));
        }

        let reasoning = data
            .get("reasoning")
            .and_then(Value::as_str)
            .map(str::to_string);
        let confidence = match data.get("confidence") {
            None | Some(Value::Null) => None,
            Some(value) => Some(normalize_confidence(value)?),
        };

        Ok(Self {
            flow_control,
            command,
            params,
            reasoning,
            confidence,
        })
    }
}

/// Normalize the confidence formats reasoners actually emit onto [0,1]:
/// fractions pass through, percentages are divided by 100, and the
/// LOW/MEDIUM/HIGH vocabulary maps to fixed points.
pub fn normalize_confidence(value: &Value) -> Result<f64, TaskLoopError> {
    match value {
        Value::Number(number) => {
            let n = number.as_f64().ok_or_else(|| {
                TaskLoopError::validation("confidence is not a representable number")
            })?;
            if !n.is_finite() || n < 0.0 {
                return Err(TaskLoopError::validation(format!(
                    "confidence {n} out of range"
                )));
            }
            if n <= 1.0 {
                Ok(n)
            } else if n <= 100.0 {
                Ok(n / 100.0)
            } else {
                Err(TaskLoopError::validation(format!(
                    "confidence {n} out of range"
                )))
            }
        }
        Value::String(level) => match level.to_ascii_uppercase().as_str() {
            "LOW" => Ok(0.25),
            "MEDIUM" => Ok(0.5),
            "HIGH" => Ok(0.85),
            other => Err(TaskLoopError::validation(format!(
                "unknown confidence level '{other}'"
            ))),
        },
        _ => Err(TaskLoopError::validation(
            "confidence must be a number or a level string",
        )),
    }
}

/// Reflection outcome. Parsing is lenient: reflection is advisory, so an
/// unrecognized verdict proceeds rather than failing the step.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectVerdict {
    Proceed,
    Retry,
    Abort,
}

impl ReflectVerdict {
    pub fn parse(data: &Value) -> Self {
        let verdict = data
            .get("verdict")
            .or_else(|| data.get("decision"))
            .and_then(Value::as_str);
        match verdict.map(str::to_ascii_lowercase).as_deref() {
            Some("retry") => Self::Retry,
            Some("abort") => Self::Abort,
            _ => Self::Proceed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_flow_control_is_rejected() {
        let err = ReasonerDecision::parse(&json!({ "reasoning": "hm" })).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("flow control"));
    }

    #[test]
    fn continue_without_command_is_rejected() {
        let err = ReasonerDecision::parse(&json!({ "flow_control": "continue" })).unwrap_err();
        assert_eq!(
            err.to_string(),
            "flow control 'continue' requires an accompanying command"
        );
    }

    #[test]
    fn stop_success_needs_no_command() {
        let decision = ReasonerDecision::parse(&json!({
            "flow_control": "stop_success",
            "reasoning": "form already submitted",
            "confidence": 0.9,
        }))
        .unwrap();
        assert_eq!(decision.flow_control, FlowControl::StopSuccess);
        assert!(decision.command.is_none());
        assert_eq!(decision.confidence, Some(0.9));
    }

    #[test]
    fn continue_with_command_parses_params() {
        let decision = ReasonerDecision::parse(&json!({
            "flow_control": "continue",
            "command": { "type": "CLICK_ELEMENT", "params": { "selector": ".btn" } },
        }))
        .unwrap();
        assert_eq!(decision.command, Some(CommandKind::ClickElement));
        assert_eq!(decision.params["selector"], ".btn");
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = ReasonerDecision::parse(&json!({
            "flow_control": "continue",
            "command": { "type": "LAUNCH_MISSILES" },
        }))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedTool);
    }

    #[test]
    fn confidence_formats_normalize_to_fractions() {
        assert_eq!(normalize_confidence(&json!(0.85)).unwrap(), 0.85);
        assert_eq!(normalize_confidence(&json!(85)).unwrap(), 0.85);
        assert_eq!(normalize_confidence(&json!("HIGH")).unwrap(), 0.85);
        assert_eq!(normalize_confidence(&json!("low")).unwrap(), 0.25);
        assert_eq!(normalize_confidence(&json!("medium")).unwrap(), 0.5);
        assert!(normalize_confidence(&json!(101)).is_err());
        assert!(normalize_confidence(&json!(-0.2)).is_err());
        assert!(normalize_confidence(&json!(["nope"])).is_err());
    }

    #[test]
    fn reflect_verdicts_are_lenient() {
        assert_eq!(
            ReflectVerdict::parse(&json!({ "verdict": "retry" })),
            ReflectVerdict::Retry
        );
        assert_eq!(
            ReflectVerdict::parse(&json!({ "decision": "ABORT" })),
            ReflectVerdict::Abort
        );
        assert_eq!(
            ReflectVerdict::parse(&json!({ "verdict": "shrug" })),
            ReflectVerdict::Proceed
        );
        assert_eq!(ReflectVerdict::parse(&json!({})), ReflectVerdict::Proceed);
    }
}
