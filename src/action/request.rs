//! Trigger requests and the payload an action emits when it starts.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reply message of a successful request.
pub const MESSAGE_OK: &str = "ok";
/// Start refused because a run is active.
pub const ERROR_ALREADY_RUNNING: &str = "Already running";
/// No action start node matches the request.
pub const ERROR_ACTION_NOT_FOUND: &str = "Unable to find action start node";

/// What a trigger request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    /// Start a new run.
    Start,
    /// Cancel the active run.
    Stop,
    /// Cancel the active run and clear downstream node status.
    Reset,
}

impl TriggerType {
    /// Parse ignoring case and surrounding whitespace.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// `{ type, sessionId, runId, section, action }`; stop and reset requests
/// usually omit `runId`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    /// Requested transition.
    #[serde(rename = "type")]
    pub kind: TriggerType,
    /// Session the request belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Run id for `start`. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Section short name.
    pub section: String,
    /// Action name.
    pub action: String,
}

impl TriggerRequest {
    /// Request of `kind` for `section`/`action`.
    pub fn new(kind: TriggerType, section: &str, action: &str) -> Self {
        Self {
            kind,
            session_id: None,
            run_id: None,
            section: section.to_string(),
            action: action.to_string(),
        }
    }

    /// Start request.
    pub fn start(section: &str, action: &str) -> Self {
        Self::new(TriggerType::Start, section, action)
    }

    /// Stop request.
    pub fn stop(section: &str, action: &str) -> Self {
        Self::new(TriggerType::Stop, section, action)
    }

    /// Reset request.
    pub fn reset(section: &str, action: &str) -> Self {
        Self::new(TriggerType::Reset, section, action)
    }

    /// Attach a session id.
    pub fn with_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Attach a run id.
    pub fn with_run_id(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    /// Section and action lower-cased for lookup.
    pub fn normalized(&self) -> Self {
        Self {
            section: self.section.to_lowercase(),
            action: self.action.to_lowercase(),
            ..self.clone()
        }
    }
}

/// Reply to a [`TriggerRequest`]. Exactly one of `message` and `error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResult {
    /// Requested transition.
    #[serde(rename = "type")]
    pub kind: TriggerType,
    /// Echoed session id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Echoed run id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Echoed section.
    pub section: String,
    /// Echoed action.
    pub action: String,
    /// Set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TriggerResult {
    /// Success reply to `request`.
    pub fn ok(request: &TriggerRequest) -> Self {
        Self::reply(request, Some(MESSAGE_OK.to_string()), None)
    }

    /// Failure reply to `request`.
    pub fn failed(request: &TriggerRequest, error: impl Into<String>) -> Self {
        Self::reply(request, None, Some(error.into()))
    }

    fn reply(request: &TriggerRequest, message: Option<String>, error: Option<String>) -> Self {
        Self {
            kind: request.kind,
            session_id: request.session_id.clone(),
            run_id: request.run_id.clone(),
            section: request.section.clone(),
            action: request.action.clone(),
            message,
            error,
        }
    }

    /// Whether the request succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Sent downstream when an action starts, and carried back by the completion
/// node when the sequence finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionPayload {
    /// Session the run belongs to.
    pub session_id: String,
    /// Run id, generated when the request had none.
    pub run_id: String,
    /// Section short name
    pub section: String,
    /// Action name.
    pub action: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_json() {
        let request: TriggerRequest = serde_json::from_str(
            r#"{ "type": "start", "sessionId": "s-1", "runId": "r-1", "section": "DCV", "action": "Verify" }"#,
        )
        .unwrap();
        assert_eq!(request.kind, TriggerType::Start);
        assert_eq!(request.run_id.as_deref(), Some("r-1"));

        let stop: TriggerRequest =
            serde_json::from_str(r#"{ "type": "stop", "section": "dcv", "action": "verify" }"#).unwrap();
        assert_eq!(stop.kind, TriggerType::Stop);
        assert!(stop.run_id.is_none());
    }

    #[test]
    fn test_result_mirrors_request() {
        let request = TriggerRequest::start("DCV", "Verify").with_session("s-1");
        let ok = TriggerResult::ok(&request);
        assert_eq!(ok.message.as_deref(), Some("ok"));
        assert!(ok.is_ok());

        let failed = TriggerResult::failed(&request, ERROR_ALREADY_RUNNING);
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["type"], "start");
        assert_eq!(value["sessionId"], "s-1");
        assert_eq!(value["error"], "Already running");
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_trigger_type_parse() {
        assert_eq!(TriggerType::parse(" RESET "), Some(TriggerType::Reset));
        assert_eq!(TriggerType::parse("pause"), None);
        assert_eq!(TriggerType::Stop.to_string(), "stop");
    }

    #[test]
    fn test_normalized_lowercases_names() {
        let request = TriggerRequest::reset("DCV", "Verify 10V").normalized();
        assert_eq!(request.section, "dcv");
        assert_eq!(request.action, "verify 10v");
        assert_eq!(request.kind, TriggerType::Reset);
    }
}
