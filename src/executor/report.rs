//! Records emitted while a plan runs.

use crate::instruction::ResponseValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Plan index of the step.
    pub index: usize,
    /// Run the step belongs to.
    pub run_id: String,
    /// Operation type, e.g. `command` or `delay`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Device the step addressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    /// Text sent to the device, or assigned to a variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Tag the response is stored under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tag: Option<String>,
    /// Response text as read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<String>,
    /// Response converted to its declared type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ResponseValue>,
    /// Read attempts used; zero for steps that do not read
    pub attempts: u32,
    /// Set when the step failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the step finished.
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    /// Empty result for step `index`.
    pub fn new(index: usize, run_id: &str, kind: &str, unit_id: Option<&str>) -> Self {
        Self {
            index,
            run_id: run_id.to_string(),
            kind: kind.to_string(),
            unit_id: unit_id.map(str::to_string),
            command: None,
            response_tag: None,
            raw_value: None,
            value: None,
            attempts: 0,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Whether the step succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Every step result of a bulk run, sent once at the end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBatch {
    /// Always `true`; marks the bulk form downstream.
    pub respond_in_bulk: bool,
    /// Results in plan order.
    pub results: Vec<StepResult>,
}

/// What the executor sends downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionEvent {
    /// Bulk mode: everything at the end.
    Batch(StepBatch),
    /// Per-step mode: one result as it completes.
    Step(StepResult),
}
