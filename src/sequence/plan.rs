//! Compiled plan and its wire form.

use crate::instruction::{DataType, Instruction, ParameterArgument};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What a `command` step does on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    /// Read only.
    Read,
    /// Write only.
    Write,
    /// Write, then read.
    Query,
}

impl CommandKind {
    /// Parse `read`, `write` or `query`.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "read" => Some(CommandKind::Read),
            "write" => Some(CommandKind::Write),
            "query" => Some(CommandKind::Query),
            _ => None,
        }
    }

    /// Whether the step reads a response.
    pub fn reads(self) -> bool {
        matches!(self, CommandKind::Read | CommandKind::Query)
    }

    /// Whether the step writes.
    pub fn writes(self) -> bool {
        matches!(self, CommandKind::Write | CommandKind::Query)
    }

    fn as_str(self) -> &'static str {
        match self {
            CommandKind::Read => "read",
            CommandKind::Write => "write",
            CommandKind::Query => "query",
        }
    }
}

/// Parse the sequence builder's read data type names.
pub fn parse_read_data_type(text: &str) -> Option<DataType> {
    match text.to_ascii_lowercase().as_str() {
        "string" | "char" => Some(DataType::String),
        "number" | "integer" | "single" | "double" | "float32" | "float64" | "byte" | "int16"
        | "int32" | "int64" => Some(DataType::Number),
        "boolean" => Some(DataType::Boolean),
        "binary" | "bytearray" => Some(DataType::Binary),
        _ => None,
    }
}

/// How a read or query response is collected.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadSpec {
    /// Type the response converts to.
    pub data_type: DataType,
    /// Exact byte count; `None` reads up to the terminator.
    pub length: Option<usize>,
    /// Tag the response is stored under.
    pub response_tag: String,
}

/// A catalog instruction snapshot with its bound arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundInstruction {
    /// Instruction as found in the catalog.
    pub instruction: Instruction,
    /// Argument values bound at compile time.
    pub arguments: Vec<ParameterArgument>,
}

/// A validated `command` step.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandStep {
    /// Device to address.
    pub unit_id: String,
    /// Link usage.
    pub kind: CommandKind,
    /// Literal text sent when there is no instruction.
    pub write_data: Option<String>,
    /// Set for reads and queries.
    pub read: Option<ReadSpec>,
    /// Catalog instruction rendered at run time.
    pub instruction: Option<BoundInstruction>,
    /// Read attempts from the instruction; the executor policy applies when absent.
    pub read_attempts: Option<u32>,
    /// Pause before the step.
    pub delay_before: Duration,
    /// Pause after the step.
    pub delay_after: Duration,
}

/// What a `reset` step clears.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetTarget {
    /// Selected device clear of the unit
    Device {
        /// Device to clear
        unit_id: String,
    },
    /// Controller reset of the interface
    Interface {
        /// Interface to reset
        interface_id: String,
    },
}

/// One compiled step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Write and/or read on a device.
    Command(CommandStep),
    /// Renders a `setVariable` instruction into the run's variable table.
    SetVariable {
        /// Variable assigned
        variable: String,
        /// Instruction whose text becomes the value
        instruction: BoundInstruction,
    },
    /// Pause.
    Delay(Duration),
    /// Device or interface reset.
    Reset(ResetTarget),
    /// Group execute trigger.
    Trigger {
        /// Device to trigger
        unit_id: String,
    },
}

impl Step {
    /// Operation type reported in step results.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Step::Command(_) | Step::SetVariable { .. } => "command",
            Step::Delay(_) => "delay",
            Step::Reset(_) => "reset",
            Step::Trigger { .. } => "trigger",
        }
    }

    /// Unit the step addresses, if any.
    pub fn unit_id(&self) -> Option<&str> {
        match self {
            Step::Command(command) => Some(&command.unit_id),
            Step::Reset(ResetTarget::Device { unit_id }) | Step::Trigger { unit_id } => Some(unit_id),
            _ => None,
        }
    }

    /// Wire form carrying only the fields relevant to the step kind.
    pub fn resolved(&self) -> ResolvedOperation {
        let mut op = ResolvedOperation {
            kind: self.kind_name().to_string(),
            ..Default::default()
        };
        match self {
            Step::Command(command) => {
                op.command_type = Some(command.kind.as_str().to_string());
                op.unit_id = Some(command.unit_id.clone());
                op.write_data = command.write_data.clone();
                op.instruction_id = command.instruction.as_ref().map(|b| b.instruction.id.clone());
                if let Some(read) = &command.read {
                    op.read_data_type = Some(read.data_type);
                    op.use_read_length = Some(read.length.is_some());
                    op.read_length = read.length;
                    op.response_tag = Some(read.response_tag.clone());
                }
            }
            Step::SetVariable { instruction, .. } => {
                op.command_type = Some("setVariable".to_string());
                op.instruction_id = Some(instruction.instruction.id.clone());
            }
            Step::Delay(delay) => op.delay = Some(delay.as_millis() as u64),
            Step::Reset(ResetTarget::Device { unit_id }) => {
                op.reset_type = Some("device".to_string());
                op.unit_id = Some(unit_id.clone());
            }
            Step::Reset(ResetTarget::Interface { interface_id }) => {
                op.reset_type = Some("interface".to_string());
                op.interface_id = Some(interface_id.clone());
            }
            Step::Trigger { unit_id } => op.unit_id = Some(unit_id.clone()),
        }
        op
    }
}

/// A validated sequence, ready to execute.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    /// Steps in execution order.
    pub steps: Vec<Step>,
    /// Emit every step result in one batch at the end.
    pub respond_in_bulk: bool,
}

impl Plan {
    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Set the bulk flag.
    pub fn with_respond_in_bulk(mut self, respond_in_bulk: bool) -> Self {
        self.respond_in_bulk = respond_in_bulk;
        self
    }

    /// Units addressed anywhere in the plan, deduplicated in first-use order.
    pub fn unit_ids(&self) -> Vec<&str> {
        let mut units: Vec<&str> = Vec::new();
        for unit in self.steps.iter().filter_map(Step::unit_id) {
            if !units.contains(&unit) {
                units.push(unit);
            }
        }
        units
    }

    /// Wire form of the plan.
    pub fn payload(&self) -> SequencePayload {
        SequencePayload {
            respond_in_bulk: self.respond_in_bulk,
            operations: self.steps.iter().map(Step::resolved).collect(),
        }
    }
}

/// One compiled step as sent downstream.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedOperation {
    /// Operation type.
    #[serde(rename = "type")]
    pub kind: String,
    /// `read`, `write` or `query`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,
    /// Device addressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    /// Catalog instruction id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_id: Option<String>,
    /// Literal write data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_data: Option<String>,
    /// Response type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_data_type: Option<DataType>,
    /// Set for length reads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_read_length: Option<bool>,
    /// Byte count of a length read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_length: Option<usize>,
    /// Response tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tag: Option<String>,
    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    /// `device` or `interface`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_type: Option<String>,
    /// Interface to reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_id: Option<String>,
}

/// Bulk payload: every resolved operation at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequencePayload {
    /// Always `true`.
    pub respond_in_bulk: bool,
    /// Every resolved operation in order.
    pub operations: Vec<ResolvedOperation>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_strips_irrelevant_fields() {
        let step = Step::Reset(ResetTarget::Interface {
            interface_id: "bench".into(),
        });
        let value = serde_json::to_value(step.resolved()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "type": "reset", "resetType": "interface", "interfaceId": "bench" })
        );
    }

    #[test]
    fn test_query_wire_form() {
        let step = Step::Command(CommandStep {
            unit_id: "DMM1".into(),
            kind: CommandKind::Query,
            write_data: Some("*IDN?".into()),
            read: Some(ReadSpec {
                data_type: DataType::String,
                length: None,
                response_tag: "idn".into(),
            }),
            instruction: None,
            read_attempts: None,
            delay_before: Duration::ZERO,
            delay_after: Duration::ZERO,
        });
        let value = serde_json::to_value(step.resolved()).unwrap();
        assert_eq!(value["commandType"], "query");
        assert_eq!(value["readDataType"], "String");
        assert_eq!(value["useReadLength"], false);
        assert!(value.get("delay").is_none());
    }

    #[test]
    fn test_unit_ids_are_deduplicated() {
        let plan = Plan {
            steps: vec![
                Step::Trigger { unit_id: "A".into() },
                Step::Delay(Duration::from_millis(5)),
                Step::Reset(ResetTarget::Device { unit_id: "B".into() }),
                Step::Trigger { unit_id: "A".into() },
            ],
            respond_in_bulk: true,
        };
        assert_eq!(plan.unit_ids(), vec!["A", "B"]);
        assert!(plan.payload().respond_in_bulk);
    }

    #[test]
    fn test_read_data_type_names() {
        assert_eq!(parse_read_data_type("byteArray"), Some(DataType::Binary));
        assert_eq!(parse_read_data_type("double"), Some(DataType::Number));
        assert_eq!(parse_read_data_type("String"), Some(DataType::String));
        assert_eq!(parse_read_data_type("blob"), None);
    }
}
