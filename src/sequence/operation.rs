//! Author-facing operation records.
//!
//! These mirror what the sequence builder stores: nearly every field is
//! optional and only meaningful for some operation kinds. Nothing is checked
//! at deserialization time; the compiler does all validation so the author
//! gets every problem at once.

use crate::error::AppResult;
use crate::instruction::ParameterArgument;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// How a bindable field's raw value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingKind {
    /// The raw value is the value.
    #[default]
    #[serde(alias = "str", alias = "num", alias = "bool", alias = "json")]
    Literal,
    /// Dotted path into the trigger message.
    Msg,
    /// Key in the flow context.
    Flow,
    /// Key in the global context.
    Global,
    /// Name of a process environment variable.
    Env,
    /// Any other typed-input kind; never resolves.
    #[serde(other)]
    Unsupported,
}

/// Reference to a catalog instruction plus its argument values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionReference {
    /// Catalog instruction id.
    pub instruction_id: String,
    /// Values for the instruction's parameters.
    #[serde(default)]
    pub arguments: Vec<ParameterArgument>,
}

/// One authored sequence step, before validation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// `command`, `delay`, `reset` or `trigger`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Device to address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<Value>,
    /// How `unit_id` is resolved.
    #[serde(default, alias = "unitIdPropertyType")]
    pub unit_id_binding_kind: BindingKind,

    /// `read`, `write` or `query`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_type: Option<String>,

    /// Text to write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_data: Option<Value>,
    /// How `write_data` is resolved.
    #[serde(default, alias = "writeDataPropertyType")]
    pub write_data_binding_kind: BindingKind,

    /// Builder name of the response type, e.g. `float64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_data_type: Option<String>,
    /// Read exactly `read_length` bytes instead of up to the terminator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_read_length: Option<bool>,
    /// Byte count of a length read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_length: Option<i64>,

    /// Tag the response is stored under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tag: Option<Value>,
    /// How `response_tag` is resolved.
    #[serde(default, alias = "responseTagPropertyType")]
    pub response_tag_binding_kind: BindingKind,

    /// Milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Value>,
    /// How `delay` is resolved.
    #[serde(default, alias = "delayPropertyType")]
    pub delay_binding_kind: BindingKind,

    /// `device` or `interface`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_type: Option<String>,

    /// Interface to reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface_id: Option<Value>,
    /// How `interface_id` is resolved.
    #[serde(default, alias = "interfaceIdPropertyType")]
    pub interface_id_binding_kind: BindingKind,

    /// Catalog instruction the command renders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<InstructionReference>,
}

impl Operation {
    fn literal(kind: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            ..Default::default()
        }
    }

    /// A `command` operation against `unit_id`.
    pub fn command(unit_id: &str, command_type: &str) -> Self {
        Self {
            unit_id: Some(Value::from(unit_id)),
            command_type: Some(command_type.to_string()),
            ..Self::literal("command")
        }
    }

    /// Pause for `millis` milliseconds.
    pub fn delay(millis: u64) -> Self {
        Self {
            delay: Some(Value::from(millis)),
            ..Self::literal("delay")
        }
    }

    /// Reset the device `unit_id`.
    pub fn reset_device(unit_id: &str) -> Self {
        Self {
            reset_type: Some("device".to_string()),
            unit_id: Some(Value::from(unit_id)),
            ..Self::literal("reset")
        }
    }

    /// Reset the interface `interface_id`.
    pub fn reset_interface(interface_id: &str) -> Self {
        Self {
            reset_type: Some("interface".to_string()),
            interface_id: Some(Value::from(interface_id)),
            ..Self::literal("reset")
        }
    }

    /// Group execute trigger to `unit_id`.
    pub fn trigger(unit_id: &str) -> Self {
        Self {
            unit_id: Some(Value::from(unit_id)),
            ..Self::literal("trigger")
        }
    }

    /// Set literal write data.
    pub fn with_write_data(mut self, data: &str) -> Self {
        self.write_data = Some(Value::from(data));
        self
    }

    /// Read a response of builder type `data_type` into `response_tag`.
    pub fn with_read(mut self, data_type: &str, response_tag: &str) -> Self {
        self.read_data_type = Some(data_type.to_string());
        self.response_tag = Some(Value::from(response_tag));
        self
    }

    /// Read exactly `length` bytes.
    pub fn with_read_length(mut self, length: i64) -> Self {
        self.use_read_length = Some(true);
        self.read_length = Some(length);
        self
    }

    /// Render catalog instruction `instruction_id` with `arguments`.
    pub fn with_instruction(mut self, instruction_id: &str, arguments: Vec<ParameterArgument>) -> Self {
        self.instruction = Some(InstructionReference {
            instruction_id: instruction_id.to_string(),
            arguments,
        });
        self
    }
}

/// A sequence as stored in a file or handed to the CLI.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceDocument {
    /// Emit every step result in one batch at the end.
    #[serde(default)]
    pub respond_in_bulk: bool,
    /// Steps in execution order.
    #[serde(default)]
    pub operations: Vec<Operation>,
}

impl SequenceDocument {
    /// Load a document from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_field_names_are_accepted() {
        let json = r#"{
            "type": "command",
            "commandType": "query",
            "unitId": "payload.unit",
            "unitIdPropertyType": "msg",
            "writeData": "*IDN?",
            "writeDataPropertyType": "str",
            "readDataType": "string",
            "responseTag": "idn",
            "delayPropertyType": "num"
        }"#;
        let op: Operation = serde_json::from_str(json).unwrap();
        assert_eq!(op.kind.as_deref(), Some("command"));
        assert_eq!(op.unit_id_binding_kind, BindingKind::Msg);
        assert_eq!(op.write_data_binding_kind, BindingKind::Literal);
        assert_eq!(op.delay_binding_kind, BindingKind::Literal);
    }

    #[test]
    fn test_unknown_binding_kind_is_unsupported() {
        let kind: BindingKind = serde_json::from_str("\"jsonata\"").unwrap();
        assert_eq!(kind, BindingKind::Unsupported);
    }

    #[test]
    fn test_unknown_kind_still_deserializes() {
        let op: Operation = serde_json::from_str(r#"{ "type": "pause" }"#).unwrap();
        assert_eq!(op.kind.as_deref(), Some("pause"));
    }

    #[test]
    fn test_document_defaults() {
        let doc: SequenceDocument = serde_json::from_str("{}").unwrap();
        assert!(!doc.respond_in_bulk);
        assert!(doc.operations.is_empty());
    }
}
