//! Instruction templates.
//!
//! An [`Instruction`] is the reusable description of one vendor command: the
//! literal command text, typed pre/post parameters that are rendered around
//! it, the data type expected back from the device and timing hints. Templates
//! carry no runtime values; those are supplied as [`ParameterArgument`]s and
//! through a [`ReferenceLookup`] when the instruction is rendered.
//!
//! The serde shape matches the Library JSON document exchanged with the
//! driver builder (`_id`, `type`, camelCase field names).

mod render;

pub use render::{render, Bindings, ReferenceLookup, RenderError};

use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What an instruction does with the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionKind {
    /// Read a response without writing.
    Read,
    /// Write without reading.
    Write,
    /// Write, then read the response.
    Query,
    /// Assigns the command text to a driver variable without touching the transport.
    #[serde(rename = "setVariable")]
    SetVariable,
}

impl InstructionKind {
    /// Whether the instruction produces a response from the device.
    pub fn reads(self) -> bool {
        matches!(self, InstructionKind::Read | InstructionKind::Query)
    }

    /// Whether the instruction sends command text to the device.
    pub fn writes(self) -> bool {
        matches!(self, InstructionKind::Write | InstructionKind::Query)
    }
}

/// Expected data type of a read or query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// `true`/`false`, `1`/`0`, `on`/`off`.
    Boolean,
    /// Decimal or scientific notation.
    Number,
    /// Text as read.
    String,
    /// Raw bytes.
    Binary,
}

impl DataType {
    /// Convert raw response bytes into a typed value.
    ///
    /// Text responses are trimmed of surrounding whitespace and terminator
    /// characters before conversion. Anything that does not parse as the
    /// requested type is a [`TransportError::MalformedResponse`], which the
    /// executor counts as a failed read attempt.
    pub fn convert(self, raw: &[u8]) -> Result<ResponseValue, TransportError> {
        if self == DataType::Binary {
            return Ok(ResponseValue::Binary(raw.to_vec()));
        }

        let text = String::from_utf8_lossy(raw);
        let text = text.trim();
        match self {
            DataType::String => Ok(ResponseValue::Text(text.to_string())),
            DataType::Number => text
                .parse::<f64>()
                .map(ResponseValue::Number)
                .map_err(|_| TransportError::MalformedResponse(format!("'{}' is not a number", text))),
            DataType::Boolean => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "on" => Ok(ResponseValue::Boolean(true)),
                "0" | "false" | "off" => Ok(ResponseValue::Boolean(false)),
                _ => Err(TransportError::MalformedResponse(format!(
                    "'{}' is not a boolean",
                    text
                ))),
            },
            DataType::Binary => Ok(ResponseValue::Binary(raw.to_vec())),
        }
    }
}

/// A converted device response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseValue {
    /// Parsed boolean.
    Boolean(bool),
    /// Parsed number.
    Number(f64),
    /// Trimmed text.
    Text(String),
    /// Raw bytes.
    Binary(Vec<u8>),
}

impl ResponseValue {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ResponseValue::Number(n) => Some(*n),
            ResponseValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            ResponseValue::Text(t) => t.trim().parse().ok(),
            ResponseValue::Binary(_) => None,
        }
    }
}

impl fmt::Display for ResponseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseValue::Boolean(b) => write!(f, "{}", b),
            ResponseValue::Number(n) => write!(f, "{}", n),
            ResponseValue::Text(t) => f.write_str(t),
            ResponseValue::Binary(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

/// Kind of an instruction parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParameterKind {
    /// `trueValue` or `falseValue` text.
    Boolean,
    /// Number, optionally range checked.
    Number,
    /// Free text.
    String,
    /// One of `listItems`.
    List,
    /// Value is the last response stored under `readResponseTag`.
    ReadResponse,
    /// Value is the driver variable named by `variableName`.
    Variable,
}

impl fmt::Display for ParameterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParameterKind::Boolean => "boolean",
            ParameterKind::Number => "number",
            ParameterKind::String => "string",
            ParameterKind::List => "list",
            ParameterKind::ReadResponse => "readResponse",
            ParameterKind::Variable => "variable",
        };
        f.write_str(name)
    }
}

/// One selectable entry of a `list` parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListItem {
    /// Library id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Text shown to the author.
    pub text: String,
    /// Text sent to the device.
    pub value: String,
}

/// A bound or default parameter value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean.
    Bool(bool),
    /// Number.
    Number(f64),
    /// Text.
    Text(String),
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{}", b),
            // f64 Display already drops the trailing ".0" of integral values
            ParameterValue::Number(n) => write!(f, "{}", n),
            ParameterValue::Text(t) => f.write_str(t),
        }
    }
}

/// Template for one positional parameter of an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionParameter {
    /// Library id.
    #[serde(rename = "_id")]
    pub id: String,
    /// How the value is supplied and formatted.
    #[serde(rename = "type")]
    pub kind: ParameterKind,
    /// Label shown to the author.
    #[serde(default)]
    pub prompt: String,
    /// Text emitted before the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_text: Option<String>,
    /// Text emitted after the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_text: Option<String>,
    /// An argument or default must be supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    /// Choices of a `list` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list_items: Option<Vec<ListItem>>,
    /// Text for `true` of a `boolean` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub true_value: Option<String>,
    /// Text for `false` of a `boolean` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub false_value: Option<String>,
    /// Enforce `min`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_min: Option<bool>,
    /// Enforce `max`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_max: Option<bool>,
    /// Smallest accepted number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Largest accepted number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Enforce `minMaxIncrement`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_min_max_increment: Option<bool>,
    /// Step between accepted numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_max_increment: Option<f64>,
    /// Used when no argument is supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParameterValue>,
    /// Tag read by a `readResponse` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_response_tag: Option<String>,
    /// Variable read by a `variable` parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_name: Option<String>,
}

impl InstructionParameter {
    /// Bare parameter of the given kind; the remaining fields are unset.
    pub fn new(id: impl Into<String>, kind: ParameterKind, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            prompt: prompt.into(),
            before_text: None,
            after_text: None,
            required: None,
            list_items: None,
            true_value: None,
            false_value: None,
            use_min: None,
            use_max: None,
            min: None,
            max: None,
            use_min_max_increment: None,
            min_max_increment: None,
            default: None,
            read_response_tag: None,
            variable_name: None,
        }
    }

    /// Set the text emitted before the value.
    pub fn with_before_text(mut self, text: impl Into<String>) -> Self {
        self.before_text = Some(text.into());
        self
    }

    /// Set the text emitted after the value.
    pub fn with_after_text(mut self, text: impl Into<String>) -> Self {
        self.after_text = Some(text.into());
        self
    }

    /// Whether the parameter must be supplied.
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(false)
    }

    /// Lower bound enforced on number arguments, if any.
    pub fn lower_bound(&self) -> Option<f64> {
        self.use_min.unwrap_or(false).then_some(self.min).flatten()
    }

    /// Upper bound enforced on number arguments, if any.
    pub fn upper_bound(&self) -> Option<f64> {
        self.use_max.unwrap_or(false).then_some(self.max).flatten()
    }

    /// Step enforced between the bounds, if any.
    pub fn increment(&self) -> Option<f64> {
        self.use_min_max_increment
            .unwrap_or(false)
            .then_some(self.min_max_increment)
            .flatten()
            .filter(|step| *step > 0.0)
    }

    fn validate(&self, problems: &mut Vec<String>) {
        let label = if self.prompt.is_empty() { &self.id } else { &self.prompt };
        match self.kind {
            ParameterKind::List => {
                if self.list_items.as_ref().map_or(true, |items| items.is_empty()) {
                    problems.push(format!("List parameter '{}' has no items", label));
                }
            }
            ParameterKind::Boolean => {
                if self.true_value.is_none() || self.false_value.is_none() {
                    problems.push(format!(
                        "Boolean parameter '{}' is missing its true/false values",
                        label
                    ));
                }
            }
            ParameterKind::ReadResponse => {
                if is_blank(&self.read_response_tag) {
                    problems.push(format!(
                        "Read response parameter '{}' is missing its response tag",
                        label
                    ));
                }
            }
            ParameterKind::Variable => {
                if is_blank(&self.variable_name) {
                    problems.push(format!(
                        "Variable parameter '{}' is missing its variable name",
                        label
                    ));
                }
            }
            ParameterKind::Number => {
                if let (Some(min), Some(max)) = (self.lower_bound(), self.upper_bound()) {
                    if min > max {
                        problems.push(format!(
                            "Number parameter '{}' has minimum {} greater than maximum {}",
                            label, min, max
                        ));
                    }
                }
            }
            ParameterKind::String => {}
        }
    }
}

/// Runtime value supplied for one parameter, matched by parameter id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterArgument {
    /// Id of the parameter this value fills.
    pub parameter_id: String,
    /// Supplied value.
    pub value: ParameterValue,
}

impl ParameterArgument {
    /// Argument for `parameter_id`.
    pub fn new(parameter_id: impl Into<String>, value: ParameterValue) -> Self {
        Self {
            parameter_id: parameter_id.into(),
            value,
        }
    }
}

/// A reusable, parameterized template for one device command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    /// Library id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Position within its instruction set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<u32>,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// What the instruction does with the device.
    #[serde(rename = "type")]
    pub kind: InstructionKind,
    /// Type of the response of a read or query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_data_type: Option<DataType>,
    /// Failed reads tolerated before the read is reported as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_attempts: Option<u32>,
    /// Default response tag of a read or query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_name: Option<String>,
    /// Milliseconds to wait before the instruction runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_before: Option<u64>,
    /// Milliseconds to wait after the instruction ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_after: Option<u64>,
    /// Link to the instrument manual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub help_uri: Option<String>,
    /// Target of a `setVariable` instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable_name: Option<String>,
    /// Command text the parameters attach to.
    #[serde(default)]
    pub command: String,
    /// Parameters rendered before `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_parameters: Option<Vec<InstructionParameter>>,
    /// Parameters rendered after `command`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_parameters: Option<Vec<InstructionParameter>>,
}

impl Instruction {
    /// Instruction with only the required fields set.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        kind: InstructionKind,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            order: None,
            name: name.into(),
            description: None,
            kind,
            response_data_type: None,
            read_attempts: None,
            response_name: None,
            delay_before: None,
            delay_after: None,
            help_uri: None,
            variable_name: None,
            command: command.into(),
            pre_parameters: None,
            post_parameters: None,
        }
    }

    /// Set the response data type.
    pub fn with_response_type(mut self, data_type: DataType) -> Self {
        self.response_data_type = Some(data_type);
        self
    }

    /// Append a parameter rendered before the command.
    pub fn with_pre_parameter(mut self, parameter: InstructionParameter) -> Self {
        self.pre_parameters.get_or_insert_with(Vec::new).push(parameter);
        self
    }

    /// Append a parameter rendered after the command.
    pub fn with_post_parameter(mut self, parameter: InstructionParameter) -> Self {
        self.post_parameters.get_or_insert_with(Vec::new).push(parameter);
        self
    }

    /// Pre-parameters followed by post-parameters.
    pub fn parameters(&self) -> impl Iterator<Item = &InstructionParameter> {
        self.pre_parameters
            .iter()
            .flatten()
            .chain(self.post_parameters.iter().flatten())
    }

    /// Response tags this instruction reads through `readResponse` parameters.
    pub fn referenced_tags(&self) -> impl Iterator<Item = &str> {
        self.parameters()
            .filter(|p| p.kind == ParameterKind::ReadResponse)
            .filter_map(|p| p.read_response_tag.as_deref())
    }

    /// Check the catalog-level invariants of this template.
    ///
    /// Returns every problem found; an empty list means the template is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.kind.reads() && self.response_data_type.is_none() {
            problems.push(format!(
                "{:?} instruction '{}' missing response data type",
                self.kind, self.name
            ));
        }

        let has_parameters = self.parameters().next().is_some();
        if self.kind.writes() && self.command.trim().is_empty() && !has_parameters {
            problems.push(format!(
                "{:?} instruction '{}' has no command text or parameters",
                self.kind, self.name
            ));
        }

        if self.kind == InstructionKind::SetVariable && is_blank(&self.variable_name) {
            problems.push(format!(
                "setVariable instruction '{}' missing variable name",
                self.name
            ));
        }

        if self.read_attempts == Some(0) {
            problems.push(format!(
                "Instruction '{}' must allow at least one read attempt",
                self.name
            ));
        }

        for parameter in self.parameters() {
            parameter.validate(&mut problems);
        }

        problems
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruction_json_shape() {
        let json = r#"{
            "_id": "4caa1e38-6641-4781-b63b-e303b24577c6",
            "name": "Identification Query",
            "type": "Query",
            "command": "*IDN?",
            "responseDataType": "String",
            "postParameters": [
                { "_id": "p1", "type": "readResponse", "prompt": "Tag", "readResponseTag": "range" }
            ]
        }"#;
        let instruction: Instruction = serde_json::from_str(json).unwrap();
        assert_eq!(instruction.kind, InstructionKind::Query);
        assert_eq!(instruction.response_data_type, Some(DataType::String));
        assert_eq!(instruction.referenced_tags().collect::<Vec<_>>(), vec!["range"]);

        let value = serde_json::to_value(&instruction).unwrap();
        assert_eq!(value["_id"], "4caa1e38-6641-4781-b63b-e303b24577c6");
        assert_eq!(value["type"], "Query");
        assert!(value.get("preParameters").is_none());
    }

    #[test]
    fn test_set_variable_kind_name() {
        let kind: InstructionKind = serde_json::from_str("\"setVariable\"").unwrap();
        assert_eq!(kind, InstructionKind::SetVariable);
        assert!(!kind.reads());
        assert!(!kind.writes());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let instruction = Instruction::new("i1", "Broken", InstructionKind::Query, "")
            .with_post_parameter(InstructionParameter::new("p1", ParameterKind::List, "Range"))
            .with_post_parameter(InstructionParameter::new("p2", ParameterKind::Boolean, "Auto"));
        let problems = instruction.validate();
        assert_eq!(problems.len(), 3, "{:?}", problems);
        assert!(problems[0].contains("missing response data type"));
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut parameter = InstructionParameter::new("p1", ParameterKind::Number, "Volts");
        parameter.use_min = Some(true);
        parameter.use_max = Some(true);
        parameter.min = Some(10.0);
        parameter.max = Some(1.0);
        let instruction =
            Instruction::new("i1", "Set", InstructionKind::Write, "VOLT").with_post_parameter(parameter);
        assert_eq!(instruction.validate().len(), 1);
    }

    #[test]
    fn test_valid_write_has_no_problems() {
        let instruction = Instruction::new("i1", "Reset", InstructionKind::Write, "*RST");
        assert!(instruction.validate().is_empty());
    }

    #[test]
    fn test_convert_boolean_and_number() {
        assert_eq!(
            DataType::Boolean.convert(b"ON\r\n").unwrap(),
            ResponseValue::Boolean(true)
        );
        assert_eq!(DataType::Boolean.convert(b"0").unwrap(), ResponseValue::Boolean(false));
        assert_eq!(
            DataType::Number.convert(b"+1.2345E+01\n").unwrap(),
            ResponseValue::Number(12.345)
        );
        assert!(matches!(
            DataType::Number.convert(b"overload"),
            Err(TransportError::MalformedResponse(_))
        ));
        assert!(DataType::Boolean.convert(b"maybe").is_err());
    }

    #[test]
    fn test_convert_binary_keeps_bytes() {
        let raw = [0x00, 0xff, 0x0a];
        assert_eq!(
            DataType::Binary.convert(&raw).unwrap(),
            ResponseValue::Binary(raw.to_vec())
        );
    }

    #[test]
    fn test_parameter_value_display() {
        assert_eq!(ParameterValue::Number(5.0).to_string(), "5");
        assert_eq!(ParameterValue::Number(0.25).to_string(), "0.25");
        assert_eq!(ParameterValue::Bool(true).to_string(), "true");
    }
}
