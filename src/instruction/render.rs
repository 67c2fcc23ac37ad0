//! Rendering of instruction templates into command text.

use super::{Instruction, InstructionParameter, ParameterArgument, ParameterKind, ParameterValue};
use std::collections::HashMap;
use thiserror::Error;

/// Why an instruction could not be rendered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    /// A `readResponse` or `variable` parameter names nothing bound.
    #[error("Unresolved {kind} reference '{name}'")]
    UnresolvedReference {
        /// Parameter kind
        kind: ParameterKind,
        /// Tag or variable name
        name: String,
    },

    /// A required parameter has neither argument nor default.
    #[error("Missing argument for required parameter '{0}'")]
    MissingArgument(String),

    /// The argument does not fit the parameter kind.
    #[error("Invalid argument for parameter '{parameter}': {reason}")]
    InvalidArgument {
        /// Parameter prompt or id
        parameter: String,
        /// What is wrong
        reason: String,
    },

    /// A number outside the parameter's bounds or increment.
    #[error("Value {value} for parameter '{parameter}' is out of range")]
    OutOfRange {
        /// Parameter prompt or id
        parameter: String,
        /// Rejected value
        value: f64,
    },

    /// A list value that matches no item.
    #[error("'{value}' is not an item of list parameter '{parameter}'")]
    UnknownListItem {
        /// Parameter prompt or id
        parameter: String,
        /// Rejected value
        value: String,
    },
}

/// Source of values for `readResponse` and `variable` parameters.
pub trait ReferenceLookup {
    /// Last response stored under `tag`.
    fn response(&self, tag: &str) -> Option<String>;
    /// Current value of the variable `name`.
    fn variable(&self, name: &str) -> Option<String>;
}

/// Response-tag and variable table filled in while a sequence runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bindings {
    responses: HashMap<String, String>,
    variables: HashMap<String, String>,
}

impl Bindings {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under response `tag`.
    pub fn set_response(&mut self, tag: impl Into<String>, value: impl Into<String>) {
        self.responses.insert(tag.into(), value.into());
    }

    /// Set variable `name`.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    /// Stored responses by tag.
    pub fn responses(&self) -> &HashMap<String, String> {
        &self.responses
    }

    /// Variables by name.
    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }
}

impl ReferenceLookup for Bindings {
    fn response(&self, tag: &str) -> Option<String> {
        self.responses.get(tag).cloned()
    }

    fn variable(&self, name: &str) -> Option<String> {
        self.variables.get(name).cloned()
    }
}

/// Render `instruction` into the text sent to the device.
///
/// The output is the rendered pre-parameters, the literal command, then the
/// rendered post-parameters. Each parameter contributes
/// `beforeText + value + afterText`. Arguments are matched to parameters by
/// id; a parameter without an argument falls back to its default.
///
/// Rendering has no side effects: the same arguments and lookup table always
/// produce the same text.
pub fn render(
    instruction: &Instruction,
    arguments: &[ParameterArgument],
    lookup: &impl ReferenceLookup,
) -> Result<String, RenderError> {
    let mut output = String::new();
    for parameter in instruction.pre_parameters.iter().flatten() {
        render_parameter(parameter, arguments, lookup, &mut output)?;
    }
    output.push_str(&instruction.command);
    for parameter in instruction.post_parameters.iter().flatten() {
        render_parameter(parameter, arguments, lookup, &mut output)?;
    }
    Ok(output)
}

fn render_parameter(
    parameter: &InstructionParameter,
    arguments: &[ParameterArgument],
    lookup: &impl ReferenceLookup,
    output: &mut String,
) -> Result<(), RenderError> {
    let argument = arguments
        .iter()
        .find(|a| a.parameter_id == parameter.id)
        .map(|a| &a.value)
        .or(parameter.default.as_ref());

    let value = match parameter.kind {
        ParameterKind::ReadResponse => {
            let tag = parameter.read_response_tag.as_deref().unwrap_or_default();
            Some(lookup.response(tag).ok_or_else(|| RenderError::UnresolvedReference {
                kind: ParameterKind::ReadResponse,
                name: tag.to_string(),
            })?)
        }
        ParameterKind::Variable => {
            let name = parameter.variable_name.as_deref().unwrap_or_default();
            Some(lookup.variable(name).ok_or_else(|| RenderError::UnresolvedReference {
                kind: ParameterKind::Variable,
                name: name.to_string(),
            })?)
        }
        _ => match argument {
            Some(value) => Some(render_value(parameter, value)?),
            None if parameter.is_required() => {
                return Err(RenderError::MissingArgument(parameter.id.clone()))
            }
            None => None,
        },
    };

    if let Some(text) = &parameter.before_text {
        output.push_str(text);
    }
    if let Some(value) = value {
        output.push_str(&value);
    }
    if let Some(text) = &parameter.after_text {
        output.push_str(text);
    }
    Ok(())
}

fn render_value(parameter: &InstructionParameter, value: &ParameterValue) -> Result<String, RenderError> {
    let invalid = |reason: &str| RenderError::InvalidArgument {
        parameter: parameter.id.clone(),
        reason: reason.to_string(),
    };

    match parameter.kind {
        ParameterKind::Boolean => {
            let state = as_bool(value).ok_or_else(|| invalid("expected a boolean"))?;
            let literal = if state {
                &parameter.true_value
            } else {
                &parameter.false_value
            };
            literal
                .clone()
                .ok_or_else(|| invalid("parameter has no literal for this state"))
        }
        ParameterKind::Number => {
            let number = as_number(value).ok_or_else(|| invalid("expected a number"))?;
            check_range(parameter, number)?;
            Ok(ParameterValue::Number(number).to_string())
        }
        ParameterKind::List => {
            let wanted = value.to_string();
            parameter
                .list_items
                .iter()
                .flatten()
                .find(|item| item.id == wanted || item.value == wanted || item.text == wanted)
                .map(|item| item.value.clone())
                .ok_or(RenderError::UnknownListItem {
                    parameter: parameter.id.clone(),
                    value: wanted,
                })
        }
        ParameterKind::String | ParameterKind::ReadResponse | ParameterKind::Variable => {
            Ok(value.to_string())
        }
    }
}

fn check_range(parameter: &InstructionParameter, number: f64) -> Result<(), RenderError> {
    let out_of_range = || RenderError::OutOfRange {
        parameter: parameter.id.clone(),
        value: number,
    };

    if parameter.lower_bound().is_some_and(|min| number < min) {
        return Err(out_of_range());
    }
    if parameter.upper_bound().is_some_and(|max| number > max) {
        return Err(out_of_range());
    }
    if let Some(step) = parameter.increment() {
        let base = parameter.lower_bound().unwrap_or(0.0);
        let steps = (number - base) / step;
        if (steps - steps.round()).abs() > 1e-9 {
            return Err(out_of_range());
        }
    }
    Ok(())
}

fn as_bool(value: &ParameterValue) -> Option<bool> {
    match value {
        ParameterValue::Bool(b) => Some(*b),
        ParameterValue::Number(n) => Some(*n != 0.0),
        ParameterValue::Text(t) => match t.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => Some(true),
            "false" | "0" | "off" => Some(false),
            _ => None,
        },
    }
}

fn as_number(value: &ParameterValue) -> Option<f64> {
    match value {
        ParameterValue::Number(n) => Some(*n),
        ParameterValue::Text(t) => t.trim().parse().ok(),
        ParameterValue::Bool(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{InstructionKind, ListItem};

    fn volt_instruction() -> Instruction {
        let mut range = InstructionParameter::new("range", ParameterKind::List, "Range")
            .with_before_text(":RANG ");
        range.list_items = Some(vec![
            ListItem {
                id: "r1".into(),
                text: "1 V".into(),
                value: "1".into(),
            },
            ListItem {
                id: "r10".into(),
                text: "10 V".into(),
                value: "10".into(),
            },
        ]);

        let mut level = InstructionParameter::new("level", ParameterKind::Number, "Level")
            .with_before_text(" ");
        level.use_min = Some(true);
        level.min = Some(0.0);
        level.use_max = Some(true);
        level.max = Some(10.0);
        level.required = Some(true);

        let mut auto = InstructionParameter::new("auto", ParameterKind::Boolean, "Auto")
            .with_before_text(";:AUTO ");
        auto.true_value = Some("ON".into());
        auto.false_value = Some("OFF".into());
        auto.default = Some(ParameterValue::Bool(false));

        Instruction::new("i1", "Set Volts", InstructionKind::Write, "VOLT")
            .with_post_parameter(level)
            .with_post_parameter(range)
            .with_post_parameter(auto)
    }

    #[test]
    fn test_render_concatenates_in_order() {
        let args = vec![
            ParameterArgument::new("level", ParameterValue::Number(5.0)),
            ParameterArgument::new("range", ParameterValue::Text("r10".into())),
        ];
        let text = render(&volt_instruction(), &args, &Bindings::new()).unwrap();
        assert_eq!(text, "VOLT 5:RANG 10;:AUTO OFF");
    }

    #[test]
    fn test_render_is_idempotent() {
        let args = vec![
            ParameterArgument::new("level", ParameterValue::Number(2.5)),
            ParameterArgument::new("range", ParameterValue::Text("1".into())),
            ParameterArgument::new("auto", ParameterValue::Bool(true)),
        ];
        let bindings = Bindings::new();
        let first = render(&volt_instruction(), &args, &bindings).unwrap();
        let second = render(&volt_instruction(), &args, &bindings).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "VOLT 2.5:RANG 1;:AUTO ON");
    }

    #[test]
    fn test_render_rejects_out_of_range() {
        let args = vec![
            ParameterArgument::new("level", ParameterValue::Number(11.0)),
            ParameterArgument::new("range", ParameterValue::Text("r1".into())),
        ];
        let err = render(&volt_instruction(), &args, &Bindings::new()).unwrap_err();
        assert!(matches!(err, RenderError::OutOfRange { value, .. } if value == 11.0));
    }

    #[test]
    fn test_render_missing_required_argument() {
        let args = vec![ParameterArgument::new("range", ParameterValue::Text("r1".into()))];
        let err = render(&volt_instruction(), &args, &Bindings::new()).unwrap_err();
        assert_eq!(err, RenderError::MissingArgument("level".into()));
    }

    #[test]
    fn test_render_unknown_list_item() {
        let args = vec![
            ParameterArgument::new("level", ParameterValue::Number(1.0)),
            ParameterArgument::new("range", ParameterValue::Text("100".into())),
        ];
        let err = render(&volt_instruction(), &args, &Bindings::new()).unwrap_err();
        assert!(matches!(err, RenderError::UnknownListItem { .. }));
    }

    #[test]
    fn test_optional_missing_argument_renders_surrounding_text() {
        let parameter = InstructionParameter::new("ch", ParameterKind::String, "Channel")
            .with_before_text(" (@")
            .with_after_text(")");
        let instruction =
            Instruction::new("i2", "Route", InstructionKind::Write, "ROUT:CLOS").with_post_parameter(parameter);
        let text = render(&instruction, &[], &Bindings::new()).unwrap();
        assert_eq!(text, "ROUT:CLOS (@)");
    }

    #[test]
    fn test_read_response_and_variable_lookup() {
        let mut tag = InstructionParameter::new("t", ParameterKind::ReadResponse, "Range")
            .with_before_text(" ");
        tag.read_response_tag = Some("range".into());
        let mut var = InstructionParameter::new("v", ParameterKind::Variable, "Channel")
            .with_before_text(",");
        var.variable_name = Some("channel".into());
        let instruction = Instruction::new("i3", "Apply", InstructionKind::Write, "CONF:VOLT")
            .with_post_parameter(tag)
            .with_post_parameter(var);

        let mut bindings = Bindings::new();
        let err = render(&instruction, &[], &bindings).unwrap_err();
        assert_eq!(
            err,
            RenderError::UnresolvedReference {
                kind: ParameterKind::ReadResponse,
                name: "range".into()
            }
        );

        bindings.set_response("range", "100");
        bindings.set_variable("channel", "3");
        assert_eq!(render(&instruction, &[], &bindings).unwrap(), "CONF:VOLT 100,3");
    }

    #[test]
    fn test_increment_enforced() {
        let mut step = InstructionParameter::new("s", ParameterKind::Number, "Step")
            .with_before_text(" ");
        step.use_min = Some(true);
        step.min = Some(1.0);
        step.use_min_max_increment = Some(true);
        step.min_max_increment = Some(0.5);
        let instruction =
            Instruction::new("i4", "Step", InstructionKind::Write, "STEP").with_post_parameter(step);

        let ok = [ParameterArgument::new("s", ParameterValue::Number(2.5))];
        assert_eq!(render(&instruction, &ok, &Bindings::new()).unwrap(), "STEP 2.5");

        let bad = [ParameterArgument::new("s", ParameterValue::Number(2.2))];
        assert!(render(&instruction, &bad, &Bindings::new()).is_err());
    }
}
