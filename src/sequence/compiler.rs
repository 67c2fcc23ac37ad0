//! Sequence compiler.
//!
//! Checks every authored operation, accumulating all problems, and produces a
//! [`Plan`] of kind-specific steps only when there are none. Bindable fields
//! are resolved against a [`BindingContext`] first; a reference that cannot be
//! followed counts as an absent value.

use super::context::BindingContext;
use super::operation::{Operation, SequenceDocument};
use super::plan::{
    parse_read_data_type, BoundInstruction, CommandKind, CommandStep, Plan, ReadSpec, ResetTarget,
    Step,
};
use crate::catalog::DriverCatalog;
use crate::error::ValidationError;
use crate::instruction::InstructionKind;
use std::collections::HashSet;
use std::time::Duration;
use tracing::debug;

/// Compile authored operations into a plan.
///
/// Returns every validation error, in operation order, when any operation is
/// invalid. Nothing from an invalid sequence is ever executed.
pub fn compile(
    operations: &[Operation],
    catalog: &DriverCatalog,
    ctx: &BindingContext,
) -> Result<Plan, Vec<ValidationError>> {
    let mut compiler = Compiler {
        catalog,
        ctx,
        errors: Vec::new(),
        produced_tags: HashSet::new(),
    };

    let steps: Vec<Step> = operations
        .iter()
        .enumerate()
        .filter_map(|(index, op)| compiler.operation(index, op))
        .collect();

    if compiler.errors.is_empty() {
        debug!(steps = steps.len(), "Sequence compiled");
        Ok(Plan {
            steps,
            respond_in_bulk: false,
        })
    } else {
        debug!(errors = compiler.errors.len(), "Sequence rejected");
        Err(compiler.errors)
    }
}

impl SequenceDocument {
    /// Validate and compile the document.
    pub fn compile(
        &self,
        catalog: &DriverCatalog,
        ctx: &BindingContext,
    ) -> Result<Plan, Vec<ValidationError>> {
        compile(&self.operations, catalog, ctx).map(|plan| plan.with_respond_in_bulk(self.respond_in_bulk))
    }
}

struct Compiler<'a> {
    catalog: &'a DriverCatalog,
    ctx: &'a BindingContext,
    errors: Vec<ValidationError>,
    /// Response tags of earlier read/query steps
    produced_tags: HashSet<String>,
}

impl Compiler<'_> {
    fn error(&mut self, index: usize, message: impl Into<String>) {
        self.errors.push(ValidationError::new(index, message));
    }

    fn operation(&mut self, index: usize, op: &Operation) -> Option<Step> {
        let before = self.errors.len();
        let step = match op.kind.as_deref() {
            Some("command") => self.command(index, op),
            Some("delay") => self.delay(index, op),
            Some("reset") => self.reset(index, op),
            Some("trigger") => self.trigger(index, op),
            _ => {
                self.error(index, "Invalid operation type");
                None
            }
        };
        // Only steps whose operation raised no error make it into the plan
        step.filter(|_| self.errors.len() == before)
    }

    fn command(&mut self, index: usize, op: &Operation) -> Option<Step> {
        let bound = match &op.instruction {
            Some(reference) => match self.catalog.instruction(&reference.instruction_id) {
                Some(instruction) => Some(BoundInstruction {
                    instruction: instruction.clone(),
                    arguments: reference.arguments.clone(),
                }),
                None => {
                    self.error(
                        index,
                        format!(
                            "Command references unknown instruction '{}'",
                            reference.instruction_id
                        ),
                    );
                    return None;
                }
            },
            None => None,
        };

        if let Some(bound) = &bound {
            self.check_tag_order(index, bound);
            if bound.instruction.kind == InstructionKind::SetVariable {
                return self.set_variable(index, bound.clone());
            }
        }

        let unit_id = self.ctx.resolve_text(op.unit_id_binding_kind, op.unit_id.as_ref());
        if unit_id.is_none() {
            self.error(index, "Command missing unit Id");
        }

        let kind = match op.command_type.as_deref().filter(|t| !t.is_empty()) {
            Some(text) => CommandKind::parse(text).or_else(|| {
                self.error(index, "Invalid command type");
                None
            }),
            None => match bound.as_ref().map(|b| b.instruction.kind) {
                Some(InstructionKind::Read) => Some(CommandKind::Read),
                Some(InstructionKind::Write) => Some(CommandKind::Write),
                Some(InstructionKind::Query) => Some(CommandKind::Query),
                _ => {
                    self.error(index, "Command missing command type");
                    None
                }
            },
        };
        let kind = kind?;

        let read = if kind.reads() {
            self.read_spec(index, op, bound.as_ref())
        } else {
            None
        };

        let write_data = if kind.writes() {
            let data = self
                .ctx
                .resolve_text(op.write_data_binding_kind, op.write_data.as_ref());
            if data.is_none() && bound.is_none() {
                self.error(index, "Write or Query command missing write data");
            }
            data
        } else {
            None
        };

        let instruction = bound.as_ref().map(|b| &b.instruction);
        let millis = |value: Option<u64>| Duration::from_millis(value.unwrap_or(0));
        Some(Step::Command(CommandStep {
            unit_id: unit_id?,
            kind,
            write_data,
            read,
            read_attempts: instruction.and_then(|i| i.read_attempts),
            delay_before: millis(instruction.and_then(|i| i.delay_before)),
            delay_after: millis(instruction.and_then(|i| i.delay_after)),
            instruction: bound,
        }))
    }

    fn read_spec(
        &mut self,
        index: usize,
        op: &Operation,
        bound: Option<&BoundInstruction>,
    ) -> Option<ReadSpec> {
        let data_type = match op.read_data_type.as_deref().filter(|t| !t.is_empty()) {
            Some(text) => parse_read_data_type(text).or_else(|| {
                self.error(
                    index,
                    format!("Read or Query command has unknown response type '{}'", text),
                );
                None
            }),
            None => match bound.and_then(|b| b.instruction.response_data_type) {
                Some(data_type) => Some(data_type),
                None => {
                    self.error(index, "Read or Query command missing response type");
                    None
                }
            },
        };

        let length = if op.use_read_length.unwrap_or(false) {
            match op.read_length.filter(|len| *len > 0) {
                Some(len) => Some(len as usize),
                None => {
                    self.error(
                        index,
                        "Read or Query command using length, but requested length is less than or equal to zero",
                    );
                    None
                }
            }
        } else {
            None
        };

        let response_tag = self
            .ctx
            .resolve_text(op.response_tag_binding_kind, op.response_tag.as_ref());
        match &response_tag {
            Some(tag) => {
                self.produced_tags.insert(tag.clone());
            }
            None => self.error(index, "Read or Query command missing response tag"),
        }

        Some(ReadSpec {
            data_type: data_type?,
            length,
            response_tag: response_tag?,
        })
    }

    fn set_variable(&mut self, index: usize, bound: BoundInstruction) -> Option<Step> {
        let variable = bound
            .instruction
            .variable_name
            .clone()
            .filter(|name| !name.trim().is_empty());
        match variable {
            Some(variable) => Some(Step::SetVariable {
                variable,
                instruction: bound,
            }),
            None => {
                self.error(
                    index,
                    format!(
                        "setVariable instruction '{}' missing variable name",
                        bound.instruction.name
                    ),
                );
                None
            }
        }
    }

    /// A referenced response must come from an earlier step.
    fn check_tag_order(&mut self, index: usize, bound: &BoundInstruction) {
        let unresolved: Vec<String> = bound
            .instruction
            .referenced_tags()
            .filter(|tag| !self.produced_tags.contains(*tag))
            .map(str::to_string)
            .collect();
        for tag in unresolved {
            self.error(
                index,
                format!(
                    "Instruction '{}' reads response tag '{}' before any earlier step produces it",
                    bound.instruction.name, tag
                ),
            );
        }
    }

    fn delay(&mut self, index: usize, op: &Operation) -> Option<Step> {
        match self
            .ctx
            .resolve_number(op.delay_binding_kind, op.delay.as_ref())
            .filter(|ms| *ms > 0.0 && ms.is_finite())
        {
            Some(ms) => Some(Step::Delay(Duration::from_nanos((ms * 1e6).round() as u64))),
            None => {
                self.error(index, "Delay is less than or equal to zero");
                None
            }
        }
    }

    fn reset(&mut self, index: usize, op: &Operation) -> Option<Step> {
        match op.reset_type.as_deref() {
            None | Some("") => {
                self.error(index, "Reset missing type");
                None
            }
            Some("device") => {
                match self.ctx.resolve_text(op.unit_id_binding_kind, op.unit_id.as_ref()) {
                    Some(unit_id) => Some(Step::Reset(ResetTarget::Device { unit_id })),
                    None => {
                        self.error(index, "Reset missing unit Id");
                        None
                    }
                }
            }
            Some("interface") => match self
                .ctx
                .resolve_text(op.interface_id_binding_kind, op.interface_id.as_ref())
            {
                Some(interface_id) => Some(Step::Reset(ResetTarget::Interface { interface_id })),
                None => {
                    self.error(index, "Reset missing interface Id");
                    None
                }
            },
            Some(_) => {
                self.error(index, "Invalid reset type");
                None
            }
        }
    }

    fn trigger(&mut self, index: usize, op: &Operation) -> Option<Step> {
        match self.ctx.resolve_text(op.unit_id_binding_kind, op.unit_id.as_ref()) {
            Some(unit_id) => Some(Step::Trigger { unit_id }),
            None => {
                self.error(index, "Trigger missing unit Id");
                None
            }
        }
    }
}
