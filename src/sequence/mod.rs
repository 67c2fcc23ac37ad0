//! Authored sequences and their compiled plans.
//!
//! - [`Operation`] / [`SequenceDocument`]: permissive, author-facing records
//! - [`BindingContext`]: message/flow/global/env scopes for bindable fields
//! - [`compile`]: validation + resolution into a [`Plan`]
//! - [`Plan`] / [`Step`]: kind-specific steps, plus the downstream wire form

/// Validation and compilation into a plan.
pub mod compiler;
/// Values bindings resolve against.
pub mod context;
/// Authored operations.
pub mod operation;
/// Compiled plans.
pub mod plan;

pub use compiler::compile;
pub use context::BindingContext;
pub use operation::{BindingKind, InstructionReference, Operation, SequenceDocument};
pub use plan::{
    BoundInstruction, CommandKind, CommandStep, Plan, ReadSpec, ResetTarget, ResolvedOperation,
    SequencePayload, Step,
};
