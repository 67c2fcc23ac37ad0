//! Instrument command sequencing for calibration procedures.
//!
//! A procedure is a graph of sections and actions. Starting an action runs
//! the command sequences wired below it against bench instruments:
//!
//! ```text
//! TriggerRequest --> action::ActionStateMachine --start--> runner::ProcedureRunner
//!                                                             |
//!                     catalog::DriverCatalog --> sequence::compile --> Plan
//!                                                             |
//!                     transport::InterfaceManager <-- executor::SequenceExecutor
//!                                                             |
//!                                      StepResult / results::MeasurementResult
//! ```
//!
//! - [`instruction`]: parameterised command templates and their renderer
//! - [`catalog`]: drivers, instruction sets and the library document
//! - [`sequence`]: authored operations, validation and compiled plans
//! - [`transport`]: GPIB, serial, TCP and emulated links
//! - [`executor`]: ordered, cancellable plan execution
//! - [`action`]: procedure graph and action run state

/// Action state machine, procedure graph and trigger requests.
pub mod action;
/// Drivers, instruction sets and the library document.
pub mod catalog;
/// Layered configuration.
pub mod config;
/// Crate error type.
pub mod error;
/// Plan execution against bench interfaces.
pub mod executor;
/// Instruction templates and their renderer.
pub mod instruction;
/// Tracing subscriber setup.
pub mod logging;
/// Measurement results derived from step responses.
pub mod results;
/// End to end action runs.
pub mod runner;
/// Authored sequences, validation and compiled plans.
pub mod sequence;
/// GPIB, serial, TCP and emulated links.
pub mod transport;
