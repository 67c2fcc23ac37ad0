//! Procedure actions
//!
//! A procedure is a graph of flow nodes. Sections group action start nodes;
//! starting an action sends its payload down the wires to the sequence nodes
//! that do the work, and a completion node reports back when they finish.

/// Deployed procedure graph.
pub mod graph;
/// Trigger requests, replies and the run payload.
pub mod request;
/// Per-action run state.
pub mod state;

pub use graph::{FlowNode, NodeId, ProcedureGraph};
pub use request::{ActionPayload, TriggerRequest, TriggerResult, TriggerType};
pub use state::{trigger_result, ActionEvent, ActionState, ActionStateMachine, RunHandle};
