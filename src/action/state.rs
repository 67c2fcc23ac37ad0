//! Action run state machine
//!
//! Every action start node in a [`ProcedureGraph`] owns one slot:
//!
//! ```text
//! Idle --start--> Running --stop--> Stopped
//!                    |
//!                    +--completed--> Completed
//!
//! any --reset--> Idle
//! ```
//!
//! Each slot is guarded by one mutex. A transition holds it from the check
//! until the new state and run are stored, so two concurrent starts produce
//! exactly one run and a stop never misses a run that is being granted.
//! Transitions are published on a broadcast channel as [`ActionEvent`]s.

use super::graph::{NodeId, ProcedureGraph, ACTION_START_NODE_TYPE};
use super::request::{
    ActionPayload, TriggerRequest, TriggerResult, TriggerType, ERROR_ACTION_NOT_FOUND,
    ERROR_ALREADY_RUNNING,
};
use crate::error::{AppResult, CalError};
use crate::executor::CancelSignal;
use crate::transport::InterfaceManager;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// Where an action is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    /// Never started.
    Idle,
    /// A run is active.
    #[serde(rename = "started")]
    Running,
    /// The last run finished.
    Completed,
    /// The last run was stopped or reset.
    Stopped,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::Running => "started",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        };
        f.write_str(text)
    }
}

/// Published on every transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ActionEvent {
    /// An action moved to `state`.
    #[serde(rename_all = "camelCase")]
    StateChanged {
        /// Action start node id
        node_id: String,
        /// Owning section short name
        section: Option<String>,
        /// Action name
        action: String,
        /// New state
        state: ActionState,
        /// Session of the run, if any
        session_id: Option<String>,
        /// Run id, if any
        run_id: Option<String>,
    },
    /// A downstream node was told to clear its status for this run.
    #[serde(rename_all = "camelCase")]
    NodeReset {
        /// Node to clear
        node_id: String,
        /// Run being reset
        run_id: Option<String>,
    },
}

/// A run that `start` granted. Dropping it does not stop the run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    /// Action start node of the run.
    pub node: NodeId,
    /// Payload sent downstream.
    pub payload: ActionPayload,
    /// Fires when the run is stopped or reset.
    pub cancel: CancelSignal,
}

#[derive(Default)]
struct ActionSlot {
    run: Mutex<SlotState>,
}

/// The node is running exactly when `active` holds a run.
#[derive(Default)]
struct SlotState {
    state: Option<ActionState>,
    active: Option<RunHandle>,
    /// Run id of the latest run, used to scope downstream resets
    last_run: Option<String>,
}

/// Owns the run state of every action node in one procedure.
pub struct ActionStateMachine {
    graph: Arc<ProcedureGraph>,
    interfaces: Arc<InterfaceManager>,
    slots: HashMap<NodeId, ActionSlot>,
    events: broadcast::Sender<ActionEvent>,
}

impl ActionStateMachine {
    /// State machine over every action start node in `graph`.
    pub fn new(graph: Arc<ProcedureGraph>, interfaces: Arc<InterfaceManager>, capacity: usize) -> Self {
        let slots = graph
            .nodes_of_kind(ACTION_START_NODE_TYPE)
            .map(|node| (node, ActionSlot::default()))
            .collect();
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            graph,
            interfaces,
            slots,
            events,
        }
    }

    /// Procedure the machine runs.
    pub fn graph(&self) -> &Arc<ProcedureGraph> {
        &self.graph
    }

    /// Interfaces enabled on start and disabled on halt.
    pub fn interfaces(&self) -> &Arc<InterfaceManager> {
        &self.interfaces
    }

    /// Subscribe to state events.
    pub fn subscribe(&self) -> broadcast::Receiver<ActionEvent> {
        self.events.subscribe()
    }

    /// Action node for a section short name and action name, ignoring case.
    pub fn find(&self, section: &str, action: &str) -> AppResult<NodeId> {
        self.graph.find_action(section, action)
    }

    /// Current state of `node`.
    pub fn state(&self, node: NodeId) -> ActionState {
        self.slots
            .get(&node)
            .and_then(|slot| slot.run.lock().state)
            .unwrap_or(ActionState::Idle)
    }

    /// Whether `node` has an active run.
    pub fn is_running(&self, node: NodeId) -> bool {
        self.slots
            .get(&node)
            .is_some_and(|slot| slot.run.lock().active.is_some())
    }

    fn slot(&self, node: NodeId) -> AppResult<&ActionSlot> {
        self.slots.get(&node).ok_or_else(|| {
            CalError::GraphLookupFailure(format!("node {} is not an action start node", node))
        })
    }

    fn section_name(&self, node: NodeId) -> AppResult<String> {
        self.graph
            .section_of(node)
            .and_then(|section| self.graph.node(section).short_name.clone())
            .ok_or_else(|| CalError::MissingSection(self.graph.node(node).name.clone()))
    }

    /// Claim the node and begin a run.
    ///
    /// Connected nodes are reset and every interface is enabled before the
    /// run is published. A missing `run_id` gets a fresh UUID.
    pub fn start(
        &self,
        node: NodeId,
        session_id: Option<&str>,
        run_id: Option<&str>,
    ) -> AppResult<RunHandle> {
        let slot = self.slot(node)?;
        let section = self.section_name(node)?;
        let action = self.graph.node(node).name.clone();

        let mut run = slot.run.lock();
        if run.active.is_some() {
            return Err(CalError::AlreadyRunning(action));
        }

        let run_id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.reset_connected(node, Some(&run_id));
        self.interfaces.enable_all();

        let handle = RunHandle {
            node,
            payload: ActionPayload {
                session_id: session_id.unwrap_or_default().to_string(),
                run_id: run_id.clone(),
                section,
                action,
            },
            cancel: CancelSignal::new(),
        };
        run.active = Some(handle.clone());
        run.last_run = Some(run_id);
        run.state = Some(ActionState::Running);

        info!(
            section = %handle.payload.section,
            action = %handle.payload.action,
            run_id = %handle.payload.run_id,
            "Action started"
        );
        self.publish_state(node, ActionState::Running, Some(&handle.payload));
        drop(run);
        Ok(handle)
    }

    /// Abort the node's run, disable interfaces and reset downstream nodes.
    pub async fn stop(&self, node: NodeId) -> AppResult<()> {
        self.halt(node, ActionState::Stopped).await
    }

    /// Return the node to `Idle` and propagate the reset downstream.
    ///
    /// Does not require a run. A run still in progress is cancelled.
    pub fn reset(&self, node: NodeId) -> AppResult<()> {
        let slot = self.slot(node)?;
        let run_id = {
            let mut run = slot.run.lock();
            if let Some(active) = run.active.take() {
                active.cancel.cancel();
            }
            run.state = Some(ActionState::Idle);
            run.last_run.clone()
        };
        self.reset_connected(node, run_id.as_deref());
        debug!(action = %self.graph.node(node).name, "Action reset");
        self.publish_state(node, ActionState::Idle, None);
        Ok(())
    }

    /// Completion reported by a downstream completion node.
    ///
    /// Matches `section` and `action` against running nodes; the match is
    /// stopped and published as `completed`. Returns the node that matched.
    pub async fn completed(&self, payload: &ActionPayload) -> AppResult<Option<NodeId>> {
        let matched = self.slots.iter().find_map(|(&node, slot)| {
            let run = slot.run.lock();
            let is_match = run.active.as_ref().is_some_and(|run| {
                run.payload.section.eq_ignore_ascii_case(&payload.section)
                    && run.payload.action.eq_ignore_ascii_case(&payload.action)
            });
            is_match.then_some(node)
        });
        match matched {
            Some(node) => {
                self.halt(node, ActionState::Completed).await?;
                Ok(Some(node))
            }
            None => {
                debug!(section = %payload.section, action = %payload.action, "No running action to complete");
                Ok(None)
            }
        }
    }

    async fn halt(&self, node: NodeId, state: ActionState) -> AppResult<()> {
        let slot = self.slot(node)?;
        self.section_name(node)?;

        let (active, run_id) = {
            let mut run = slot.run.lock();
            let active = run.active.take();
            if let Some(granted) = &active {
                granted.cancel.cancel();
            }
            run.state = Some(state);
            (active, run.last_run.clone())
        };

        self.interfaces.disable_all().await;
        self.reset_connected(node, run_id.as_deref());

        info!(action = %self.graph.node(node).name, state = %state, "Action halted");
        self.publish_state(node, state, active.as_ref().map(|run| &run.payload));
        Ok(())
    }

    fn reset_connected(&self, node: NodeId, run_id: Option<&str>) {
        for downstream in self.graph.connected_nodes(node, &mut HashSet::new()) {
            let node_id = self.graph.node(downstream).id.clone();
            debug!(node = %node_id, "Resetting connected node");
            let _ = self.events.send(ActionEvent::NodeReset {
                node_id,
                run_id: run_id.map(str::to_string),
            });
        }
    }

    fn publish_state(&self, node: NodeId, state: ActionState, payload: Option<&ActionPayload>) {
        let flow_node = self.graph.node(node);
        let _ = self.events.send(ActionEvent::StateChanged {
            node_id: flow_node.id.clone(),
            section: self
                .graph
                .section_of(node)
                .and_then(|s| self.graph.node(s).short_name.clone()),
            action: flow_node.name.clone(),
            state,
            session_id: payload.map(|p| p.session_id.clone()),
            run_id: payload.map(|p| p.run_id.clone()),
        });
    }

    /// Apply a trigger request. `start` yields the granted run.
    pub async fn apply(&self, request: &TriggerRequest) -> AppResult<Option<RunHandle>> {
        let request = request.normalized();
        let node = self.find(&request.section, &request.action)?;
        match request.kind {
            TriggerType::Start => self
                .start(
                    node,
                    request.session_id.as_deref(),
                    request.run_id.as_deref(),
                )
                .map(Some),
            TriggerType::Stop => self.stop(node).await.map(|_| None),
            TriggerType::Reset => {
                if self.is_running(node) {
                    self.stop(node).await?;
                }
                self.reset(node).map(|_| None)
            }
        }
    }

    /// Apply a trigger request and answer it.
    pub async fn trigger(&self, request: &TriggerRequest) -> TriggerResult {
        let outcome = self.apply(request).await;
        trigger_result(request, &outcome)
    }
}

/// Answer for `request` given how applying it went.
pub fn trigger_result<T>(request: &TriggerRequest, outcome: &AppResult<T>) -> TriggerResult {
    match outcome {
        Ok(_) => TriggerResult::ok(request),
        Err(CalError::AlreadyRunning(_)) => TriggerResult::failed(request, ERROR_ALREADY_RUNNING),
        Err(CalError::GraphLookupFailure(_)) => TriggerResult::failed(request, ERROR_ACTION_NOT_FOUND),
        Err(e) => TriggerResult::failed(request, e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::graph::FlowNode;
    use crate::transport::{EmulatedTransport, InterfaceHandle, Transport};

    fn machine() -> (ActionStateMachine, EmulatedTransport) {
        let graph = ProcedureGraph::new(vec![
            FlowNode::section("s1", "DC Volts", "DCV"),
            FlowNode::action("a1", "Verify", Some("s1")).wired_to(&["n1"]),
            FlowNode::new("n1", "function", "").wired_to(&["n2"]),
            FlowNode::new("n2", "function", "").wired_to(&["a1"]),
            FlowNode::action("a2", "Unbound", None),
        ]);
        let emulated = EmulatedTransport::new("bench");
        let interfaces = InterfaceManager::new();
        interfaces
            .register(InterfaceHandle::Gpib(Box::new(emulated.clone())))
            .unwrap();
        (
            ActionStateMachine::new(Arc::new(graph), Arc::new(interfaces), 64),
            emulated,
        )
    }

    fn drain(rx: &mut broadcast::Receiver<ActionEvent>) -> Vec<ActionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_start_then_stop() {
        let (machine, _) = machine();
        let mut rx = machine.subscribe();
        let node = machine.find("dcv", "VERIFY").unwrap();

        let handle = machine.start(node, Some("session"), Some("run-1")).unwrap();
        assert_eq!(handle.payload.section, "DCV");
        assert_eq!(handle.payload.run_id, "run-1");
        assert!(machine.is_running(node));
        assert!(machine.interfaces().is_enabled("bench"));

        machine.stop(node).await.unwrap();
        assert!(!machine.is_running(node));
        assert_eq!(machine.state(node), ActionState::Stopped);
        assert!(handle.cancel.is_cancelled());
        assert!(!machine.interfaces().is_enabled("bench"));

        let events = drain(&mut rx);
        let states: Vec<ActionState> = events
            .iter()
            .filter_map(|e| match e {
                ActionEvent::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![ActionState::Running, ActionState::Stopped]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_start_and_stop_cancel_every_run() {
        let (machine, _) = machine();
        let machine = Arc::new(machine);
        let node = machine.find("dcv", "verify").unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let machine = Arc::clone(&machine);
            tasks.push(tokio::spawn(async move {
                let mut granted = Vec::new();
                for _ in 0..200 {
                    if let Ok(handle) = machine.start(node, None, None) {
                        granted.push(handle);
                    }
                    machine.stop(node).await.unwrap();
                }
                granted
            }));
        }

        let mut granted = Vec::new();
        for task in tasks {
            granted.extend(task.await.unwrap());
        }
        assert!(!granted.is_empty());
        assert!(granted.iter().all(|run| run.cancel.is_cancelled()));
        assert!(!machine.is_running(node));
        assert_eq!(machine.state(node), ActionState::Stopped);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let (machine, _) = machine();
        let node = machine.find("dcv", "verify").unwrap();
        machine.start(node, None, None).unwrap();
        let err = machine.start(node, None, None).unwrap_err();
        assert!(matches!(err, CalError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn test_unbound_action_is_missing_section() {
        let (machine, _) = machine();
        let node = machine.graph().find("a2").unwrap();
        assert!(matches!(
            machine.start(node, None, None),
            Err(CalError::MissingSection(_))
        ));
        assert!(matches!(machine.stop(node).await, Err(CalError::MissingSection(_))));
        // reset needs no section
        machine.reset(node).unwrap();
    }

    #[tokio::test]
    async fn test_reset_propagates_once_through_cycle() {
        let (machine, _) = machine();
        let mut rx = machine.subscribe();
        let node = machine.find("dcv", "verify").unwrap();
        machine.reset(node).unwrap();
        let reset: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ActionEvent::NodeReset { node_id, .. } => Some(node_id),
                _ => None,
            })
            .collect();
        assert_eq!(reset, vec!["n1", "n2"]);
        assert_eq!(machine.state(node), ActionState::Idle);
    }

    #[tokio::test]
    async fn test_completed_matches_running_action() {
        let (machine, _) = machine();
        let node = machine.find("dcv", "verify").unwrap();
        let handle = machine.start(node, Some("s"), Some("r")).unwrap();

        let other = ActionPayload {
            action: "other".into(),
            ..handle.payload.clone()
        };
        assert_eq!(machine.completed(&other).await.unwrap(), None);
        assert!(machine.is_running(node));

        assert_eq!(machine.completed(&handle.payload).await.unwrap(), Some(node));
        assert_eq!(machine.state(node), ActionState::Completed);
        assert!(!machine.is_running(node));
    }

    #[tokio::test]
    async fn test_trigger_messages() {
        let (machine, _) = machine();
        let start = TriggerRequest::start("DCV", "Verify").with_session("s-1");
        assert_eq!(machine.trigger(&start).await.message.as_deref(), Some("ok"));
        assert_eq!(
            machine.trigger(&start).await.error.as_deref(),
            Some("Already running")
        );
        assert_eq!(
            machine
                .trigger(&TriggerRequest::start("DCV", "Missing"))
                .await
                .error
                .as_deref(),
            Some("Unable to find action start node")
        );

        let node = machine.find("dcv", "verify").unwrap();
        let reset = machine.trigger(&TriggerRequest::reset("dcv", "verify")).await;
        assert!(reset.is_ok());
        assert!(!machine.is_running(node));
        assert_eq!(machine.state(node), ActionState::Idle);
    }

    #[tokio::test]
    async fn test_stop_disconnects_interfaces() {
        let (machine, emulated) = machine();
        let node = machine.find("dcv", "verify").unwrap();
        machine.start(node, None, None).unwrap();
        drop(machine.interfaces().lease("bench").await.unwrap());
        assert!(emulated.is_connected());
        machine.stop(node).await.unwrap();
        assert!(!emulated.is_connected());
    }
}
