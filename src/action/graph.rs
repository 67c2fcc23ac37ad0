//! Procedure graph
//!
//! A procedure is deployed as a flat list of flow nodes. Each node lists its
//! downstream nodes in `wires` (one list per output port). Authored graphs may
//! contain cycles, so traversal always carries an explicit visited set.
//!
//! Nodes are stored in an arena and addressed by [`NodeId`], their position in
//! the deployed list. Id lookups ignore case, as the flow editor does.

use crate::error::{AppResult, CalError};
use crate::executor::ErrorCheckKind;
use crate::results::ResultSpec;
use crate::sequence::{Operation, SequenceDocument};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Section configuration node.
pub const SECTION_NODE_TYPE: &str = "indysoft-section-configuration";
/// Action start node.
pub const ACTION_START_NODE_TYPE: &str = "indysoft-action-start";
/// Action completed node.
pub const ACTION_COMPLETED_NODE_TYPE: &str = "indysoft-action-completed";
/// Command sequence builder node.
pub const SEQUENCE_NODE_TYPE: &str = "indysoft-command-sequence-builder";
/// Instrument error check node.
pub const ERROR_CHECK_NODE_TYPE: &str = "indysoft-instrument-error-check";

/// Index of a node in the graph arena.
pub type NodeId = usize;

/// One deployed flow node. Only the fields the engine reads are modelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    /// Node id, unique within the flow.
    pub id: String,
    /// Node type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Downstream node ids, one list per output port.
    #[serde(default)]
    pub wires: Vec<Vec<String>>,
    /// Section nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    /// Action start nodes: id of the owning section
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_config_id: Option<String>,
    /// Sequence nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    /// Sequence nodes: emit every step result in one batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respond_in_bulk: Option<bool>,
    /// Sequence nodes: measurements derived from the run's responses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<ResultSpec>>,
    /// Error check nodes: the device to ask
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    /// Error check nodes: how to ask. Defaults to `scpi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_type: Option<ErrorCheckKind>,
}

impl FlowNode {
    /// Bare node of type `kind`.
    pub fn new(id: &str, kind: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            wires: Vec::new(),
            short_name: None,
            section_config_id: None,
            operations: None,
            respond_in_bulk: None,
            results: None,
            unit_id: None,
            check_type: None,
        }
    }

    /// Section configuration node with a short name.
    pub fn section(id: &str, name: &str, short_name: &str) -> Self {
        Self {
            short_name: Some(short_name.to_string()),
            ..Self::new(id, SECTION_NODE_TYPE, name)
        }
    }

    /// Action start node owned by `section_id`.
    pub fn action(id: &str, name: &str, section_id: Option<&str>) -> Self {
        Self {
            section_config_id: section_id.map(str::to_string),
            ..Self::new(id, ACTION_START_NODE_TYPE, name)
        }
    }

    /// Sequence node holding `document`.
    pub fn sequence(id: &str, document: SequenceDocument) -> Self {
        Self {
            operations: Some(document.operations),
            respond_in_bulk: Some(document.respond_in_bulk),
            ..Self::new(id, SEQUENCE_NODE_TYPE, "")
        }
    }

    /// Error check node asking `unit_id`.
    pub fn error_check(id: &str, unit_id: &str, kind: ErrorCheckKind) -> Self {
        Self {
            unit_id: Some(unit_id.to_string()),
            check_type: Some(kind),
            ..Self::new(id, ERROR_CHECK_NODE_TYPE, "")
        }
    }

    /// Wire output port 0 to `targets`.
    pub fn wired_to(mut self, targets: &[&str]) -> Self {
        self.wires = vec![targets.iter().map(|t| t.to_string()).collect()];
        self
    }

    /// Whether this node is of type `kind`.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Sequence document of a sequence node.
    pub fn sequence_document(&self) -> Option<SequenceDocument> {
        self.operations.as_ref().map(|operations| SequenceDocument {
            respond_in_bulk: self.respond_in_bulk.unwrap_or(false),
            operations: operations.clone(),
        })
    }
}

/// Arena of deployed flow nodes.
#[derive(Debug, Clone, Default)]
pub struct ProcedureGraph {
    nodes: Vec<FlowNode>,
    /// Upper-cased node id -> arena index
    index: HashMap<String, NodeId>,
}

impl ProcedureGraph {
    /// Index `nodes` by position.
    pub fn new(nodes: Vec<FlowNode>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (node.id.to_uppercase(), i))
            .collect();
        Self { nodes, index }
    }

    /// Parse a deployed flow (a JSON array of nodes).
    pub fn from_json(json: &str) -> AppResult<Self> {
        let nodes: Vec<FlowNode> = serde_json::from_str(json)?;
        Ok(Self::new(nodes))
    }

    /// Load a deployed flow file (a JSON array of nodes).
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let graph = Self::from_json(&fs::read_to_string(path.as_ref())?)?;
        debug!(path = %path.as_ref().display(), nodes = graph.len(), "Loaded procedure graph");
        Ok(graph)
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the flow has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Node at `id`.
    pub fn node(&self, id: NodeId) -> &FlowNode {
        &self.nodes[id]
    }

    /// Case-insensitive lookup by node id.
    pub fn find(&self, node_id: &str) -> Option<NodeId> {
        self.index.get(&node_id.to_uppercase()).copied()
    }

    /// Nodes of type `kind`, in deployed order.
    pub fn nodes_of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, node)| node.is_kind(kind))
            .map(|(i, _)| i)
    }

    /// Section node with the given short name, ignoring case.
    pub fn find_section(&self, short_name: &str) -> Option<NodeId> {
        self.nodes_of_kind(SECTION_NODE_TYPE).find(|&i| {
            self.nodes[i]
                .short_name
                .as_deref()
                .is_some_and(|s| s.eq_ignore_ascii_case(short_name))
        })
    }

    /// Section an action start node is bound to, if it exists.
    pub fn section_of(&self, action: NodeId) -> Option<NodeId> {
        let section_id = self.nodes[action].section_config_id.as_deref()?;
        self.find(section_id)
            .filter(|&i| self.nodes[i].is_kind(SECTION_NODE_TYPE))
    }

    /// Action start node named `action` in the section `section`, ignoring case.
    pub fn find_action(&self, section: &str, action: &str) -> AppResult<NodeId> {
        let section_node = self.find_section(section).ok_or_else(|| {
            CalError::GraphLookupFailure(format!("section '{}' does not exist", section))
        })?;
        self.nodes_of_kind(ACTION_START_NODE_TYPE)
            .find(|&i| {
                self.nodes[i].name.eq_ignore_ascii_case(action)
                    && self.section_of(i) == Some(section_node)
            })
            .ok_or_else(|| {
                CalError::GraphLookupFailure(format!(
                    "action '{}' does not exist in section '{}'",
                    action, section
                ))
            })
    }

    /// Every node reachable from `start` through its wires, in depth-first
    /// order.
    ///
    /// `start` is added to `visited` first and never reported. Nodes already in
    /// `visited` are neither reported nor expanded, which keeps cyclic graphs
    /// finite and lets callers share one set across several traversals.
    /// Wires naming unknown nodes are ignored.
    pub fn connected_nodes(&self, start: NodeId, visited: &mut HashSet<NodeId>) -> Vec<NodeId> {
        visited.insert(start);
        let mut found = Vec::new();
        let mut stack: Vec<NodeId> = self.targets(start).rev().collect();
        while let Some(node) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            found.push(node);
            stack.extend(self.targets(node).rev());
        }
        found
    }

    fn targets(&self, node: NodeId) -> impl DoubleEndedIterator<Item = NodeId> + '_ {
        self.nodes[node]
            .wires
            .iter()
            .flatten()
            .filter_map(|id| self.find(id))
            .collect::<Vec<_>>()
            .into_iter()
    }

    /// Sequence and error check nodes downstream of `action`, in traversal order.
    pub fn downstream_work(&self, action: NodeId) -> Vec<NodeId> {
        self.connected_nodes(action, &mut HashSet::new())
            .into_iter()
            .filter(|&i| {
                let node = &self.nodes[i];
                node.is_kind(SEQUENCE_NODE_TYPE) || node.is_kind(ERROR_CHECK_NODE_TYPE)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(graph: &ProcedureGraph, nodes: &[NodeId]) -> Vec<String> {
        nodes.iter().map(|&i| graph.node(i).id.clone()).collect()
    }

    #[test]
    fn test_cycle_visits_each_node_once() {
        let graph = ProcedureGraph::new(vec![
            FlowNode::new("A", "x", "").wired_to(&["B"]),
            FlowNode::new("B", "x", "").wired_to(&["C"]),
            FlowNode::new("C", "x", "").wired_to(&["A"]),
        ]);
        let a = graph.find("a").unwrap();
        let mut visited = HashSet::new();
        let found = graph.connected_nodes(a, &mut visited);
        assert_eq!(ids(&graph, &found), vec!["B", "C"]);
        assert_eq!(visited.len(), 3);
    }

    #[test]
    fn test_shared_branches_and_self_loops() {
        let mut a = FlowNode::new("A", "x", "");
        a.wires = vec![vec!["B".into(), "C".into()], vec!["D".into()]];
        let graph = ProcedureGraph::new(vec![
            a,
            FlowNode::new("B", "x", "").wired_to(&["D", "B"]),
            FlowNode::new("C", "x", "").wired_to(&["D", "missing"]),
            FlowNode::new("D", "x", ""),
        ]);
        let found = graph.connected_nodes(0, &mut HashSet::new());
        assert_eq!(ids(&graph, &found), vec!["B", "D", "C"]);
    }

    #[test]
    fn test_visited_set_is_shared() {
        let graph = ProcedureGraph::new(vec![
            FlowNode::new("A", "x", "").wired_to(&["C"]),
            FlowNode::new("B", "x", "").wired_to(&["C"]),
            FlowNode::new("C", "x", ""),
        ]);
        let mut visited = HashSet::new();
        assert_eq!(graph.connected_nodes(0, &mut visited).len(), 1);
        assert!(graph.connected_nodes(1, &mut visited).is_empty());
    }

    #[test]
    fn test_action_lookup_is_case_insensitive() {
        let graph = ProcedureGraph::new(vec![
            FlowNode::section("s1", "DC Volts", "dcv"),
            FlowNode::action("a1", "Verify 10V", Some("s1")),
            FlowNode::action("a2", "Orphan", None),
        ]);
        assert_eq!(graph.find_action("DCV", "verify 10v").unwrap(), 1);
        assert!(matches!(
            graph.find_action("acv", "Verify 10V"),
            Err(CalError::GraphLookupFailure(_))
        ));
        assert!(graph.find_action("dcv", "Orphan").is_err());
        assert_eq!(graph.section_of(2), None);
    }

    #[test]
    fn test_flow_json_and_downstream_work() {
        let json = r#"[
            { "id": "s1", "type": "indysoft-section-configuration", "name": "DC", "shortName": "dc" },
            { "id": "a1", "type": "indysoft-action-start", "name": "Run", "sectionConfigId": "s1", "wires": [["q1"]] },
            { "id": "q1", "type": "indysoft-command-sequence-builder", "respondInBulk": true,
              "operations": [ { "type": "delay", "delay": 5 } ], "wires": [["chk"]] },
            { "id": "chk", "type": "indysoft-instrument-error-check", "unitId": "DMM1",
              "checkType": "gpib4882", "wires": [["done"]] },
            { "id": "done", "type": "indysoft-action-completed", "wires": [] }
        ]"#;
        let graph = ProcedureGraph::from_json(json).unwrap();
        let action = graph.find_action("dc", "run").unwrap();
        let work = graph.downstream_work(action);
        assert_eq!(ids(&graph, &work), vec!["q1", "chk"]);
        let document = graph.node(work[0]).sequence_document().unwrap();
        assert!(document.respond_in_bulk);
        assert_eq!(document.operations.len(), 1);

        let check = graph.node(work[1]);
        assert_eq!(check.unit_id.as_deref(), Some("DMM1"));
        assert_eq!(check.check_type, Some(ErrorCheckKind::Gpib4882));
        assert!(check.sequence_document().is_none());
    }
}
