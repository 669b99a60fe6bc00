//! DAG (Directed Acyclic Graph) definitions for workflow orchestration.
//!
//! This module handles:
//! - The immutable DAG aggregate owned by one user
//! - Graph validation: unique node ids, edge references, acyclicity
//! - Frontier and predecessor queries used by the dispatcher

mod node;
mod schedule;

pub use node::{
    DatabaseOperation, DatabaseTaskConfig, DelayTaskConfig, EmailTaskConfig, FileOperation,
    FileTaskConfig, HttpTaskConfig, Node, NodeConfig, NodeId, NotificationPlatform,
    NotificationTaskConfig, RetryPolicy, ScriptLanguage, ScriptTaskConfig, TransformTaskConfig,
    WebhookTaskConfig,
};
pub use schedule::{CronExpression, DagSchedule, Schedule};

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::error::{CascadeError, ErrorCode, Result};

/// A directed edge: `source` must succeed before `target` may start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: NodeId::new(source),
            target: NodeId::new(target),
        }
    }
}

/// The node/edge structure of a DAG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DagGraph {
    /// Declared node order matters: it breaks dispatch ties
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl DagGraph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get a node by id.
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Node ids with zero incoming edges, in declared order.
    pub fn frontier(&self) -> Vec<&Node> {
        let targets: HashSet<&NodeId> = self.edges.iter().map(|e| &e.target).collect();
        self.nodes
            .iter()
            .filter(|n| !targets.contains(&n.id))
            .collect()
    }

    /// Direct predecessors of a node, in declared edge order.
    pub fn predecessors(&self, id: &NodeId) -> Vec<&NodeId> {
        self.edges
            .iter()
            .filter(|e| &e.target == id)
            .map(|e| &e.source)
            .collect()
    }

    /// Direct successors of a node, in declared node order.
    pub fn successors(&self, id: &NodeId) -> Vec<&Node> {
        let succ_ids: HashSet<&NodeId> = self
            .edges
            .iter()
            .filter(|e| &e.source == id)
            .map(|e| &e.target)
            .collect();
        self.nodes
            .iter()
            .filter(|n| succ_ids.contains(&n.id))
            .collect()
    }

    /// Validate structural invariants: unique node ids, edges referencing
    /// existing nodes, and acyclicity.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<&NodeId> = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(&node.id) {
                return Err(CascadeError::new(
                    ErrorCode::DuplicateNode,
                    format!("Duplicate node id: {}", node.id),
                ));
            }
        }

        for edge in &self.edges {
            for end in [&edge.source, &edge.target] {
                if !seen.contains(end) {
                    return Err(CascadeError::new(
                        ErrorCode::DagValidationFailed,
                        format!("Edge references unknown node: {}", end),
                    ));
                }
            }
            if edge.source == edge.target {
                return Err(CascadeError::cycle_detected(format!(
                    "Self-edge on node {}",
                    edge.source
                )));
            }
        }

        if self.has_cycle() {
            return Err(CascadeError::cycle_detected(
                "Graph contains a dependency cycle",
            ));
        }

        Ok(())
    }

    /// Cycle check via petgraph.
    pub fn has_cycle(&self) -> bool {
        let mut graph: DiGraph<&NodeId, ()> = DiGraph::new();
        let mut index = HashMap::new();
        for node in &self.nodes {
            index.insert(&node.id, graph.add_node(&node.id));
        }
        for edge in &self.edges {
            if let (Some(&s), Some(&t)) = (index.get(&edge.source), index.get(&edge.target)) {
                graph.add_edge(s, t, ());
            }
        }
        is_cyclic_directed(&graph)
    }
}

/// Trigger configuration for the webhook entry point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Opaque token matched by the trigger endpoint
    pub token: String,

    /// Optional path-style alias
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// HTTP method the trigger accepts
    #[serde(default = "default_trigger_method")]
    pub method: String,

    #[serde(default = "default_trigger_enabled")]
    pub enabled: bool,
}

fn default_trigger_method() -> String {
    "POST".to_string()
}

fn default_trigger_enabled() -> bool {
    true
}

/// An immutable workflow definition owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dag {
    pub id: Uuid,
    pub owner: Uuid,

    /// Unique per owner
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub graph: DagGraph,

    #[serde(default)]
    pub schedule: DagSchedule,

    /// DAG-level retry policy; wins over node-level overrides
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Whether the scheduler may trigger this DAG
    #[serde(default = "default_active")]
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<TriggerConfig>,

    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

fn default_active() -> bool {
    true
}

impl Dag {
    /// Create a new DAG, validating the graph and retry policy.
    pub fn new(owner: Uuid, name: impl Into<String>, graph: DagGraph) -> Result<Self> {
        let dag = Self {
            id: Uuid::new_v4(),
            owner,
            name: name.into(),
            description: None,
            graph,
            schedule: DagSchedule::default(),
            retry_policy: None,
            active: true,
            trigger: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        dag.validate()?;
        Ok(dag)
    }

    pub fn with_schedule(mut self, schedule: DagSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Validate every invariant enforced on DAG writes.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CascadeError::validation("DAG name must not be empty"));
        }

        self.graph.validate()?;

        if let Some(policy) = &self.retry_policy {
            policy
                .validate()
                .map_err(CascadeError::validation)?;
        }
        for node in &self.graph.nodes {
            if let Some(policy) = &node.retry {
                policy
                    .validate()
                    .map_err(CascadeError::validation)?;
            }
        }

        if let Schedule::Cron { expression, timezone } = &self.schedule.schedule {
            // Invalid expressions are tolerated at trigger time (logged and
            // skipped) but rejected on writes.
            CronExpression::parse(expression, timezone.as_deref())
                .map_err(CascadeError::validation)?;
        }

        Ok(())
    }

    /// Resolve the retry policy effective for a node.
    ///
    /// DAG-level policy wins over node-level; both default to `{3, 2 s}`.
    pub fn effective_retry(&self, node: &Node) -> RetryPolicy {
        self.retry_policy
            .clone()
            .or_else(|| node.retry.clone())
            .unwrap_or_default()
    }

    /// Whether the scheduler may fire this DAG at `now`.
    pub fn may_trigger(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.active && self.schedule.enabled && self.schedule.window_permits(now)
    }
}
