use std::collections::BTreeMap;
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::future::FutureId;
use crate::graph::DeploymentGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// What happened to a node during one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    /// Sent to the chain adapter (or bound locally) and succeeded.
    Executed,
    /// Taken from the journal of an earlier attempt.
    Reused,
    /// Parameter, resolved without any action.
    Resolved,
    Failed,
    /// Never became ready.
    Blocked,
}

#[derive(Debug, Default)]
pub struct Diagnostics {
    pub outcomes: BTreeMap<FutureId, NodeOutcome>,
    pub execution_times: BTreeMap<FutureId, NodeExecution>,
}

impl Diagnostics {
    pub fn outcome(&self, id: &str) -> Option<NodeOutcome> {
        self.outcomes.get(id).copied()
    }

    /// The deployment graph as a Mermaid flowchart, nodes coloured by outcome.
    pub fn render_mermaid(&self, graph: &DeploymentGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for index in graph.graph.node_indices() {
            let node = &graph.graph[index];
            let name = node.id.as_str().replace('"', "\\\"");

            let (label, color) = match self.outcome(&node.id) {
                Some(NodeOutcome::Executed) => {
                    let label = match self.execution_times.get(&node.id) {
                        Some(exec) => format!("{:.2?}", exec.duration),
                        None => String::from("Executed"),
                    };
                    (label, "#90EE90")
                }
                Some(NodeOutcome::Reused) => (String::from("Journal"), "#ADD8E6"),
                Some(NodeOutcome::Resolved) => (String::from("Parameter"), "#E0E0E0"),
                Some(NodeOutcome::Failed) => (String::from("Failed"), "#FF7F7F"),
                Some(NodeOutcome::Blocked) | None => (String::from("Blocked"), "#FFFFFF"),
            };

            let _ = writeln!(f, "    {:?}[\"{}<br/>{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {:?} fill:{}", index.index(), color);
        }

        for edge in graph.graph.raw_edges() {
            let _ = writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            );
        }

        f
    }
}
