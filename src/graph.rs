//! The deployment graph.
//!
//! Nodes live in a `petgraph` arena and refer to each other by integer
//! [`NodeIndex`], edges point from a dependency to its dependent. The graph is
//! immutable once built; all resolution state is owned by the executor.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Display, Formatter};

use petgraph::Direction;
use petgraph::Graph;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::NodeIndex;

use crate::core::{ArcStr, Blake3Hasher, Hash32, Value};
use crate::error::CyclicDependencyError;
use crate::future::{Arg, FutureId, FutureKind, FutureRef};
use crate::module::Exports;

/// One declared action.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Deploy a new instance of a contract.
    Deploy { contract: String, args: Vec<Arg> },
    /// Bind an already deployed contract, no transaction is sent.
    ContractAt { contract: String, address: Arg },
    /// Send a state changing method call.
    Call {
        target: FutureRef,
        method: String,
        args: Vec<Arg>,
    },
    /// Perform a read-only method call.
    Read {
        target: FutureRef,
        method: String,
        args: Vec<Arg>,
    },
    /// Module parameter, resolved while building.
    Parameter { name: String, value: Value },
}

impl Action {
    /// Every future referenced by the action, in declaration order.
    pub(crate) fn futures(&self) -> Vec<&FutureRef> {
        let mut out = Vec::new();

        match self {
            Action::Deploy { args, .. } => args.iter().for_each(|a| a.collect_futures(&mut out)),
            Action::ContractAt { address, .. } => address.collect_futures(&mut out),
            Action::Call { target, args, .. } | Action::Read { target, args, .. } => {
                out.push(target);
                args.iter().for_each(|a| a.collect_futures(&mut out));
            }
            Action::Parameter { .. } => {}
        }

        out
    }

    fn label(&self) -> String {
        match self {
            Action::Deploy { contract, .. } => format!("deploy {contract}"),
            Action::ContractAt { contract, .. } => format!("bind {contract}"),
            Action::Call { method, .. } => format!("call {method}"),
            Action::Read { method, .. } => format!("read {method}"),
            Action::Parameter { name, .. } => format!("parameter {name}"),
        }
    }
}

/// A node of the deployment graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: FutureId,
    pub(crate) kind: FutureKind,
    pub(crate) action: Action,
    pub(crate) dependencies: Vec<NodeIndex>,
    pub(crate) fingerprint: Hash32,
}

impl Node {
    pub fn id(&self) -> &FutureId {
        &self.id
    }

    pub fn kind(&self) -> FutureKind {
        self.kind
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Hex encoded BLAKE3 fingerprint of the declared action.
    pub fn fingerprint(&self) -> String {
        self.fingerprint.to_hex()
    }
}

/// The immutable, acyclic graph of actions declared by a module.
pub struct DeploymentGraph {
    pub(crate) module: ArcStr,
    pub(crate) graph: Graph<Node, ()>,
    pub(crate) ids: HashMap<FutureId, NodeIndex>,
    pub(crate) exports: Exports,
    pub(crate) order: Vec<NodeIndex>,
}

impl DeploymentGraph {
    /// Validates the raw arena and freezes it. Fails if the declarations form
    /// a cycle.
    pub(crate) fn assemble(
        module: ArcStr,
        mut graph: Graph<Node, ()>,
        ids: HashMap<FutureId, NodeIndex>,
        exports: Exports,
    ) -> Result<Self, CyclicDependencyError> {
        let order = match toposort(&graph, None) {
            Ok(order) => order,
            Err(cycle) => return Err(describe_cycle(&graph, cycle.node_id())),
        };

        // Dependencies always come first, so parameter values can be inlined.
        for &index in &order {
            let hash = fingerprint(&graph, &graph[index]);
            graph[index].fingerprint = hash;
        }

        Ok(Self {
            module,
            graph,
            ids,
            exports,
            order,
        })
    }

    /// Id of the root module.
    pub fn module_id(&self) -> &str {
        &self.module
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.ids.get(id).map(|&index| &self.graph[index])
    }

    /// All nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.graph.node_indices().map(|index| &self.graph[index])
    }

    /// Node ids in a topological order, dependencies first.
    pub fn topological_order(&self) -> Vec<&FutureId> {
        self.order.iter().map(|&index| &self.graph[index].id).collect()
    }

    /// Every dependency edge as `(dependency, dependent)`, sorted.
    pub fn edges(&self) -> Vec<(&FutureId, &FutureId)> {
        let mut edges: Vec<_> = self
            .graph
            .raw_edges()
            .iter()
            .map(|edge| (&self.graph[edge.source()].id, &self.graph[edge.target()].id))
            .collect();
        edges.sort();
        edges
    }

    /// Ids of the direct dependencies of a node.
    pub fn dependencies_of(&self, id: &str) -> Option<Vec<&FutureId>> {
        let node = self.node(id)?;
        Some(
            node.dependencies
                .iter()
                .map(|&index| &self.graph[index].id)
                .collect(),
        )
    }

    /// The futures exported by the root module.
    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    pub(crate) fn dependents(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(index, Direction::Outgoing)
    }
}

impl std::fmt::Debug for DeploymentGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentGraph")
            .field("module", &self.module)
            .field("nodes", &self.graph.node_count())
            .field("edges", &self.graph.edge_count())
            .finish()
    }
}

/// Renders the graph as a Mermaid flowchart.
impl Display for DeploymentGraph {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let node = &self.graph[index];
            let name = node.id.as_str().replace('"', "\\\"");
            writeln!(
                f,
                "    {:?}[\"{}<br/>{}\"]",
                index.index(),
                name,
                node.action.label()
            )?;
        }

        let mut exported: Vec<_> = self
            .exports
            .iter()
            .map(|(name, future)| (future.index.index(), name))
            .collect();
        exported.sort();

        if !exported.is_empty() {
            writeln!(f, "    Exports[Exports]")?;
            for (index, name) in exported {
                writeln!(f, "    {index:?} -- \"{name}\" --> Exports")?;
            }
        }

        for edge in self.graph.raw_edges() {
            writeln!(
                f,
                "    {:?} --> {:?}",
                edge.source().index(),
                edge.target().index()
            )?;
        }

        Ok(())
    }
}

/// Fingerprints the declared action. Futures are hashed by id, except for
/// parameters which are hashed by value so that changing a parameter between
/// attempts is noticed.
fn fingerprint(graph: &Graph<Node, ()>, node: &Node) -> Hash32 {
    let mut hasher = Blake3Hasher::default();

    match &node.action {
        Action::Deploy { contract, args } => {
            hasher.part("deploy").part(contract);
            hash_args(&mut hasher, graph, args);
        }
        Action::ContractAt { contract, address } => {
            hasher.part("contract_at").part(contract);
            hash_arg(&mut hasher, graph, address);
        }
        Action::Call {
            target,
            method,
            args,
        } => {
            hasher.part("call").part(target.id.as_str()).part(method);
            hash_args(&mut hasher, graph, args);
        }
        Action::Read {
            target,
            method,
            args,
        } => {
            hasher.part("read").part(target.id.as_str()).part(method);
            hash_args(&mut hasher, graph, args);
        }
        Action::Parameter { name, value } => {
            hasher.part("parameter").part(name).part(value.to_string());
        }
    }

    hasher.finish()
}

fn hash_args(hasher: &mut Blake3Hasher, graph: &Graph<Node, ()>, args: &[Arg]) {
    hasher.part((args.len() as u64).to_le_bytes());
    for arg in args {
        hash_arg(hasher, graph, arg);
    }
}

fn hash_arg(hasher: &mut Blake3Hasher, graph: &Graph<Node, ()>, arg: &Arg) {
    match arg {
        Arg::Literal(value) => {
            hasher.part("literal").part(value.to_string());
        }
        Arg::Future(future) => match &graph[future.index].action {
            Action::Parameter { value, .. } => {
                hasher.part("literal").part(value.to_string());
            }
            _ => {
                hasher.part("future").part(future.id.as_str());
            }
        },
        Arg::List(items) => {
            hasher.part("list");
            hash_args(hasher, graph, items);
        }
    }
}

fn describe_cycle(graph: &Graph<Node, ()>, hint: NodeIndex) -> CyclicDependencyError {
    // The hint is where toposort gave up, prefer its component if it is cyclic.
    let components = tarjan_scc(graph);

    let start = components
        .iter()
        .filter(|scc| is_cyclic(graph, scc))
        .find(|scc| scc.contains(&hint))
        .or_else(|| components.iter().find(|scc| is_cyclic(graph, scc)))
        .map(|scc| *scc.iter().min().unwrap_or(&hint))
        .unwrap_or(hint);

    let members = cycle_path(graph, start)
        .into_iter()
        .map(|index| graph[index].id.to_string())
        .collect();

    CyclicDependencyError { members }
}

fn is_cyclic(graph: &Graph<Node, ()>, scc: &[NodeIndex]) -> bool {
    scc.len() > 1 || scc.first().is_some_and(|&index| graph.contains_edge(index, index))
}

/// Shortest path leading from `start` back to itself, both ends included.
fn cycle_path(graph: &Graph<Node, ()>, start: NodeIndex) -> Vec<NodeIndex> {
    let mut prev: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut seen = HashSet::from([start]);
    let mut queue = VecDeque::from([start]);

    while let Some(current) = queue.pop_front() {
        for next in graph.neighbors_directed(current, Direction::Outgoing) {
            if next == start {
                let mut path = vec![current];
                let mut cursor = current;
                while cursor != start {
                    cursor = prev[&cursor];
                    path.push(cursor);
                }
                path.reverse();
                path.push(start);
                return path;
            }

            if seen.insert(next) {
                prev.insert(next, current);
                queue.push_back(next);
            }
        }
    }

    vec![start]
}
