mod diagnostics;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

pub use self::diagnostics::{Diagnostics, NodeExecution, NodeOutcome};
use crate::adapter::{CallRequest, ChainAdapter, DeployRequest, ReadRequest, Request, Sequencing};
use crate::core::{Address, Value};
use crate::error::{DeploymentError, ReconciliationError, TransactionError};
use crate::future::{Arg, FutureId, FutureRef};
use crate::graph::{Action, DeploymentGraph};
use crate::journal::{EntryStatus, Journal, NodeStatus};
use crate::utils::{STYLE_ACTION, STYLE_DEPLOYMENT};

/// Default upper bound on concurrently submitted actions.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Cloneable flag used to abandon a running deployment attempt.
///
/// Once raised, no further action is handed to the chain adapter. Actions
/// already in flight are awaited and their outcomes journaled.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentStatus {
    /// Every node succeeded.
    Success,
    /// At least one node failed; everything not depending on it completed.
    PartialFailure,
    /// The attempt was abandoned through a [`CancelHandle`].
    Cancelled,
}

/// Outcome of one deployment attempt.
#[derive(Debug)]
pub struct DeploymentReport {
    pub status: DeploymentStatus,
    pub instance: String,
    /// Every future resolved by the end of the attempt.
    pub resolved: BTreeMap<FutureId, Value>,
    /// Futures left pending, because they failed or something they depend on
    /// did.
    pub unresolved: BTreeSet<FutureId>,
    /// Nodes that failed in this attempt, with the underlying error.
    pub failed: BTreeMap<FutureId, TransactionError>,
    /// Nodes resolved from the journal without touching the chain.
    pub skipped: Vec<FutureId>,
    /// Nodes a previous attempt started or failed, tried again.
    pub retried: Vec<FutureId>,
    pub diagnostics: Diagnostics,
    exports: BTreeMap<String, FutureId>,
}

impl DeploymentReport {
    pub fn is_success(&self) -> bool {
        self.status == DeploymentStatus::Success
    }

    /// Concrete values of the module's exports resolved so far.
    pub fn exports(&self) -> BTreeMap<&str, &Value> {
        self.exports
            .iter()
            .filter_map(|(name, id)| Some((name.as_str(), self.resolved.get(id)?)))
            .collect()
    }

    pub fn export(&self, name: &str) -> Option<&Value> {
        self.resolved.get(self.exports.get(name)?)
    }

    /// Address behind an exported contract future.
    pub fn address(&self, name: &str) -> Option<Address> {
        self.export(name)?.as_str().map(Address::new)
    }

    pub fn value_of(&self, id: &str) -> Option<&Value> {
        self.resolved.get(id)
    }
}

/// Drives a deployment graph to completion against a chain adapter,
/// recording progress in a journal.
pub struct Executor<'a> {
    adapter: &'a dyn ChainAdapter,
    journal: Journal,
    max_in_flight: usize,
    cancel: CancelHandle,
}

/// Node finished by a worker thread.
struct Finished {
    index: NodeIndex,
    result: Result<Value, TransactionError>,
    start: Instant,
    duration: Duration,
}

/// What has to happen to a node that became ready.
enum Step {
    /// Succeeded in an earlier attempt.
    Reuse(Value),
    /// Parameter, known since the build.
    Parameter(Value),
    /// Binding of an existing contract, resolved without the adapter.
    Bind(Result<Value, TransactionError>),
    Dispatch(Request),
}

impl<'a> Executor<'a> {
    pub fn new(adapter: &'a dyn ChainAdapter, journal: Journal) -> Self {
        Self {
            adapter,
            journal,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            cancel: CancelHandle::default(),
        }
    }

    /// Caps the number of actions in flight, at least one.
    pub fn max_in_flight(mut self, limit: usize) -> Self {
        self.max_in_flight = limit.max(1);
        self
    }

    /// Shares an existing cancel flag with this executor.
    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn into_journal(self) -> Journal {
        self.journal
    }

    /// Runs one deployment attempt.
    ///
    /// Nodes that already succeeded according to the journal are never sent
    /// to the adapter again. Failed actions are reported in the returned
    /// [`DeploymentReport`]; only journal problems and reconciliation
    /// conflicts are errors.
    pub fn run(&mut self, graph: &DeploymentGraph) -> Result<DeploymentReport, DeploymentError> {
        self.reconcile(graph)?;

        // More workers than nodes would never be used.
        let limit = match self.adapter.sequencing() {
            Sequencing::Concurrent => self.max_in_flight.min(graph.len().max(1)),
            Sequencing::Serial => 1,
        };

        let instance = self.journal.instance().to_string();
        let total = graph.len() as u64;

        let root_span = tracing::span!(Level::INFO, "deploying", instance = %instance);
        root_span.pb_set_length(total);
        root_span.pb_set_style(&STYLE_DEPLOYMENT);
        root_span.pb_set_message(&format!("Deploying {}...", graph.module_id()));
        let _enter = root_span.enter();

        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(limit.saturating_add(1))
            .thread_name(|i| format!("kidou-worker-{i}"))
            .build()?;

        let mut run = Run::new(graph);
        let adapter = self.adapter;
        let journal = &mut self.journal;
        let cancel = &self.cancel;
        let root = &root_span;

        // One worker runs the scheduler loop below, the rest execute actions.
        workers.scope(|s| {
            let (sender, receiver) = channel::<Finished>();
            let mut in_flight = 0;

            loop {
                while run.fatal.is_none()
                    && !cancel.is_cancelled()
                    && let Some(index) = run.ready.pop_front()
                {
                    let node = &graph.graph[index];

                    match run.step(journal, graph, index) {
                        Step::Reuse(value) => {
                            tracing::debug!(node = %node.id, "Skipping, already succeeded");
                            run.skipped.push(node.id.clone());
                            run.outcomes.insert(node.id.clone(), NodeOutcome::Reused);
                            run.complete(graph, index, value);
                            root.pb_inc(1);
                        }
                        Step::Parameter(value) => {
                            run.outcomes.insert(node.id.clone(), NodeOutcome::Resolved);
                            run.complete(graph, index, value);
                            root.pb_inc(1);
                        }
                        Step::Bind(result) => {
                            let start = Instant::now();
                            let resumed = journal.status_of(&node.id) == NodeStatus::Interrupted;
                            let started = EntryStatus::Started {
                                fingerprint: node.fingerprint(),
                                resumed,
                            };

                            if let Err(err) = journal.record(&node.id, started) {
                                run.fatal = Some(err.into());
                                break;
                            }

                            run.retry(index, &node.id, resumed);
                            run.finish(journal, graph, index, result, start, start.elapsed());
                            root.pb_inc(1);
                        }
                        Step::Dispatch(request) => {
                            if in_flight >= limit {
                                run.ready.push_front(index);
                                break;
                            }

                            let resumed = journal.status_of(&node.id) == NodeStatus::Interrupted;
                            let started = EntryStatus::Started {
                                fingerprint: node.fingerprint(),
                                resumed,
                            };

                            if let Err(err) = journal.record(&node.id, started) {
                                run.fatal = Some(err.into());
                                break;
                            }

                            run.retry(index, &node.id, resumed);

                            let request = request.with_resumed(resumed);
                            let sender = sender.clone();
                            let name = node.id.clone();
                            in_flight += 1;

                            s.spawn(move |_| {
                                let span = tracing::span!(
                                    parent: root,
                                    Level::INFO,
                                    "action",
                                    node = %name
                                );
                                span.pb_set_style(&STYLE_ACTION);
                                span.pb_set_message(&request.describe());
                                let _enter = span.enter();

                                let start = Instant::now();
                                let result = catch_unwind(AssertUnwindSafe(|| {
                                    request.execute(adapter)
                                }))
                                .unwrap_or_else(|panic| {
                                    Err(TransactionError::Panicked(panic_message(panic)))
                                });

                                let finished = Finished {
                                    index,
                                    result,
                                    start,
                                    duration: start.elapsed(),
                                };

                                // The receiver outlives the scope.
                                let _ = sender.send(finished);
                            });
                        }
                    }
                }

                if in_flight == 0 {
                    break;
                }

                let Ok(finished) = receiver.recv() else {
                    break;
                };

                in_flight -= 1;
                root.pb_inc(1);

                if run.fatal.is_some() {
                    continue;
                }

                let Finished {
                    index,
                    result,
                    start,
                    duration,
                } = finished;

                run.finish(journal, graph, index, result, start, duration);
            }
        });

        if let Some(err) = run.fatal.take() {
            return Err(err);
        }

        let report = run.report(graph, instance, cancel.is_cancelled());

        match report.status {
            DeploymentStatus::Success => tracing::info!("Deployment complete!"),
            DeploymentStatus::PartialFailure => tracing::warn!(
                failed = report.failed.len(),
                unresolved = report.unresolved.len(),
                "Deployment finished with failures"
            ),
            DeploymentStatus::Cancelled => tracing::warn!(
                unresolved = report.unresolved.len(),
                "Deployment cancelled"
            ),
        }

        Ok(report)
    }

    /// Compares what the journal says was deployed with what the module
    /// declares now.
    fn reconcile(&self, graph: &DeploymentGraph) -> Result<(), ReconciliationError> {
        for node in graph.nodes() {
            if !matches!(self.journal.status_of(&node.id), NodeStatus::Succeeded(_)) {
                continue;
            }

            let current = node.fingerprint();

            if let Some(recorded) = self.journal.fingerprint_of(&node.id)
                && recorded != current
            {
                return Err(ReconciliationError {
                    node: node.id.clone(),
                    recorded: recorded.to_string(),
                    current,
                });
            }
        }

        for id in self.journal.nodes() {
            if graph.node(id).is_none() {
                tracing::warn!(node = %id, "Journal mentions a node the module no longer declares");
            }
        }

        Ok(())
    }
}

/// Bookkeeping of one attempt, owned by the scheduler loop.
struct Run {
    ready: VecDeque<NodeIndex>,
    waiting: HashMap<NodeIndex, usize>,
    resolved: HashMap<NodeIndex, Value>,
    failed: BTreeMap<FutureId, TransactionError>,
    /// Nodes a previous attempt started or failed.
    attempted: Vec<NodeIndex>,
    skipped: Vec<FutureId>,
    retried: Vec<FutureId>,
    outcomes: BTreeMap<FutureId, NodeOutcome>,
    times: BTreeMap<FutureId, NodeExecution>,
    fatal: Option<DeploymentError>,
}

impl Run {
    fn new(graph: &DeploymentGraph) -> Self {
        let mut ready = VecDeque::new();
        let mut waiting = HashMap::new();

        for index in graph.graph.node_indices() {
            match graph.graph[index].dependencies.len() {
                0 => ready.push_back(index),
                n => {
                    waiting.insert(index, n);
                }
            }
        }

        Self {
            ready,
            waiting,
            resolved: HashMap::new(),
            failed: BTreeMap::new(),
            attempted: Vec::new(),
            skipped: Vec::new(),
            retried: Vec::new(),
            outcomes: BTreeMap::new(),
            times: BTreeMap::new(),
            fatal: None,
        }
    }

    fn step(&mut self, journal: &Journal, graph: &DeploymentGraph, index: NodeIndex) -> Step {
        let node = &graph.graph[index];

        match journal.status_of(&node.id) {
            NodeStatus::Succeeded(value) => return Step::Reuse(value),
            NodeStatus::Interrupted | NodeStatus::Failed(_) => self.attempted.push(index),
            NodeStatus::Unresolved => {}
        }

        let lookup = |future: &FutureRef| self.resolved.get(&future.index).cloned();
        let args = |list: &[Arg]| -> Result<Vec<Value>, TransactionError> {
            list.iter()
                .map(|arg| {
                    arg.resolve(&lookup).ok_or_else(|| {
                        TransactionError::Rejected(format!(
                            "argument of '{}' did not resolve",
                            node.id
                        ))
                    })
                })
                .collect()
        };
        let target = |target: &FutureRef| -> Result<Address, TransactionError> {
            match lookup(target) {
                Some(Value::String(address)) => Ok(Address(address)),
                _ => Err(TransactionError::Rejected(format!(
                    "'{}' did not resolve to an address",
                    target.id()
                ))),
            }
        };

        let request = match &node.action {
            Action::Parameter { value, .. } => return Step::Parameter(value.clone()),
            Action::ContractAt { address, .. } => {
                let result = match address.resolve(&lookup) {
                    Some(Value::String(address)) => Ok(Value::String(address)),
                    _ => Err(TransactionError::Rejected(format!(
                        "address of '{}' did not resolve to a string",
                        node.id
                    ))),
                };
                return Step::Bind(result);
            }
            Action::Deploy { contract, args: a } => args(a).map(|args| {
                Request::Deploy(DeployRequest {
                    node: node.id.clone(),
                    contract: contract.clone(),
                    args,
                    resumed: false,
                })
            }),
            Action::Call {
                target: t,
                method,
                args: a,
            } => target(t).and_then(|address| {
                Ok(Request::Call(CallRequest {
                    node: node.id.clone(),
                    address,
                    method: method.clone(),
                    args: args(a)?,
                    resumed: false,
                }))
            }),
            Action::Read {
                target: t,
                method,
                args: a,
            } => target(t).and_then(|address| {
                Ok(Request::Read(ReadRequest {
                    node: node.id.clone(),
                    address,
                    method: method.clone(),
                    args: args(a)?,
                }))
            }),
        };

        match request {
            Ok(request) => Step::Dispatch(request),
            // Reported through the same path as a chain failure.
            Err(err) => Step::Bind(Err(err)),
        }
    }

    /// Notes a node that an earlier attempt already tried.
    fn retry(&mut self, index: NodeIndex, node: &FutureId, resumed: bool) {
        if self.attempted.contains(&index) && !self.retried.contains(node) {
            tracing::warn!(node = %node, resumed, "Retrying");
            self.retried.push(node.clone());
        }
    }

    /// Records the outcome of an executed node.
    fn finish(
        &mut self,
        journal: &mut Journal,
        graph: &DeploymentGraph,
        index: NodeIndex,
        result: Result<Value, TransactionError>,
        start: Instant,
        duration: Duration,
    ) {
        let node = &graph.graph[index];
        self.times
            .insert(node.id.clone(), NodeExecution { start, duration });

        let status = match &result {
            Ok(value) => EntryStatus::Succeeded {
                result: value.clone(),
            },
            Err(err) => EntryStatus::Failed {
                error: err.to_string(),
            },
        };

        if let Err(err) = journal.record(&node.id, status) {
            self.fatal = Some(err.into());
            return;
        }

        match result {
            Ok(value) => {
                tracing::info!(node = %node.id, result = %value, "Succeeded in {duration:.2?}");
                self.outcomes.insert(node.id.clone(), NodeOutcome::Executed);
                self.complete(graph, index, value);
            }
            Err(err) => {
                tracing::error!(node = %node.id, "Failed: {err}");
                self.outcomes.insert(node.id.clone(), NodeOutcome::Failed);
                self.failed.insert(node.id.clone(), err);
            }
        }
    }

    /// Resolves a node and readies every dependent left without pending
    /// dependencies.
    fn complete(&mut self, graph: &DeploymentGraph, index: NodeIndex, value: Value) {
        self.resolved.insert(index, value);

        let mut unlocked: Vec<NodeIndex> = graph
            .dependents(index)
            .filter(|dependent| match self.waiting.get_mut(dependent) {
                Some(count) => {
                    *count -= 1;
                    *count == 0
                }
                None => false,
            })
            .collect();

        // Declaration order, keeps dispatch deterministic.
        unlocked.sort();

        for index in unlocked {
            self.waiting.remove(&index);
            self.ready.push_back(index);
        }
    }

    fn report(
        self,
        graph: &DeploymentGraph,
        instance: String,
        cancelled: bool,
    ) -> DeploymentReport {
        let mut resolved = BTreeMap::new();
        let mut unresolved = BTreeSet::new();
        let mut outcomes = self.outcomes;

        for node in graph.nodes() {
            match graph.ids.get(&node.id).and_then(|i| self.resolved.get(i)) {
                Some(value) => {
                    resolved.insert(node.id.clone(), value.clone());
                }
                None => {
                    unresolved.insert(node.id.clone());
                    outcomes.entry(node.id.clone()).or_insert(NodeOutcome::Blocked);
                }
            }
        }

        let status = if unresolved.is_empty() {
            DeploymentStatus::Success
        } else if cancelled {
            DeploymentStatus::Cancelled
        } else {
            DeploymentStatus::PartialFailure
        };

        let exports = graph
            .exports()
            .iter()
            .map(|(name, future)| (name.to_string(), future.id().clone()))
            .collect();

        DeploymentReport {
            status,
            instance,
            resolved,
            unresolved,
            failed: self.failed,
            skipped: self.skipped,
            retried: self.retried,
            diagnostics: Diagnostics {
                outcomes,
                execution_times: self.times,
            },
            exports,
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}
