use thiserror::Error;

use crate::future::FutureId;

/// The module declared something that can never form a valid graph.
///
/// Raised while the builder function runs, so no partially built graph is
/// ever handed to the executor.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeclarationError {
    #[error("Future '{0}' is already declared, use `.id(..)` to give the action a distinct id")]
    DuplicateId(FutureId),

    #[error("Future '{0}' does not belong to this deployment graph")]
    DanglingFuture(FutureId),

    #[error("Node '{node}' depends on '{missing}', which is never declared")]
    UnknownDependency { node: FutureId, missing: FutureId },

    #[error("Module '{module}' requires parameter '{name}', but no value was supplied")]
    MissingParameter { module: String, name: String },

    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),

    #[error("Module '{module}' exports '{name}' more than once")]
    DuplicateExport { module: String, name: String },

    #[error("Module '{module}' has no export named '{name}'")]
    UnknownExport { module: String, name: String },

    #[error("Export '{name}' of module '{module}' is {actual}, not {expected}")]
    ExportKind {
        module: String,
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Two different modules are both named '{0}'")]
    DuplicateModule(String),
}

/// The declared actions, or the included modules, depend on each other in a
/// loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Cyclic dependency between {}", .members.join(" -> "))]
pub struct CyclicDependencyError {
    /// Future ids (or module ids) taking part in the cycle.
    pub members: Vec<String>,
}

/// Anything that can stop a module from turning into a deployment graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error(transparent)]
    Declaration(#[from] DeclarationError),

    #[error(transparent)]
    Cycle(#[from] CyclicDependencyError),
}

/// Failure of a single on-chain action reported by the chain adapter.
///
/// Recorded against the node that caused it; it never aborts independent
/// branches of the graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("transaction reverted: {0}")]
    Reverted(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("action rejected: {0}")]
    Rejected(String),

    #[error("chain adapter panicked: {0}")]
    Panicked(String),
}

/// Another attempt already owns the journal of this instance.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "Deployment instance '{instance}' is locked by another attempt ({holder}); \
     retry once it finishes"
)]
pub struct ConcurrentDeploymentError {
    pub instance: String,
    pub holder: String,
}

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal I/O error:\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't encode journal entry:\n{0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Journal of '{instance}' is corrupted at line {line}: {reason}")]
    Corrupt {
        instance: String,
        line: usize,
        reason: String,
    },

    #[error("Node '{0}' already succeeded, its journal entries are final")]
    AlreadySucceeded(FutureId),

    #[error("'{0}' is not a valid deployment instance id")]
    InvalidInstance(String),

    #[error(transparent)]
    Concurrent(#[from] ConcurrentDeploymentError),
}

/// The module changed in a way that conflicts with what is already deployed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error(
    "Node '{node}' was already deployed from a different declaration \
     (journal {recorded}, module {current}); use a new instance id or restore the module"
)]
pub struct ReconciliationError {
    pub node: FutureId,
    pub recorded: String,
    pub current: String,
}

/// Fatal errors of a deployment attempt. Failures of individual actions are
/// not errors at this level, they are reported in the
/// [`DeploymentReport`](crate::DeploymentReport).
#[derive(Debug, Error)]
pub enum DeploymentError {
    #[error("Error while writing the execution journal:\n{0}")]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error("Couldn't start the worker threads:\n{0}")]
    Workers(#[from] rayon::ThreadPoolBuildError),
}

impl DeploymentError {
    /// Returns the lock contention error if that is what stopped the attempt.
    pub fn as_concurrent(&self) -> Option<&ConcurrentDeploymentError> {
        match self {
            DeploymentError::Journal(JournalError::Concurrent(err)) => Some(err),
            _ => None,
        }
    }
}
