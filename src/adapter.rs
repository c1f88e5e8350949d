//! The boundary between the executor and the chain.
//!
//! Everything chain specific (RPC, signing, gas, ABI encoding, nonce
//! allocation) lives behind [`ChainAdapter`]. The executor hands it fully
//! resolved requests and records whatever comes back.

use crate::core::{Address, Value};
use crate::error::TransactionError;
use crate::future::FutureId;

/// How many actions the adapter can have in flight at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sequencing {
    /// Independent actions may be submitted concurrently, the adapter takes
    /// care of nonce ordering itself.
    #[default]
    Concurrent,
    /// One action at a time.
    Serial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeployRequest {
    pub node: FutureId,
    pub contract: String,
    pub args: Vec<Value>,
    /// A previous attempt started this action without recording an outcome,
    /// it may already be on chain.
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub node: FutureId,
    pub address: Address,
    pub method: String,
    pub args: Vec<Value>,
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub node: FutureId,
    pub address: Address,
    pub method: String,
    pub args: Vec<Value>,
}

/// Chain access used by the executor.
///
/// Methods are called from worker threads, possibly concurrently unless
/// [`sequencing`](ChainAdapter::sequencing) says otherwise. Each call blocks
/// until the outcome of the action is definitive.
pub trait ChainAdapter: Send + Sync {
    fn deploy_contract(&self, request: &DeployRequest) -> Result<Address, TransactionError>;

    fn call(&self, request: &CallRequest) -> Result<Value, TransactionError>;

    fn read(&self, request: &ReadRequest) -> Result<Value, TransactionError>;

    fn sequencing(&self) -> Sequencing {
        Sequencing::Concurrent
    }
}

/// A fully resolved action ready to be handed to the adapter.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Request {
    Deploy(DeployRequest),
    Call(CallRequest),
    Read(ReadRequest),
}

impl Request {
    pub(crate) fn execute(&self, adapter: &dyn ChainAdapter) -> Result<Value, TransactionError> {
        match self {
            Request::Deploy(request) => adapter.deploy_contract(request).map(Value::from),
            Request::Call(request) => adapter.call(request),
            Request::Read(request) => adapter.read(request),
        }
    }

    /// Marks the request as a retry of an interrupted action. Reads have no
    /// side effects and are unaffected.
    pub(crate) fn with_resumed(mut self, resumed: bool) -> Self {
        match &mut self {
            Request::Deploy(request) => request.resumed = resumed,
            Request::Call(request) => request.resumed = resumed,
            Request::Read(_) => {}
        }
        self
    }

    pub(crate) fn describe(&self) -> String {
        match self {
            Request::Deploy(request) => format!("Deploying {}", request.contract),
            Request::Call(request) => format!("Calling {}.{}", request.address, request.method),
            Request::Read(request) => format!("Reading {}.{}", request.address, request.method),
        }
    }
}
