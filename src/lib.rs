#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod adapter;
mod config;
mod core;
mod deployment;
pub mod error;
mod executor;
mod future;
mod graph;
pub mod journal;
mod module;
mod parameters;
#[cfg(test)]
mod testing;
mod utils;

pub use crate::adapter::{CallRequest, ChainAdapter, DeployRequest, ReadRequest, Sequencing};
pub use crate::config::Config;
pub use crate::core::{Address, Value};
pub use crate::deployment::Deployment;
pub use crate::error::*;
pub use crate::executor::{
    CancelHandle, DEFAULT_MAX_IN_FLIGHT, DeploymentReport, DeploymentStatus, Diagnostics,
    Executor, NodeExecution, NodeOutcome,
};
pub use crate::future::{Arg, Future, FutureId, FutureKind, FutureRef, Resolvable};
pub use crate::graph::{Action, DeploymentGraph, Node};
pub use crate::journal::{
    EntryStatus, FileStore, Journal, JournalEntry, JournalLog, JournalStore, MemoryStore,
    NodeStatus,
};
pub use crate::module::{
    CallDef, ContractAtDef, ContractDef, Exports, Module, ModuleBuilder, ReadDef, build_module,
};
pub use crate::parameters::{GLOBAL, Parameters};
#[cfg(feature = "logging")]
pub use crate::utils::{LOG_ENV, init_logging};
