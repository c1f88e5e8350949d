//! Scripted chain adapter shared by the tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use crate::adapter::{CallRequest, ChainAdapter, DeployRequest, ReadRequest, Sequencing};
use crate::core::{Address, Value};
use crate::error::TransactionError;
use crate::executor::CancelHandle;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Invocation {
    pub node: String,
    pub args: Vec<Value>,
    pub resumed: bool,
}

enum Scripted {
    Ok(Value),
    Err(TransactionError),
    Panic,
}

/// Adapter answering from a per-node script. Unscripted deployments return
/// `0x<local id>`, unscripted calls and reads return the node id.
#[derive(Default)]
pub(crate) struct ScriptedAdapter {
    script: Mutex<HashMap<String, VecDeque<Scripted>>>,
    invocations: Mutex<Vec<Invocation>>,
    serial: bool,
    delay: Duration,
    cancel: Option<CancelHandle>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serial(mut self) -> Self {
        self.serial = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Raises `cancel` as soon as the first action is submitted.
    pub fn cancel_on_first(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn succeed(self, node: &str, value: impl Into<Value>) -> Self {
        self.push(node, Scripted::Ok(value.into()))
    }

    pub fn fail(self, node: &str, err: TransactionError) -> Self {
        self.push(node, Scripted::Err(err))
    }

    pub fn panic(self, node: &str) -> Self {
        self.push(node, Scripted::Panic)
    }

    fn push(self, node: &str, scripted: Scripted) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry(node.to_string())
            .or_default()
            .push_back(scripted);
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invoked(&self) -> Vec<String> {
        self.invocations().into_iter().map(|i| i.node).collect()
    }

    /// Highest number of actions observed in flight at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn answer(
        &self,
        node: &str,
        args: &[Value],
        resumed: bool,
        default: Value,
    ) -> Result<Value, TransactionError> {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        self.invocations.lock().unwrap().push(Invocation {
            node: node.to_string(),
            args: args.to_vec(),
            resumed,
        });

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let scripted = self
            .script
            .lock()
            .unwrap()
            .get_mut(node)
            .and_then(VecDeque::pop_front);

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match scripted {
            None => Ok(default),
            Some(Scripted::Ok(value)) => Ok(value),
            Some(Scripted::Err(err)) => Err(err),
            Some(Scripted::Panic) => panic!("scripted panic in {node}"),
        }
    }
}

impl ChainAdapter for ScriptedAdapter {
    fn deploy_contract(&self, request: &DeployRequest) -> Result<Address, TransactionError> {
        let default = json!(format!("0x{}", request.node.local()));
        let value = self.answer(&request.node, &request.args, request.resumed, default)?;

        match value {
            Value::String(address) => Ok(Address(address)),
            other => Ok(Address(other.to_string())),
        }
    }

    fn call(&self, request: &CallRequest) -> Result<Value, TransactionError> {
        let default = json!(request.node.as_str());
        self.answer(&request.node, &request.args, request.resumed, default)
    }

    fn read(&self, request: &ReadRequest) -> Result<Value, TransactionError> {
        let default = json!(request.node.as_str());
        self.answer(&request.node, &request.args, false, default)
    }

    fn sequencing(&self) -> Sequencing {
        if self.serial {
            Sequencing::Serial
        } else {
            Sequencing::Concurrent
        }
    }
}
