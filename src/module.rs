use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::{Address, ArcStr, Hash32, Value, is_identifier};
use crate::error::{BuildError, CyclicDependencyError, DeclarationError};
use crate::future::{Arg, Future, FutureId, FutureKind, FutureRef, Resolvable};
use crate::graph::{Action, DeploymentGraph, Node};
use crate::parameters::Parameters;

type ModuleFn = dyn Fn(&mut ModuleBuilder<'_>) -> Result<(), BuildError> + Send + Sync;

/// Source of unique build scopes, used to reject futures leaking from one
/// build into another.
static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// A named, composable unit of declared deployment actions.
///
/// A module is just its id and a builder function. Nothing happens when a
/// module is created; the function runs once every time the module is built
/// into a [`DeploymentGraph`], and it must declare the same actions every
/// time it runs.
///
/// # Example
///
/// ```rust
/// use kidou::{Parameters, build_module};
///
/// let module = build_module("TitanSentaraModule", |m| {
///     let titan = m.contract("TitanSentara").deploy()?;
///     m.export("TitanSentara", &titan)?;
///     Ok(())
/// });
///
/// let graph = module.build(&Parameters::new()).unwrap();
/// assert_eq!(graph.len(), 1);
/// ```
#[derive(Clone)]
pub struct Module {
    id: ArcStr,
    func: Arc<ModuleFn>,
}

/// Creates a new module with the given id and builder function.
pub fn build_module<F>(id: &str, func: F) -> Module
where
    F: Fn(&mut ModuleBuilder<'_>) -> Result<(), BuildError> + Send + Sync + 'static,
{
    Module {
        id: id.into(),
        func: Arc::new(func),
    }
}

impl Module {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs the builder function and produces the validated graph.
    ///
    /// Declaration errors and dependency cycles are reported here, before
    /// anything could be executed.
    pub fn build(&self, parameters: &Parameters) -> Result<DeploymentGraph, BuildError> {
        let mut state = BuildState::new(parameters.clone());
        let exports = state.run(self);

        // Also catches errors the builder function swallowed.
        if let Some(err) = state.failure.take() {
            return Err(err);
        }

        let exports = exports?;
        state.link_forward_references()?;

        let graph = DeploymentGraph::assemble(self.id.clone(), state.graph, state.ids, exports)?;

        tracing::debug!(
            module = %self.id,
            nodes = graph.len(),
            "Built deployment graph"
        );

        Ok(graph)
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Module({})", self.id)
    }
}

/// Futures exported by a module, by export name.
#[derive(Debug, Clone)]
pub struct Exports {
    module: ArcStr,
    entries: BTreeMap<String, FutureRef>,
}

impl Exports {
    pub(crate) fn new(module: ArcStr) -> Self {
        Self {
            module,
            entries: BTreeMap::new(),
        }
    }

    pub fn module_id(&self) -> &str {
        &self.module
    }

    pub fn get(&self, name: &str) -> Option<&FutureRef> {
        self.entries.get(name)
    }

    /// Returns an exported contract future.
    pub fn contract(&self, name: &str) -> Result<Future<Address>, DeclarationError> {
        self.typed(name)
    }

    /// Returns any exported future as a value future.
    pub fn value(&self, name: &str) -> Result<Future<Value>, DeclarationError> {
        self.typed(name)
    }

    pub fn typed<T: Resolvable>(&self, name: &str) -> Result<Future<T>, DeclarationError> {
        let future = self
            .entries
            .get(name)
            .ok_or_else(|| DeclarationError::UnknownExport {
                module: self.module.to_string(),
                name: name.to_string(),
            })?;

        if !T::accepts(future.kind) {
            return Err(DeclarationError::ExportKind {
                module: self.module.to_string(),
                name: name.to_string(),
                expected: T::NAME,
                actual: future.kind.describe(),
            });
        }

        Ok(Future::new(future.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FutureRef)> {
        self.entries.iter().map(|(name, future)| (name.as_str(), future))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mutable state shared by the root module and every included module during
/// a single build.
pub(crate) struct BuildState {
    scope: u64,
    parameters: Parameters,
    graph: Graph<Node, ()>,
    ids: HashMap<FutureId, NodeIndex>,
    /// Dependencies by id, linked once every module has been built.
    forward: Vec<(NodeIndex, FutureId)>,
    modules: HashMap<ArcStr, (Arc<ModuleFn>, Exports)>,
    stack: Vec<ArcStr>,
    /// First error raised by any declaration of this build.
    failure: Option<BuildError>,
}

impl BuildState {
    fn new(parameters: Parameters) -> Self {
        Self {
            scope: NEXT_SCOPE.fetch_add(1, Ordering::Relaxed),
            parameters,
            graph: Graph::new(),
            ids: HashMap::new(),
            forward: Vec::new(),
            modules: HashMap::new(),
            stack: Vec::new(),
            failure: None,
        }
    }

    /// Remembers `err` as the build failure unless an earlier one exists.
    fn reject<E>(&mut self, err: E) -> E
    where
        E: Clone + Into<BuildError>,
    {
        if self.failure.is_none() {
            self.failure = Some(err.clone().into());
        }
        err
    }

    fn run(&mut self, module: &Module) -> Result<Exports, BuildError> {
        self.run_module(module).map_err(|err| self.reject(err))
    }

    fn run_module(&mut self, module: &Module) -> Result<Exports, BuildError> {
        if let Some(position) = self.stack.iter().position(|id| *id == module.id) {
            let mut members: Vec<String> =
                self.stack[position..].iter().map(|id| id.to_string()).collect();
            members.push(module.id.to_string());
            return Err(CyclicDependencyError { members }.into());
        }

        // Including the same module twice yields the same futures.
        if let Some((func, exports)) = self.modules.get(&module.id) {
            return match Arc::ptr_eq(func, &module.func) {
                true => Ok(exports.clone()),
                false => Err(DeclarationError::DuplicateModule(module.id.to_string()).into()),
            };
        }

        if !is_identifier(&module.id) {
            return Err(DeclarationError::InvalidIdentifier(module.id.to_string()).into());
        }

        self.stack.push(module.id.clone());

        let mut builder = ModuleBuilder {
            state: self,
            module: module.id.clone(),
            exports: Exports::new(module.id.clone()),
        };
        let result = (module.func)(&mut builder);
        let exports = builder.exports;

        self.stack.pop();
        result?;

        self.modules
            .insert(module.id.clone(), (module.func.clone(), exports.clone()));

        Ok(exports)
    }

    fn check(&self, future: &FutureRef) -> Result<(), DeclarationError> {
        let known = future.scope == self.scope
            && self
                .graph
                .node_weight(future.index)
                .is_some_and(|node| node.id == future.id);

        match known {
            true => Ok(()),
            false => Err(DeclarationError::DanglingFuture(future.id.clone())),
        }
    }

    fn link_forward_references(&mut self) -> Result<(), DeclarationError> {
        for (index, missing) in std::mem::take(&mut self.forward) {
            let Some(&dependency) = self.ids.get(&missing) else {
                return Err(DeclarationError::UnknownDependency {
                    node: self.graph[index].id.clone(),
                    missing,
                });
            };

            if !self.graph[index].dependencies.contains(&dependency) {
                self.graph[index].dependencies.push(dependency);
                self.graph.add_edge(dependency, index, ());
            }
        }

        Ok(())
    }
}

/// The declarative API available inside a module's builder function.
///
/// Every declaration records one node and immediately returns a [`Future`]
/// bound to it. No I/O happens here.
pub struct ModuleBuilder<'a> {
    state: &'a mut BuildState,
    module: ArcStr,
    exports: Exports,
}

impl<'a> ModuleBuilder<'a> {
    /// Id of the module being built.
    pub fn module_id(&self) -> &str {
        &self.module
    }

    /// Declares a contract deployment.
    pub fn contract(&mut self, name: impl Into<String>) -> ContractDef<'_, 'a> {
        ContractDef {
            builder: self,
            contract: name.into(),
            args: Vec::new(),
            options: Options::default(),
        }
    }

    /// Binds a contract that is already deployed at `address`. The address
    /// may itself be a future, e.g. the result of a read.
    pub fn contract_at(
        &mut self,
        name: impl Into<String>,
        address: impl Into<Arg>,
    ) -> ContractAtDef<'_, 'a> {
        ContractAtDef {
            builder: self,
            contract: name.into(),
            address: address.into(),
            options: Options::default(),
        }
    }

    /// Declares a state changing method call on a contract.
    pub fn call(&mut self, target: &Future<Address>, method: impl Into<String>) -> CallDef<'_, 'a> {
        CallDef {
            builder: self,
            target: target.inner.clone(),
            method: method.into(),
            args: Vec::new(),
            options: Options::default(),
        }
    }

    /// Declares a read-only method call on a contract.
    pub fn read(&mut self, target: &Future<Address>, method: impl Into<String>) -> ReadDef<'_, 'a> {
        ReadDef {
            builder: self,
            target: target.inner.clone(),
            method: method.into(),
            args: Vec::new(),
            options: Options::default(),
        }
    }

    /// Declares a required module parameter.
    pub fn parameter(&mut self, name: &str) -> Result<Future<Value>, DeclarationError> {
        self.declare_parameter(name, None)
    }

    /// Declares a module parameter with a default value.
    pub fn parameter_or(
        &mut self,
        name: &str,
        default: impl Into<Value>,
    ) -> Result<Future<Value>, DeclarationError> {
        self.declare_parameter(name, Some(default.into()))
    }

    /// Builds a sub-module into this graph and returns its exports.
    /// A module included several times is built once.
    pub fn include(&mut self, module: &Module) -> Result<Exports, BuildError> {
        self.state.run(module)
    }

    /// Makes a future visible to whoever includes or deploys this module.
    pub fn export<T>(&mut self, name: &str, future: &Future<T>) -> Result<(), DeclarationError> {
        self.add_export(name, &future.inner)
            .map_err(|err| self.state.reject(err))
    }

    fn add_export(&mut self, name: &str, future: &FutureRef) -> Result<(), DeclarationError> {
        if !is_identifier(name) {
            return Err(DeclarationError::InvalidIdentifier(name.to_string()));
        }

        self.state.check(future)?;

        if self.exports.entries.contains_key(name) {
            return Err(DeclarationError::DuplicateExport {
                module: self.module.to_string(),
                name: name.to_string(),
            });
        }

        self.exports
            .entries
            .insert(name.to_string(), future.clone());

        Ok(())
    }

    fn declare_parameter(
        &mut self,
        name: &str,
        default: Option<Value>,
    ) -> Result<Future<Value>, DeclarationError> {
        self.add_parameter(name, default)
            .map_err(|err| self.state.reject(err))
    }

    fn add_parameter(
        &mut self,
        name: &str,
        default: Option<Value>,
    ) -> Result<Future<Value>, DeclarationError> {
        if !is_identifier(name) {
            return Err(DeclarationError::InvalidIdentifier(name.to_string()));
        }

        let local = format!("${name}");
        let id = FutureId::new(&self.module, &local);

        if let Some(&index) = self.state.ids.get(&id) {
            return Ok(Future::new(FutureRef {
                index,
                scope: self.state.scope,
                id,
                kind: FutureKind::Parameter,
            }));
        }

        let value = self
            .state
            .parameters
            .get(&self.module, name)
            .cloned()
            .or(default)
            .ok_or_else(|| DeclarationError::MissingParameter {
                module: self.module.to_string(),
                name: name.to_string(),
            })?;

        let action = Action::Parameter {
            name: name.to_string(),
            value,
        };

        self.add_node(local, FutureKind::Parameter, action, Options::default())
            .map(Future::new)
    }

    fn declare(
        &mut self,
        local: String,
        kind: FutureKind,
        action: Action,
        options: Options,
    ) -> Result<FutureRef, DeclarationError> {
        self.add_node(local, kind, action, options)
            .map_err(|err| self.state.reject(err))
    }

    fn add_node(
        &mut self,
        local: String,
        kind: FutureKind,
        action: Action,
        options: Options,
    ) -> Result<FutureRef, DeclarationError> {
        let local = match options.id {
            Some(id) if is_identifier(&id) => id,
            Some(id) => return Err(DeclarationError::InvalidIdentifier(id)),
            None => local,
        };

        let id = FutureId::new(&self.module, &local);
        if self.state.ids.contains_key(&id) {
            return Err(DeclarationError::DuplicateId(id));
        }

        let mut dependencies = Vec::new();
        for future in action.futures().into_iter().chain(&options.after) {
            self.state.check(future)?;
            if !dependencies.contains(&future.index) {
                dependencies.push(future.index);
            }
        }

        let index = self.state.graph.add_node(Node {
            id: id.clone(),
            kind,
            action,
            dependencies: dependencies.clone(),
            fingerprint: Hash32::default(),
        });

        for dependency in dependencies {
            self.state.graph.add_edge(dependency, index, ());
        }

        for missing in options.after_ids {
            self.state.forward.push((index, missing));
        }

        self.state.ids.insert(id.clone(), index);

        tracing::trace!(future = %id, "Declared");

        Ok(FutureRef {
            index,
            scope: self.state.scope,
            id,
            kind,
        })
    }
}

/// Options shared by every declaration.
#[derive(Default)]
struct Options {
    id: Option<String>,
    after: Vec<FutureRef>,
    after_ids: Vec<FutureId>,
}

/// Contract deployment being declared.
pub struct ContractDef<'b, 'a> {
    builder: &'b mut ModuleBuilder<'a>,
    contract: String,
    args: Vec<Arg>,
    options: Options,
}

impl ContractDef<'_, '_> {
    /// Appends a constructor argument.
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several constructor arguments.
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn deploy(self) -> Result<Future<Address>, DeclarationError> {
        if !is_identifier(&self.contract) {
            let err = DeclarationError::InvalidIdentifier(self.contract);
            return Err(self.builder.state.reject(err));
        }

        let local = self.contract.clone();
        let action = Action::Deploy {
            contract: self.contract,
            args: self.args,
        };

        self.builder
            .declare(local, FutureKind::Contract, action, self.options)
            .map(Future::new)
    }
}

/// Binding of an existing contract being declared.
pub struct ContractAtDef<'b, 'a> {
    builder: &'b mut ModuleBuilder<'a>,
    contract: String,
    address: Arg,
    options: Options,
}

impl ContractAtDef<'_, '_> {
    pub fn bind(self) -> Result<Future<Address>, DeclarationError> {
        if !is_identifier(&self.contract) {
            let err = DeclarationError::InvalidIdentifier(self.contract);
            return Err(self.builder.state.reject(err));
        }

        let local = self.contract.clone();
        let action = Action::ContractAt {
            contract: self.contract,
            address: self.address,
        };

        self.builder
            .declare(local, FutureKind::ContractAt, action, self.options)
            .map(Future::new)
    }
}

/// Method call being declared.
pub struct CallDef<'b, 'a> {
    builder: &'b mut ModuleBuilder<'a>,
    target: FutureRef,
    method: String,
    args: Vec<Arg>,
    options: Options,
}

impl CallDef<'_, '_> {
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<Arg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn send(self) -> Result<Future<Value>, DeclarationError> {
        if !is_method(&self.method) {
            let err = DeclarationError::InvalidIdentifier(self.method);
            return Err(self.builder.state.reject(err));
        }

        let local = format!("{}.{}", self.target.id.local(), self.method);
        let action = Action::Call {
            target: self.target,
            method: self.method,
            args: self.args,
        };

        self.builder
            .declare(local, FutureKind::Call, action, self.options)
            .map(Future::new)
    }
}

/// Read-only call being declared.
pub struct ReadDef<'b, 'a> {
    builder: &'b mut ModuleBuilder<'a>,
    target: FutureRef,
    method: String,
    args: Vec<Arg>,
    options: Options,
}

impl ReadDef<'_, '_> {
    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn fetch(self) -> Result<Future<Value>, DeclarationError> {
        if !is_method(&self.method) {
            let err = DeclarationError::InvalidIdentifier(self.method);
            return Err(self.builder.state.reject(err));
        }

        let local = format!("{}.{}", self.target.id.local(), self.method);
        let action = Action::Read {
            target: self.target,
            method: self.method,
            args: self.args,
        };

        self.builder
            .declare(local, FutureKind::Read, action, self.options)
            .map(Future::new)
    }
}

macro_rules! impl_options {
    ($($def:ident),*) => {
        $(
            impl $def<'_, '_> {
                /// Overrides the local part of the future id, needed when the
                /// same action is declared twice in one module.
                pub fn id(mut self, id: impl Into<String>) -> Self {
                    self.options.id = Some(id.into());
                    self
                }

                /// Orders this action after another one without passing its
                /// result.
                pub fn after<T>(mut self, future: &Future<T>) -> Self {
                    self.options.after.push(future.inner.clone());
                    self
                }

                /// Orders this action after a future known only by id. The id
                /// is looked up once the whole module has been built.
                pub fn after_id(mut self, id: impl Into<FutureId>) -> Self {
                    self.options.after_ids.push(id.into());
                    self
                }
            }
        )*
    };
}

impl_options!(ContractDef, ContractAtDef, CallDef, ReadDef);

/// Method names may carry a signature to pick an overload,
/// e.g. `transfer(address,uint256)`.
fn is_method(name: &str) -> bool {
    match name.split_once('(') {
        None => is_identifier(name),
        Some((base, rest)) => {
            is_identifier(base)
                && rest.ends_with(')')
                && rest
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, ',' | '[' | ']' | '(' | ')'))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;

    fn empty() -> Parameters {
        Parameters::new()
    }

    fn token_module() -> Module {
        build_module("TokenModule", |m| {
            let supply = m.parameter_or("supply", 1_000)?;
            let token = m.contract("Token").arg("TKN").arg(&supply).deploy()?;
            m.export("Token", &token)?;
            Ok(())
        })
    }

    #[test]
    fn test_titan_sentara() {
        let module = build_module("TitanSentaraModule", |m| {
            let titan = m.contract("TitanSentara").deploy()?;
            m.export("TitanSentara", &titan)?;
            Ok(())
        });

        let graph = module.build(&empty()).unwrap();

        assert_eq!(graph.module_id(), "TitanSentaraModule");
        assert_eq!(graph.len(), 1);
        assert!(graph.edges().is_empty());

        let node = graph.node("TitanSentaraModule#TitanSentara").unwrap();
        assert_eq!(node.kind(), FutureKind::Contract);
        assert_eq!(
            node.action(),
            &Action::Deploy {
                contract: "TitanSentara".into(),
                args: vec![]
            }
        );

        let export = graph.exports().contract("TitanSentara").unwrap();
        assert_eq!(export.id().as_str(), "TitanSentaraModule#TitanSentara");
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        let module = build_module("Market", |m| {
            let token = m.include(&token_module())?.contract("Token")?;
            let fee = m.parameter_or("fee", 30)?;
            let market = m.contract("Market").arg(&token).arg(&fee).deploy()?;
            let symbol = m.read(&token, "symbol").fetch()?;
            m.call(&market, "list").arg(&symbol).send()?;
            m.call(&token, "approve").arg(&market).arg(u64::MAX).send()?;
            Ok(())
        });

        let a = module.build(&empty()).unwrap();
        let b = module.build(&empty()).unwrap();

        let ids = |g: &DeploymentGraph| -> Vec<String> {
            g.nodes().map(|n| n.id().to_string()).collect()
        };
        let prints = |g: &DeploymentGraph| -> Vec<String> {
            g.nodes().map(|n| n.fingerprint()).collect()
        };

        assert_eq!(ids(&a), ids(&b));
        assert_eq!(a.edges(), b.edges());
        assert_eq!(prints(&a), prints(&b));
        assert_eq!(
            ids(&a),
            [
                "TokenModule#$supply",
                "TokenModule#Token",
                "Market#$fee",
                "Market#Market",
                "Market#Token.symbol",
                "Market#Market.list",
                "Market#Token.approve",
            ]
        );
    }

    #[test]
    fn test_duplicate_id() {
        let module = build_module("M", |m| {
            m.contract("Token").deploy()?;
            m.contract("Token").deploy()?;
            Ok(())
        });

        assert_eq!(
            module.build(&empty()).unwrap_err(),
            BuildError::Declaration(DeclarationError::DuplicateId("M#Token".into()))
        );
    }

    #[test]
    fn test_swallowed_errors_still_fail_the_build() {
        let module = build_module("M", |m| {
            let _ = m.parameter("owner");
            m.contract("A").deploy()?;
            let _ = m.contract("A").deploy();
            Ok(())
        });

        assert_eq!(
            module.build(&empty()).unwrap_err(),
            BuildError::Declaration(DeclarationError::MissingParameter {
                module: "M".into(),
                name: "owner".into()
            })
        );

        let inner = build_module("Inner", |m| {
            let _ = m.contract("Token").id("not valid").deploy();
            Ok(())
        });
        let outer = build_module("Outer", move |m| {
            let _ = m.include(&inner);
            m.contract("Vault").deploy()?;
            Ok(())
        });

        assert_eq!(
            outer.build(&empty()).unwrap_err(),
            BuildError::Declaration(DeclarationError::InvalidIdentifier("not valid".into()))
        );
    }

    #[test]
    fn test_explicit_id_avoids_collision() {
        let module = build_module("M", |m| {
            let a = m.contract("Token").deploy()?;
            let b = m.contract("Token").id("Token2").deploy()?;
            m.call(&a, "mint").arg(1).send()?;
            m.call(&a, "mint").arg(2).id("mint_again").send()?;
            assert_eq!(b.id().as_str(), "M#Token2");
            Ok(())
        });

        let graph = module.build(&empty()).unwrap();
        assert!(graph.node("M#Token.mint").is_some());
        assert!(graph.node("M#mint_again").is_some());
    }

    #[test]
    fn test_future_from_another_build() {
        let leaked: Arc<Mutex<Option<Future<Address>>>> = Arc::default();

        let source = {
            let leaked = leaked.clone();
            build_module("Source", move |m| {
                let token = m.contract("Token").deploy()?;
                *leaked.lock().unwrap() = Some(token);
                Ok(())
            })
        };
        source.build(&empty()).unwrap();

        let sink = {
            let leaked = leaked.clone();
            build_module("Sink", move |m| {
                let token = leaked.lock().unwrap().clone().unwrap();
                m.contract("Vault").arg(&token).deploy()?;
                Ok(())
            })
        };

        assert_eq!(
            sink.build(&empty()).unwrap_err(),
            BuildError::Declaration(DeclarationError::DanglingFuture("Source#Token".into()))
        );
    }

    #[test]
    fn test_missing_parameter() {
        let module = build_module("M", |m| {
            m.parameter("owner")?;
            Ok(())
        });

        assert_eq!(
            module.build(&empty()).unwrap_err(),
            BuildError::Declaration(DeclarationError::MissingParameter {
                module: "M".into(),
                name: "owner".into()
            })
        );

        let mut params = Parameters::new();
        params.set_global("owner", "0xOWNER");
        let graph = module.build(&params).unwrap();

        assert_eq!(
            graph.node("M#$owner").unwrap().action(),
            &Action::Parameter {
                name: "owner".into(),
                value: json!("0xOWNER")
            }
        );
    }

    #[test]
    fn test_parameter_precedence() {
        let mut params = Parameters::new();
        params.set("TokenModule", "supply", 5).set_global("supply", 7);

        let graph = token_module().build(&params).unwrap();
        let supply = graph.node("TokenModule#$supply").unwrap();
        let Action::Parameter { value, .. } = supply.action() else {
            panic!("not a parameter");
        };
        assert_eq!(value, &json!(5));

        let graph = token_module().build(&empty()).unwrap();
        let supply = graph.node("TokenModule#$supply").unwrap();
        let Action::Parameter { value, .. } = supply.action() else {
            panic!("not a parameter");
        };
        assert_eq!(value, &json!(1_000));
    }

    #[test]
    fn test_repeated_parameter_is_shared() {
        let module = build_module("M", |m| {
            let a = m.parameter_or("x", 1)?;
            let b = m.parameter_or("x", 1)?;
            assert_eq!(a, b);
            Ok(())
        });

        assert_eq!(module.build(&empty()).unwrap().len(), 1);
    }

    #[test]
    fn test_include_twice_builds_once() {
        let token = token_module();

        let module = build_module("App", move |m| {
            let first = m.include(&token)?.contract("Token")?;
            let second = m.include(&token)?.contract("Token")?;
            assert_eq!(first, second);
            m.contract("Vault").arg(&first).deploy()?;
            Ok(())
        });

        let graph = module.build(&empty()).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(
            graph
                .dependencies_of("App#Vault")
                .unwrap()
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>(),
            ["TokenModule#Token"]
        );
    }

    #[test]
    fn test_two_modules_same_id() {
        let module = build_module("App", |m| {
            m.include(&token_module())?;
            m.include(&token_module())?;
            Ok(())
        });

        assert_eq!(
            module.build(&empty()).unwrap_err(),
            BuildError::Declaration(DeclarationError::DuplicateModule("TokenModule".into()))
        );
    }

    fn ping() -> Module {
        build_module("Ping", |m| {
            m.include(&pong())?;
            Ok(())
        })
    }

    fn pong() -> Module {
        build_module("Pong", |m| {
            m.include(&ping())?;
            Ok(())
        })
    }

    #[test]
    fn test_module_cycle() {
        let Err(BuildError::Cycle(err)) = ping().build(&empty()) else {
            panic!("expected a module cycle");
        };

        assert_eq!(err.members, ["Ping", "Pong", "Ping"]);
    }

    #[test]
    fn test_export_errors() {
        let module = build_module("M", |m| {
            let token = m.contract("Token").deploy()?;
            m.export("Token", &token)?;
            m.export("Token", &token)?;
            Ok(())
        });

        assert_eq!(
            module.build(&empty()).unwrap_err(),
            BuildError::Declaration(DeclarationError::DuplicateExport {
                module: "M".into(),
                name: "Token".into()
            })
        );

        let module = build_module("M", |m| {
            let exports = m.include(&token_module())?;
            exports.value("Token")?;
            exports.contract("Missing")?;
            Ok(())
        });

        assert_eq!(
            module.build(&empty()).unwrap_err(),
            BuildError::Declaration(DeclarationError::UnknownExport {
                module: "TokenModule".into(),
                name: "Missing".into()
            })
        );
    }

    #[test]
    fn test_export_kind_mismatch() {
        let inner = build_module("Inner", |m| {
            let x = m.parameter_or("x", 1)?;
            m.export("x", &x)?;
            Ok(())
        });

        let module = build_module("Outer", move |m| {
            m.include(&inner)?.contract("x")?;
            Ok(())
        });

        assert!(matches!(
            module.build(&empty()),
            Err(BuildError::Declaration(DeclarationError::ExportKind { .. }))
        ));
    }

    #[test]
    fn test_unknown_forward_reference() {
        let module = build_module("M", |m| {
            m.contract("A").after_id("M#Nope").deploy()?;
            Ok(())
        });

        assert_eq!(
            module.build(&empty()).unwrap_err(),
            BuildError::Declaration(DeclarationError::UnknownDependency {
                node: "M#A".into(),
                missing: "M#Nope".into()
            })
        );
    }

    #[test]
    fn test_invalid_identifiers() {
        let bad_contract = build_module("M", |m| {
            m.contract("Not A Name").deploy()?;
            Ok(())
        });
        let bad_module = build_module("M#1", |_| Ok(()));
        let bad_id = build_module("M", |m| {
            m.contract("A").id("a.b").deploy()?;
            Ok(())
        });

        for module in [bad_contract, bad_module, bad_id] {
            assert!(matches!(
                module.build(&empty()),
                Err(BuildError::Declaration(DeclarationError::InvalidIdentifier(_)))
            ));
        }
    }

    #[test]
    fn test_contract_at_from_read() {
        let module = build_module("M", |m| {
            let registry = m.contract("Registry").deploy()?;
            let lookup = m.read(&registry, "lookup").arg("oracle").fetch()?;
            let oracle = m.contract_at("Oracle", &lookup).bind()?;
            m.call(&oracle, "poke").send()?;
            Ok(())
        });

        let graph = module.build(&empty()).unwrap();
        assert_eq!(
            graph
                .dependencies_of("M#Oracle")
                .unwrap()
                .iter()
                .map(|id| id.as_str())
                .collect::<Vec<_>>(),
            ["M#Registry.lookup"]
        );
        assert_eq!(graph.node("M#Oracle").unwrap().kind(), FutureKind::ContractAt);
    }

    #[test]
    fn test_method_signatures() {
        assert!(is_method("transfer"));
        assert!(is_method("transfer(address,uint256)"));
        assert!(is_method("batch(uint256[])"));
        assert!(!is_method("transfer(address"));
        assert!(!is_method("a b"));
        assert!(!is_method("(x)"));
    }
}
