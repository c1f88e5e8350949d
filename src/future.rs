//! Futures: placeholders for values that only exist once the deployment runs.
//!
//! A [`Future<T>`] is a lightweight token returned by every declaration on the
//! [`ModuleBuilder`](crate::ModuleBuilder). It carries no value, only the
//! position of the declaring node in the graph and its stable [`FutureId`].
//! Passing a future into a later declaration is how dependencies are expressed:
//! the graph builder scans every [`Arg`] for future references and adds an
//! edge from the producing node to the consuming one.
//!
//! ## Phantom types
//!
//! The graph itself is untyped, every result is a JSON [`Value`]. The type
//! parameter only exists at compile time, so that a method call can require
//! `Future<Address>` as its target while a read result is a `Future<Value>`.

use std::borrow::Borrow;
use std::fmt::{Debug, Display, Formatter};
use std::marker::PhantomData;
use std::ops::Deref;

use petgraph::graph::NodeIndex;
use serde::{Deserialize, Serialize};

use crate::core::{Address, ArcStr, Value};

/// Stable, deterministic identifier of a future and of the node producing it.
///
/// Ids are derived from the module id and the local name of the declaration,
/// e.g. `TitanSentaraModule#TitanSentara` or `Vault#Token.mint`, so building
/// an unchanged module twice yields the same ids. The execution journal keys
/// its entries by these ids.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FutureId(ArcStr);

impl FutureId {
    pub(crate) fn new(module: &str, local: &str) -> Self {
        Self(format!("{module}#{local}").into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The id of the module which declared this future.
    pub fn module(&self) -> &str {
        self.0.split_once('#').map_or(&self.0, |(module, _)| module)
    }

    /// The part of the id after the module separator.
    pub fn local(&self) -> &str {
        self.0.split_once('#').map_or("", |(_, local)| local)
    }
}

impl From<String> for FutureId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<&str> for FutureId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<FutureId> for String {
    fn from(value: FutureId) -> Self {
        value.0.to_string()
    }
}

impl PartialEq<str> for FutureId {
    fn eq(&self, other: &str) -> bool {
        *self.0 == *other
    }
}

impl PartialEq<&str> for FutureId {
    fn eq(&self, other: &&str) -> bool {
        *self.0 == **other
    }
}

impl Deref for FutureId {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for FutureId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Display for FutureId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Debug for FutureId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FutureId({})", self.0)
    }
}

/// What kind of action produces a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureKind {
    /// A contract deployed by the module.
    Contract,
    /// An already deployed contract bound by address.
    ContractAt,
    /// A state changing method call.
    Call,
    /// A read-only method call.
    Read,
    /// A module parameter.
    Parameter,
}

impl FutureKind {
    pub(crate) fn describe(self) -> &'static str {
        match self {
            FutureKind::Contract => "a contract deployment",
            FutureKind::ContractAt => "a contract binding",
            FutureKind::Call => "a call",
            FutureKind::Read => "a read",
            FutureKind::Parameter => "a parameter",
        }
    }

    pub(crate) fn is_contract(self) -> bool {
        matches!(self, FutureKind::Contract | FutureKind::ContractAt)
    }
}

/// Untyped reference to a declared future.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FutureRef {
    pub(crate) index: NodeIndex,
    pub(crate) scope: u64,
    pub(crate) id: FutureId,
    pub(crate) kind: FutureKind,
}

impl FutureRef {
    pub fn id(&self) -> &FutureId {
        &self.id
    }

    pub fn kind(&self) -> FutureKind {
        self.kind
    }

    /// Returns the underlying `NodeIndex` of the producing node.
    pub fn index(&self) -> NodeIndex {
        self.index
    }
}

impl Debug for FutureRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "FutureRef({}, {:?})", self.id, self.kind)
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for crate::core::Address {}
    impl Sealed for crate::core::Value {}
}

/// Types a [`Future`] can resolve to.
pub trait Resolvable: sealed::Sealed {
    /// Human readable name used in error messages.
    const NAME: &'static str;

    fn accepts(kind: FutureKind) -> bool;
}

impl Resolvable for Address {
    const NAME: &'static str = "a contract";

    fn accepts(kind: FutureKind) -> bool {
        kind.is_contract()
    }
}

impl Resolvable for Value {
    const NAME: &'static str = "a value";

    fn accepts(_: FutureKind) -> bool {
        true
    }
}

/// A typed reference to the eventual result of a declared action.
///
/// # Diamond dependencies
///
/// Futures can be cloned and passed to any number of later declarations. The
/// producing action still runs exactly once and every consumer receives the
/// same resolved value.
pub struct Future<T> {
    pub(crate) inner: FutureRef,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Future<T> {
    pub(crate) fn new(inner: FutureRef) -> Self {
        Self {
            inner,
            _phantom: PhantomData,
        }
    }

    pub fn id(&self) -> &FutureId {
        &self.inner.id
    }

    pub fn kind(&self) -> FutureKind {
        self.inner.kind
    }

    /// Drops the phantom type.
    pub fn untyped(&self) -> &FutureRef {
        &self.inner
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self::new(self.inner.clone())
    }
}

impl<T> PartialEq for Future<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl<T> Eq for Future<T> {}

impl<T> Debug for Future<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Future({})", self.inner.id)
    }
}

/// Argument of a declared action: either a literal known at declaration time,
/// a future resolved by the executor before dispatch, or a list mixing both.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(Value),
    Future(FutureRef),
    List(Vec<Arg>),
}

impl Arg {
    /// Appends every future referenced by this argument, in order.
    pub(crate) fn collect_futures<'a>(&'a self, out: &mut Vec<&'a FutureRef>) {
        match self {
            Arg::Literal(_) => {}
            Arg::Future(future) => out.push(future),
            Arg::List(items) => items.iter().for_each(|item| item.collect_futures(out)),
        }
    }

    /// Substitutes every future through `lookup`, returning `None` when any
    /// of them is unresolved.
    pub(crate) fn resolve(&self, lookup: &impl Fn(&FutureRef) -> Option<Value>) -> Option<Value> {
        match self {
            Arg::Literal(value) => Some(value.clone()),
            Arg::Future(future) => lookup(future),
            Arg::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
        }
    }
}

impl<T> From<Future<T>> for Arg {
    fn from(value: Future<T>) -> Self {
        Arg::Future(value.inner)
    }
}

impl<T> From<&Future<T>> for Arg {
    fn from(value: &Future<T>) -> Self {
        Arg::Future(value.inner.clone())
    }
}

impl From<FutureRef> for Arg {
    fn from(value: FutureRef) -> Self {
        Arg::Future(value)
    }
}

impl From<Value> for Arg {
    fn from(value: Value) -> Self {
        Arg::Literal(value)
    }
}

impl From<Address> for Arg {
    fn from(value: Address) -> Self {
        Arg::Literal(value.into())
    }
}

impl From<Vec<Arg>> for Arg {
    fn from(value: Vec<Arg>) -> Self {
        Arg::List(value)
    }
}

macro_rules! impl_literal_arg {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Arg {
                fn from(value: $ty) -> Self {
                    Arg::Literal(Value::from(value))
                }
            }
        )*
    };
}

impl_literal_arg!(&str, String, bool, u8, u16, u32, u64, i8, i16, i32, i64);
