use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::core::Value;

/// Key of the table holding parameters visible to every module.
pub const GLOBAL: &str = "$global";

/// Values for module parameters, supplied from outside the module.
///
/// The on-disk format is a JSON object keyed by module id, with the special
/// `$global` table consulted when a module has no value of its own:
///
/// ```json
/// {
///   "TokenModule": { "supply": 1000000 },
///   "$global": { "owner": "0x1234" }
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    tables: BTreeMap<String, BTreeMap<String, Value>>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn from_json_file(path: impl AsRef<Utf8Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;

        Self::from_json_str(&text)
            .map_err(|err| anyhow::anyhow!("Couldn't parse parameters file '{path}':\n{err}"))
    }

    /// Sets a parameter for one module.
    pub fn set(&mut self, module: &str, name: &str, value: impl Into<Value>) -> &mut Self {
        self.tables
            .entry(module.to_string())
            .or_default()
            .insert(name.to_string(), value.into());
        self
    }

    /// Sets a parameter for every module that doesn't override it.
    pub fn set_global(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.set(GLOBAL, name, value)
    }

    /// Looks a parameter up, module table first and `$global` second.
    pub fn get(&self, module: &str, name: &str) -> Option<&Value> {
        self.tables
            .get(module)
            .and_then(|table| table.get(name))
            .or_else(|| self.tables.get(GLOBAL).and_then(|table| table.get(name)))
    }

    /// Entries from `other` overwrite entries in `self` if keys conflict.
    pub fn merge(&mut self, other: Parameters) {
        for (module, table) in other.tables {
            self.tables.entry(module).or_default().extend(table);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(BTreeMap::is_empty)
    }
}
