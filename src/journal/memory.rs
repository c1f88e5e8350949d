use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{ConcurrentDeploymentError, JournalError};
use crate::journal::{JournalEntry, JournalLog, JournalStore};

#[derive(Debug, Default)]
struct Shared {
    logs: HashMap<String, Vec<JournalEntry>>,
    locked: HashSet<String>,
}

/// Journal store living in memory, shared between clones. Handy for tests and
/// dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded for `instance`.
    pub fn entries(&self, instance: &str) -> Vec<JournalEntry> {
        lock(&self.shared)
            .logs
            .get(instance)
            .cloned()
            .unwrap_or_default()
    }
}

impl JournalStore for MemoryStore {
    fn acquire(&self, instance: &str) -> Result<Box<dyn JournalLog>, JournalError> {
        let mut shared = lock(&self.shared);

        if !shared.locked.insert(instance.to_string()) {
            return Err(ConcurrentDeploymentError {
                instance: instance.to_string(),
                holder: String::from("another attempt in this process"),
            }
            .into());
        }

        shared.logs.entry(instance.to_string()).or_default();

        Ok(Box::new(MemoryLog {
            instance: instance.to_string(),
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryLog {
    instance: String,
    shared: Arc<Mutex<Shared>>,
}

impl JournalLog for MemoryLog {
    fn read_all(&mut self) -> Result<Vec<JournalEntry>, JournalError> {
        Ok(lock(&self.shared)
            .logs
            .get(&self.instance)
            .cloned()
            .unwrap_or_default())
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        lock(&self.shared)
            .logs
            .entry(self.instance.clone())
            .or_default()
            .push(entry.clone());
        Ok(())
    }
}

impl Drop for MemoryLog {
    fn drop(&mut self) {
        lock(&self.shared).locked.remove(&self.instance);
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
