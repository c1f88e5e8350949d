//! The execution journal.
//!
//! An append-only log of what happened to every node of a deployment
//! instance. Each attempt writes `started` right before handing an action to
//! the chain adapter and `succeeded` or `failed` once the outcome is known.
//! Reading the log back on the next attempt tells the executor which nodes
//! can be skipped and which have to be tried again; a node left at `started`
//! was interrupted and is retried.
//!
//! Storage is pluggable through [`JournalStore`]. Acquiring a log grants
//! exclusive access to the instance until the log is dropped.

mod file;
mod memory;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use self::file::FileStore;
pub use self::memory::MemoryStore;
use crate::core::Value;
use crate::error::JournalError;
use crate::future::FutureId;

/// One line of the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the log, starting at zero.
    pub seq: u64,
    pub node: FutureId,
    #[serde(flatten)]
    pub status: EntryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EntryStatus {
    Started {
        fingerprint: String,
        #[serde(default)]
        resumed: bool,
    },
    Succeeded {
        result: Value,
    },
    Failed {
        error: String,
    },
}

/// Current status of a node according to the journal.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStatus {
    /// Nothing was ever recorded.
    Unresolved,
    /// Started, but the attempt ended before an outcome was recorded.
    Interrupted,
    Succeeded(Value),
    Failed(String),
}

/// Backend able to hand out exclusive access to per-instance logs.
pub trait JournalStore: Send + Sync {
    /// Locks the journal of `instance`, creating it if needed. Fails with
    /// [`JournalError::Concurrent`] while another attempt holds the lock.
    fn acquire(&self, instance: &str) -> Result<Box<dyn JournalLog>, JournalError>;
}

/// Exclusive handle on the log of one instance. Dropping it releases the lock.
pub trait JournalLog: Send {
    fn read_all(&mut self) -> Result<Vec<JournalEntry>, JournalError>;

    /// Durably appends one entry.
    fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError>;
}

#[derive(Debug, Clone, Default)]
struct Record {
    fingerprint: Option<String>,
    status: Option<EntryStatus>,
}

/// Opened journal of one deployment instance.
///
/// Lifecycle: [`Journal::open`] → [`record`](Journal::record) /
/// [`status_of`](Journal::status_of) → [`close`](Journal::close) (or drop).
pub struct Journal {
    instance: String,
    log: Box<dyn JournalLog>,
    records: HashMap<FutureId, Record>,
    next_seq: u64,
}

impl Journal {
    /// Locks and loads the journal of `instance`.
    pub fn open(store: &dyn JournalStore, instance: &str) -> Result<Self, JournalError> {
        if !is_instance_id(instance) {
            return Err(JournalError::InvalidInstance(instance.to_string()));
        }

        let mut log = store.acquire(instance)?;
        let entries = log.read_all()?;

        let mut journal = Self {
            instance: instance.to_string(),
            log,
            records: HashMap::new(),
            next_seq: 0,
        };

        for entry in entries {
            journal.apply(entry);
        }

        tracing::debug!(
            instance,
            entries = journal.next_seq,
            nodes = journal.records.len(),
            "Opened journal"
        );

        Ok(journal)
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Number of entries in the log.
    pub fn len(&self) -> u64 {
        self.next_seq
    }

    pub fn is_empty(&self) -> bool {
        self.next_seq == 0
    }

    /// Appends a status change for `node`. Entries of a node that already
    /// succeeded are final and can't be followed by anything.
    pub fn record(&mut self, node: &FutureId, status: EntryStatus) -> Result<(), JournalError> {
        if let NodeStatus::Succeeded(_) = self.status_of(node) {
            return Err(JournalError::AlreadySucceeded(node.clone()));
        }

        let entry = JournalEntry {
            seq: self.next_seq,
            node: node.clone(),
            status,
        };

        self.log.append(&entry)?;
        self.apply(entry);

        Ok(())
    }

    pub fn status_of(&self, node: &str) -> NodeStatus {
        match self.records.get(node).and_then(|record| record.status.as_ref()) {
            None => NodeStatus::Unresolved,
            Some(EntryStatus::Started { .. }) => NodeStatus::Interrupted,
            Some(EntryStatus::Succeeded { result }) => NodeStatus::Succeeded(result.clone()),
            Some(EntryStatus::Failed { error }) => NodeStatus::Failed(error.clone()),
        }
    }

    /// Fingerprint the node had when it was last started.
    pub fn fingerprint_of(&self, node: &str) -> Option<&str> {
        self.records
            .get(node)
            .and_then(|record| record.fingerprint.as_deref())
    }

    /// Every node mentioned in the log.
    pub fn nodes(&self) -> impl Iterator<Item = &FutureId> {
        self.records.keys()
    }

    /// Releases the instance lock.
    pub fn close(self) {
        tracing::debug!(instance = %self.instance, "Closed journal");
    }

    fn apply(&mut self, entry: JournalEntry) {
        self.next_seq = self.next_seq.max(entry.seq + 1);

        let record = self.records.entry(entry.node).or_default();

        if let Some(EntryStatus::Succeeded { .. }) = record.status {
            tracing::warn!(
                instance = %self.instance,
                seq = entry.seq,
                "Ignoring journal entry recorded after success"
            );
            return;
        }

        if let EntryStatus::Started { fingerprint, .. } = &entry.status {
            record.fingerprint = Some(fingerprint.clone());
        }

        record.status = Some(entry.status);
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("instance", &self.instance)
            .field("entries", &self.next_seq)
            .finish()
    }
}

/// Instance ids end up in file names, keep them boring.
fn is_instance_id(instance: &str) -> bool {
    !instance.is_empty()
        && !instance.starts_with('.')
        && instance
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn started(fingerprint: &str) -> EntryStatus {
        EntryStatus::Started {
            fingerprint: fingerprint.into(),
            resumed: false,
        }
    }

    #[test]
    fn test_entry_format() {
        let entry = JournalEntry {
            seq: 3,
            node: "M#A".into(),
            status: EntryStatus::Succeeded {
                result: json!("0xAAA"),
            },
        };

        let line = serde_json::to_string(&entry).unwrap();
        assert_eq!(
            line,
            r#"{"seq":3,"node":"M#A","status":"succeeded","result":"0xAAA"}"#
        );

        let back: JournalEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back, entry);

        let legacy: JournalEntry =
            serde_json::from_str(r#"{"seq":0,"node":"M#A","status":"started","fingerprint":"ff"}"#)
                .unwrap();
        assert_eq!(legacy.status, started("ff"));
    }

    #[test]
    fn test_status_transitions() {
        let store = MemoryStore::new();
        let mut journal = Journal::open(&store, "local").unwrap();
        let a = FutureId::from("M#A");

        assert_eq!(journal.status_of("M#A"), NodeStatus::Unresolved);

        journal.record(&a, started("f1")).unwrap();
        assert_eq!(journal.status_of("M#A"), NodeStatus::Interrupted);
        assert_eq!(journal.fingerprint_of("M#A"), Some("f1"));

        journal
            .record(&a, EntryStatus::Failed { error: "boom".into() })
            .unwrap();
        assert_eq!(journal.status_of("M#A"), NodeStatus::Failed("boom".into()));

        journal.record(&a, started("f1")).unwrap();
        journal
            .record(&a, EntryStatus::Succeeded { result: json!("0xAAA") })
            .unwrap();
        assert_eq!(
            journal.status_of("M#A"),
            NodeStatus::Succeeded(json!("0xAAA"))
        );
        assert_eq!(journal.len(), 4);
    }

    #[test]
    fn test_succeeded_is_final() {
        let store = MemoryStore::new();
        let mut journal = Journal::open(&store, "local").unwrap();
        let a = FutureId::from("M#A");

        journal.record(&a, started("f")).unwrap();
        journal
            .record(&a, EntryStatus::Succeeded { result: json!(1) })
            .unwrap();

        let err = journal.record(&a, started("f")).unwrap_err();
        assert!(matches!(err, JournalError::AlreadySucceeded(id) if id == a));
        assert_eq!(journal.len(), 2);
    }

    #[test]
    fn test_reopen_replays() {
        let store = MemoryStore::new();
        let a = FutureId::from("M#A");
        let b = FutureId::from("M#B");

        {
            let mut journal = Journal::open(&store, "local").unwrap();
            journal.record(&a, started("fa")).unwrap();
            journal
                .record(&a, EntryStatus::Succeeded { result: json!("0xAAA") })
                .unwrap();
            journal.record(&b, started("fb")).unwrap();
            journal.close();
        }

        let mut journal = Journal::open(&store, "local").unwrap();
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.status_of("M#A"), NodeStatus::Succeeded(json!("0xAAA")));
        assert_eq!(journal.status_of("M#B"), NodeStatus::Interrupted);

        journal
            .record(&b, EntryStatus::Failed { error: "x".into() })
            .unwrap();
        assert_eq!(store.entries("local").last().unwrap().seq, 3);
    }

    #[test]
    fn test_second_open_is_rejected() {
        let store = MemoryStore::new();
        let first = Journal::open(&store, "local").unwrap();

        let err = Journal::open(&store, "local").unwrap_err();
        assert!(matches!(err, JournalError::Concurrent(ref e) if e.instance == "local"));

        // Other instances are independent.
        Journal::open(&store, "other").unwrap();

        drop(first);
        Journal::open(&store, "local").unwrap();
    }

    #[test]
    fn test_instance_ids() {
        assert!(is_instance_id("chain-31337"));
        assert!(is_instance_id("mainnet_v2.1"));
        assert!(!is_instance_id(""));
        assert!(!is_instance_id(".."));
        assert!(!is_instance_id("a/b"));

        let store = MemoryStore::new();
        assert!(matches!(
            Journal::open(&store, "../etc"),
            Err(JournalError::InvalidInstance(_))
        ));
    }
}
