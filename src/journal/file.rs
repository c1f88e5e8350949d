use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::{ConcurrentDeploymentError, JournalError};
use crate::journal::{JournalEntry, JournalLog, JournalStore};

const JOURNAL_FILE: &str = "journal.jsonl";
const LOCK_FILE: &str = "journal.lock";

/// Journal store keeping one JSON Lines file per instance under a root
/// directory:
///
/// ```text
/// <root>/<instance>/journal.jsonl
/// <root>/<instance>/journal.lock
/// ```
///
/// An attempt holds an OS advisory lock on `journal.lock` for as long as it
/// owns the journal. The operating system drops the lock together with the
/// process, so an attempt killed midway never blocks the next one. The file
/// itself stays around and names the last holder.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: Utf8PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn journal_path(&self, instance: &str) -> Utf8PathBuf {
        self.root.join(instance).join(JOURNAL_FILE)
    }
}

impl JournalStore for FileStore {
    fn acquire(&self, instance: &str) -> Result<Box<dyn JournalLog>, JournalError> {
        let dir = self.root.join(instance);
        fs::create_dir_all(&dir)?;

        let lock = LockFile::acquire(dir.join(LOCK_FILE), instance)?;

        let path = dir.join(JOURNAL_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        Ok(Box::new(FileLog {
            instance: instance.to_string(),
            path,
            file,
            _lock: lock,
        }))
    }
}

struct FileLog {
    instance: String,
    path: Utf8PathBuf,
    file: File,
    _lock: LockFile,
}

impl JournalLog for FileLog {
    fn read_all(&mut self) -> Result<Vec<JournalEntry>, JournalError> {
        let text = fs::read_to_string(&self.path)?;
        let mut entries = Vec::new();
        let mut offset = 0;

        for (number, line) in text.split_inclusive('\n').enumerate() {
            let complete = line.ends_with('\n');
            let content = line.trim_end();

            if content.is_empty() {
                offset += line.len();
                continue;
            }

            match serde_json::from_str::<JournalEntry>(content) {
                Ok(entry) => {
                    if !complete {
                        self.file.write_all(b"\n")?;
                    }
                    entries.push(entry);
                }
                // A crash in the middle of an append leaves an unterminated
                // final line behind.
                Err(_) if !complete => {
                    tracing::warn!(
                        instance = %self.instance,
                        line = number + 1,
                        "Discarding incomplete trailing journal line"
                    );
                    self.file.set_len(offset as u64)?;
                    break;
                }
                Err(err) => {
                    return Err(JournalError::Corrupt {
                        instance: self.instance.clone(),
                        line: number + 1,
                        reason: err.to_string(),
                    });
                }
            }

            offset += line.len();
        }

        Ok(entries)
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;

        Ok(())
    }
}

/// Lock file held with an exclusive OS lock, released when the handle is
/// closed. It is never deleted, so every attempt locks the same file.
struct LockFile {
    _file: File,
}

impl LockFile {
    fn acquire(path: Utf8PathBuf, instance: &str) -> Result<Self, JournalError> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        match file.try_lock() {
            Ok(()) => {
                file.set_len(0)?;
                writeln!(file, "pid {}", std::process::id())?;
                Ok(Self { _file: file })
            }
            Err(TryLockError::WouldBlock) => {
                let holder = fs::read_to_string(&path)
                    .ok()
                    .map(|text| text.trim().to_string())
                    .filter(|text| !text.is_empty())
                    .unwrap_or_else(|| String::from("unknown holder"));

                Err(ConcurrentDeploymentError {
                    instance: instance.to_string(),
                    holder: format!("{holder}, lock file {path}"),
                }
                .into())
            }
            Err(TryLockError::Error(err)) => Err(err.into()),
        }
    }
}
