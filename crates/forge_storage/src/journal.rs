#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use forge_kernel_contracts::quota::QuotaRecord;
use forge_kernel_contracts::status::StatusRecord;
use forge_kernel_contracts::SchemaVersion;
use tracing::warn;

use crate::store::StorageError;

pub const JOURNAL_SCHEMA_VERSION: SchemaVersion = SchemaVersion(1);

/// One row-level write, replayed verbatim on open.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEvent {
    StatusWritten { record: StatusRecord },
    QuotaWritten { record: QuotaRecord },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct JournalEntry {
    schema_version: SchemaVersion,
    event: JournalEvent,
}

impl JournalEntry {
    fn v1(event: JournalEvent) -> Self {
        Self {
            schema_version: JOURNAL_SCHEMA_VERSION,
            event,
        }
    }
}

/// Append-only JSONL file, one entry per line, fsynced per append.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let journal = Self { path: path.into() };
        journal.ensure_ready()?;
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_ready(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    self.error(format!(
                        "failed to create store directory '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        if !self.path.exists() {
            File::create(&self.path)
                .map_err(|err| self.error(format!("failed to create journal: {err}")))?;
        }
        self.repair_torn_tail()
    }

    /// An unterminated last line is a torn append. It is dropped when it does
    /// not parse and terminated when it does, so the next append starts on a
    /// fresh line.
    fn repair_torn_tail(&self) -> Result<(), StorageError> {
        let bytes = self.read_bytes()?;
        if bytes.is_empty() || bytes.ends_with(b"\n") {
            return Ok(());
        }
        let tail_start = bytes
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let tail = &bytes[tail_start..];
        if serde_json::from_slice::<JournalEntry>(tail).is_ok() {
            let mut file = self.open_for_append()?;
            file.write_all(b"\n")
                .and_then(|_| file.sync_data())
                .map_err(|err| self.error(format!("failed terminating last entry: {err}")))?;
            return Ok(());
        }
        warn!(
            path = %self.path.display(),
            dropped_bytes = tail.len(),
            "dropping torn journal tail"
        );
        let file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .map_err(|err| self.error(format!("failed opening for repair: {err}")))?;
        file.set_len(tail_start as u64)
            .and_then(|_| file.sync_data())
            .map_err(|err| self.error(format!("failed truncating torn tail: {err}")))
    }

    /// Every line must parse; corruption anywhere is a hard error.
    pub fn read_all(&self) -> Result<Vec<JournalEvent>, StorageError> {
        let bytes = self.read_bytes()?;
        let mut events = Vec::new();
        for (line_no, line) in bytes.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let entry: JournalEntry = serde_json::from_slice(line).map_err(|err| {
                self.error(format!("failed parsing line {}: {err}", line_no + 1))
            })?;
            if entry.schema_version != JOURNAL_SCHEMA_VERSION {
                return Err(self.error(format!(
                    "unsupported schema_version={} at line {}",
                    entry.schema_version.0,
                    line_no + 1
                )));
            }
            events.push(entry.event);
        }
        Ok(events)
    }

    pub fn append(&self, event: &JournalEvent) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(&JournalEntry::v1(event.clone()))
            .map_err(|err| self.error(format!("failed to encode entry: {err}")))?;
        line.push(b'\n');
        let mut file = self.open_for_append()?;
        file.write_all(&line)
            .and_then(|_| file.sync_data())
            .map_err(|err| self.error(format!("failed writing entry: {err}")))?;
        Ok(())
    }

    fn open_for_append(&self) -> Result<File, StorageError> {
        OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|err| self.error(format!("failed opening for append: {err}")))
    }

    fn read_bytes(&self) -> Result<Vec<u8>, StorageError> {
        fs::read(&self.path).map_err(|err| self.error(format!("failed to read journal: {err}")))
    }

    fn error(&self, detail: String) -> StorageError {
        StorageError::Journal {
            path: self.path.display().to_string(),
            detail,
        }
    }
}
