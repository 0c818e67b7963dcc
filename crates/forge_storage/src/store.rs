#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use forge_kernel_contracts::namespace::{JobId, OwnerId};
use forge_kernel_contracts::quota::{QuotaDecision, QuotaRecord};
use forge_kernel_contracts::status::{BuildStatus, StatusRecord, TerminalStatus};
use forge_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};

use tracing::warn;

use crate::journal::{Journal, JournalEvent};

/// Terminal error written for submissions whose task died with the process.
pub const INTERRUPTED_BY_RESTART: &str = "build interrupted by restart";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no status record for owner={owner_id} job={job_id}")]
    NotFound { owner_id: OwnerId, job_id: JobId },
    #[error(
        "stale submission for owner={owner_id} job={job_id}: seq {attempted_seq} was replaced by seq {current_seq}"
    )]
    StaleSubmission {
        owner_id: OwnerId,
        job_id: JobId,
        attempted_seq: u64,
        current_seq: u64,
    },
    #[error(
        "invalid status transition for owner={owner_id} job={job_id}: {} -> {}",
        .from.as_str(),
        .to.as_str()
    )]
    InvalidTransition {
        owner_id: OwnerId,
        job_id: JobId,
        from: BuildStatus,
        to: BuildStatus,
    },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
    #[error("store journal '{path}': {detail}")]
    Journal { path: String, detail: String },
}

/// Status and quota tables. Writes go to the journal (when one is attached)
/// before they are applied in memory; terminal status writes are the one
/// exception, see `complete_submission`.
#[derive(Debug, Clone)]
pub struct ForgeStore {
    status_rows: BTreeMap<(OwnerId, JobId), StatusRecord>,
    quota_rows: BTreeMap<OwnerId, QuotaRecord>,
    journal: Option<Journal>,
}

impl Default for ForgeStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl ForgeStore {
    pub fn new_in_memory() -> Self {
        Self {
            status_rows: BTreeMap::new(),
            quota_rows: BTreeMap::new(),
            journal: None,
        }
    }

    /// Replays `path` (created if missing) and keeps appending to it.
    /// Replayed `pending` rows have no task left to finish them, so they are
    /// completed as failed at `now`.
    pub fn open_with_journal(
        path: impl Into<PathBuf>,
        now: MonotonicTimeNs,
    ) -> Result<Self, StorageError> {
        let journal = Journal::open(path)?;
        let mut store = Self::new_in_memory();
        for event in journal.read_all()? {
            store.apply(event)?;
        }
        store.journal = Some(journal);
        store.fail_interrupted_submissions(now)?;
        Ok(store)
    }

    fn fail_interrupted_submissions(&mut self, now: MonotonicTimeNs) -> Result<(), StorageError> {
        let orphans: Vec<(OwnerId, JobId, u64)> = self
            .status_rows
            .values()
            .filter(|row| row.status == BuildStatus::Pending)
            .map(|row| (row.owner_id.clone(), row.job_id.clone(), row.submission_seq))
            .collect();
        for (owner_id, job_id, seq) in orphans {
            warn!(
                owner_id = %owner_id,
                job_id = %job_id,
                submission_seq = seq,
                "failing build left pending by a previous run"
            );
            self.complete_submission(
                &owner_id,
                &job_id,
                seq,
                TerminalStatus::Failed {
                    error: INTERRUPTED_BY_RESTART.to_string(),
                },
                now,
            )?;
        }
        Ok(())
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.journal.as_ref().map(Journal::path)
    }

    /// Starts a new submission for (owner, job): the record becomes `pending`
    /// with a sequence one past the previous submission's.
    pub fn begin_submission(
        &mut self,
        owner_id: &OwnerId,
        job_id: &JobId,
        now: MonotonicTimeNs,
    ) -> Result<StatusRecord, StorageError> {
        let key = (owner_id.clone(), job_id.clone());
        let next_seq = self
            .status_rows
            .get(&key)
            .map(|row| row.submission_seq.saturating_add(1))
            .unwrap_or(1);
        let record = StatusRecord::pending(owner_id.clone(), job_id.clone(), next_seq, now)?;
        self.write(JournalEvent::StatusWritten {
            record: record.clone(),
        })?;
        Ok(record)
    }

    /// Writes the single terminal state of submission `seq`. The state is
    /// applied in memory even when the journal append fails; that failure is
    /// still returned as `StorageError::Journal`.
    pub fn complete_submission(
        &mut self,
        owner_id: &OwnerId,
        job_id: &JobId,
        seq: u64,
        terminal: TerminalStatus,
        now: MonotonicTimeNs,
    ) -> Result<StatusRecord, StorageError> {
        let key = (owner_id.clone(), job_id.clone());
        let Some(current) = self.status_rows.get(&key) else {
            return Err(StorageError::NotFound {
                owner_id: owner_id.clone(),
                job_id: job_id.clone(),
            });
        };
        if current.submission_seq != seq {
            return Err(StorageError::StaleSubmission {
                owner_id: owner_id.clone(),
                job_id: job_id.clone(),
                attempted_seq: seq,
                current_seq: current.submission_seq,
            });
        }
        let next = current.with_terminal(terminal, now)?;
        if current.status.is_terminal() {
            return Err(StorageError::InvalidTransition {
                owner_id: owner_id.clone(),
                job_id: job_id.clone(),
                from: current.status,
                to: next.status,
            });
        }
        let event = JournalEvent::StatusWritten {
            record: next.clone(),
        };
        let journaled = self.append_to_journal(&event);
        self.apply(event)?;
        journaled.map(|()| next)
    }

    pub fn status_row(&self, owner_id: &OwnerId, job_id: &JobId) -> Option<&StatusRecord> {
        self.status_rows.get(&(owner_id.clone(), job_id.clone()))
    }

    pub fn status_rows(&self) -> &BTreeMap<(OwnerId, JobId), StatusRecord> {
        &self.status_rows
    }

    pub fn status_rows_for_owner(&self, owner_id: &OwnerId) -> Vec<&StatusRecord> {
        self.status_rows
            .values()
            .filter(|row| &row.owner_id == owner_id)
            .collect()
    }

    /// Admits when `count < limit` and increments by one; a denial writes nothing.
    pub fn admit_quota(
        &mut self,
        owner_id: &OwnerId,
        limit: u64,
    ) -> Result<QuotaDecision, StorageError> {
        let current_count = self.quota_count(owner_id);
        if current_count >= limit {
            return Ok(QuotaDecision::Denied { current_count });
        }
        let record = QuotaRecord {
            owner_id: owner_id.clone(),
            count: current_count + 1,
        };
        self.write(JournalEvent::QuotaWritten {
            record: record.clone(),
        })?;
        Ok(QuotaDecision::Admitted {
            count: record.count,
        })
    }

    pub fn quota_row(&self, owner_id: &OwnerId) -> Option<&QuotaRecord> {
        self.quota_rows.get(owner_id)
    }

    pub fn quota_count(&self, owner_id: &OwnerId) -> u64 {
        self.quota_rows
            .get(owner_id)
            .map(|row| row.count)
            .unwrap_or(0)
    }

    pub fn quota_rows(&self) -> &BTreeMap<OwnerId, QuotaRecord> {
        &self.quota_rows
    }

    fn write(&mut self, event: JournalEvent) -> Result<(), StorageError> {
        self.append_to_journal(&event)?;
        self.apply(event)
    }

    fn append_to_journal(&self, event: &JournalEvent) -> Result<(), StorageError> {
        match self.journal.as_ref() {
            Some(journal) => journal.append(event),
            None => Ok(()),
        }
    }

    fn apply(&mut self, event: JournalEvent) -> Result<(), StorageError> {
        match event {
            JournalEvent::StatusWritten { record } => {
                record.validate()?;
                self.status_rows
                    .insert((record.owner_id.clone(), record.job_id.clone()), record);
            }
            JournalEvent::QuotaWritten { record } => {
                record.owner_id.validate()?;
                self.quota_rows.insert(record.owner_id.clone(), record);
            }
        }
        Ok(())
    }
}
