#![forbid(unsafe_code)]

use forge_kernel_contracts::namespace::{JobId, OwnerId};
use forge_kernel_contracts::quota::{QuotaDecision, QuotaRecord};
use forge_kernel_contracts::status::{StatusRecord, TerminalStatus};
use forge_kernel_contracts::MonotonicTimeNs;

use crate::store::{ForgeStore, StorageError};

/// Typed repository interface for build status rows keyed by (owner, job).
pub trait StatusStoreRepo {
    fn begin_submission_row(
        &mut self,
        owner_id: &OwnerId,
        job_id: &JobId,
        now: MonotonicTimeNs,
    ) -> Result<StatusRecord, StorageError>;

    fn complete_submission_row(
        &mut self,
        owner_id: &OwnerId,
        job_id: &JobId,
        submission_seq: u64,
        terminal: TerminalStatus,
        now: MonotonicTimeNs,
    ) -> Result<StatusRecord, StorageError>;

    fn status_row(&self, owner_id: &OwnerId, job_id: &JobId) -> Option<&StatusRecord>;
    fn status_rows_for_owner(&self, owner_id: &OwnerId) -> Vec<&StatusRecord>;
}

/// Typed repository interface for per-owner admitted-request counters.
pub trait QuotaRepo {
    fn admit_quota_row(
        &mut self,
        owner_id: &OwnerId,
        limit: u64,
    ) -> Result<QuotaDecision, StorageError>;
    fn quota_row(&self, owner_id: &OwnerId) -> Option<&QuotaRecord>;
}

impl StatusStoreRepo for ForgeStore {
    fn begin_submission_row(
        &mut self,
        owner_id: &OwnerId,
        job_id: &JobId,
        now: MonotonicTimeNs,
    ) -> Result<StatusRecord, StorageError> {
        self.begin_submission(owner_id, job_id, now)
    }

    fn complete_submission_row(
        &mut self,
        owner_id: &OwnerId,
        job_id: &JobId,
        submission_seq: u64,
        terminal: TerminalStatus,
        now: MonotonicTimeNs,
    ) -> Result<StatusRecord, StorageError> {
        self.complete_submission(owner_id, job_id, submission_seq, terminal, now)
    }

    fn status_row(&self, owner_id: &OwnerId, job_id: &JobId) -> Option<&StatusRecord> {
        ForgeStore::status_row(self, owner_id, job_id)
    }

    fn status_rows_for_owner(&self, owner_id: &OwnerId) -> Vec<&StatusRecord> {
        ForgeStore::status_rows_for_owner(self, owner_id)
    }
}

impl QuotaRepo for ForgeStore {
    fn admit_quota_row(
        &mut self,
        owner_id: &OwnerId,
        limit: u64,
    ) -> Result<QuotaDecision, StorageError> {
        self.admit_quota(owner_id, limit)
    }

    fn quota_row(&self, owner_id: &OwnerId) -> Option<&QuotaRecord> {
        ForgeStore::quota_row(self, owner_id)
    }
}
