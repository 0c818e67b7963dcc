#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use forge_kernel_contracts::namespace::OwnerId;
use forge_kernel_contracts::quota::QuotaDecision;
use forge_storage::store::ForgeStore;
use tracing::{debug, warn};

pub const DEFAULT_QUOTA_LIMIT: u64 = 1000;

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota exceeded for owner={owner_id}: {current_count}/{limit} requests used")]
    Exceeded {
        owner_id: OwnerId,
        current_count: u64,
        limit: u64,
    },
    #[error("quota store unavailable: {0}")]
    Store(String),
}

/// Per-owner admission counter. One check per billable request.
#[derive(Debug, Clone)]
pub struct QuotaGuard {
    store: Arc<Mutex<ForgeStore>>,
    limit: u64,
}

impl QuotaGuard {
    pub fn new(store: Arc<Mutex<ForgeStore>>, limit: u64) -> Self {
        Self { store, limit }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Admits and counts when under the limit; a denial leaves the count as is.
    pub fn check_and_admit(&self, owner_id: &OwnerId) -> Result<QuotaDecision, QuotaError> {
        let mut store = self
            .store
            .lock()
            .map_err(|_| QuotaError::Store("store lock poisoned".to_string()))?;
        let decision = store
            .admit_quota(owner_id, self.limit)
            .map_err(|err| QuotaError::Store(err.to_string()))?;
        match decision {
            QuotaDecision::Admitted { count } => {
                debug!(owner_id = %owner_id, count, limit = self.limit, "quota admitted");
            }
            QuotaDecision::Denied { current_count } => {
                warn!(owner_id = %owner_id, current_count, limit = self.limit, "quota denied");
            }
        }
        Ok(decision)
    }

    /// `check_and_admit` with denial surfaced as `QuotaError::Exceeded`.
    pub fn admit(&self, owner_id: &OwnerId) -> Result<u64, QuotaError> {
        match self.check_and_admit(owner_id)? {
            QuotaDecision::Admitted { count } => Ok(count),
            QuotaDecision::Denied { current_count } => Err(QuotaError::Exceeded {
                owner_id: owner_id.clone(),
                current_count,
                limit: self.limit,
            }),
        }
    }
}
