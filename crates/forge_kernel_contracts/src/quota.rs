#![forbid(unsafe_code)]

use crate::namespace::OwnerId;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QuotaRecord {
    pub owner_id: OwnerId,
    pub count: u64,
}

impl QuotaRecord {
    pub fn empty(owner_id: OwnerId) -> Self {
        Self { owner_id, count: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    /// Count after the admitted increment.
    Admitted { count: u64 },
    /// Nothing was written.
    Denied { current_count: u64 },
}

impl QuotaDecision {
    pub fn is_admitted(self) -> bool {
        matches!(self, QuotaDecision::Admitted { .. })
    }
}
