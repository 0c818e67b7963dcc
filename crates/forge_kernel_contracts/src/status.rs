#![forbid(unsafe_code)]

use crate::common::validate_text;
use crate::namespace::{JobId, OwnerId};
use crate::{ContractViolation, MonotonicTimeNs, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Built,
    Failed,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Built => "built",
            BuildStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, BuildStatus::Pending)
    }
}

/// Terminal result written exactly once per submission.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TerminalStatus {
    Built { image_ref: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusRecord {
    pub owner_id: OwnerId,
    pub job_id: JobId,
    pub status: BuildStatus,
    pub image_ref: Option<String>,
    pub error: Option<String>,
    pub submission_seq: u64,
    pub updated_at_ns: MonotonicTimeNs,
}

impl StatusRecord {
    pub fn pending(
        owner_id: OwnerId,
        job_id: JobId,
        submission_seq: u64,
        now: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            owner_id,
            job_id,
            status: BuildStatus::Pending,
            image_ref: None,
            error: None,
            submission_seq,
            updated_at_ns: now,
        };
        record.validate()?;
        Ok(record)
    }

    /// Copy of this record moved to `terminal`. Callers check monotonicity.
    pub fn with_terminal(
        &self,
        terminal: TerminalStatus,
        now: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let (status, image_ref, error) = match terminal {
            TerminalStatus::Built { image_ref } => (BuildStatus::Built, Some(image_ref), None),
            TerminalStatus::Failed { error } => (BuildStatus::Failed, None, Some(error)),
        };
        let record = Self {
            owner_id: self.owner_id.clone(),
            job_id: self.job_id.clone(),
            status,
            image_ref,
            error,
            submission_seq: self.submission_seq,
            updated_at_ns: now,
        };
        record.validate()?;
        Ok(record)
    }
}

impl Validate for StatusRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.owner_id.validate()?;
        self.job_id.validate()?;
        if self.submission_seq == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "status_record.submission_seq",
                reason: "must be > 0",
            });
        }
        match self.status {
            BuildStatus::Pending => {
                if self.image_ref.is_some() || self.error.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "status_record.status",
                        reason: "pending must carry neither image_ref nor error",
                    });
                }
            }
            BuildStatus::Built => {
                let Some(image_ref) = self.image_ref.as_deref() else {
                    return Err(ContractViolation::InvalidValue {
                        field: "status_record.image_ref",
                        reason: "built must carry image_ref",
                    });
                };
                validate_text("status_record.image_ref", image_ref, 512)?;
                if self.error.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "status_record.error",
                        reason: "built must not carry error",
                    });
                }
            }
            BuildStatus::Failed => {
                if self.error.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "status_record.error",
                        reason: "failed must carry error",
                    });
                }
                if self.image_ref.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "status_record.image_ref",
                        reason: "failed must not carry image_ref",
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending() -> StatusRecord {
        StatusRecord::pending(
            OwnerId::new("owner-1").unwrap(),
            JobId::new("job-1").unwrap(),
            1,
            MonotonicTimeNs(10),
        )
        .unwrap()
    }

    #[test]
    fn at_status_01_pending_has_no_outcome_fields() {
        let record = pending();
        assert_eq!(record.status, BuildStatus::Pending);
        assert!(record.image_ref.is_none());
        assert!(record.error.is_none());
    }

    #[test]
    fn at_status_02_terminal_copies_keep_submission_seq() {
        let built = pending()
            .with_terminal(
                TerminalStatus::Built {
                    image_ref: "repo/user_owner-1_q_job-1:latest".to_string(),
                },
                MonotonicTimeNs(20),
            )
            .unwrap();
        assert_eq!(built.status, BuildStatus::Built);
        assert_eq!(built.submission_seq, 1);
        assert_eq!(built.updated_at_ns, MonotonicTimeNs(20));

        let failed = pending()
            .with_terminal(
                TerminalStatus::Failed {
                    error: "boom".to_string(),
                },
                MonotonicTimeNs(20),
            )
            .unwrap();
        assert_eq!(failed.status, BuildStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn at_status_03_inconsistent_records_fail_validation() {
        let mut record = pending();
        record.status = BuildStatus::Built;
        assert!(record.validate().is_err());
        record.image_ref = Some("img".to_string());
        record.error = Some("x".to_string());
        assert!(record.validate().is_err());
        record.submission_seq = 0;
        record.error = None;
        assert!(record.validate().is_err());
    }

    #[test]
    fn at_status_04_wire_labels_are_lowercase() {
        assert_eq!(
            serde_json::to_string(&BuildStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(BuildStatus::Built.as_str(), "built");
        assert!(BuildStatus::Failed.is_terminal());
        assert!(!BuildStatus::Pending.is_terminal());
    }
}
