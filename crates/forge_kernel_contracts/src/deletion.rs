#![forbid(unsafe_code)]

pub const ALREADY_ABSENT_SUFFIX: &str = " (already absent)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionStage {
    DeleteTag,
    DeleteVersion,
}

impl DeletionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionStage::DeleteTag => "delete_tag",
            DeletionStage::DeleteVersion => "delete_version",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeletionErrorEntry {
    pub stage: DeletionStage,
    pub resource: String,
    pub message: String,
}

/// Accumulator for one deletion call; order follows processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionOutcome {
    pub deleted: Vec<String>,
    pub errors: Vec<DeletionErrorEntry>,
}

impl DeletionOutcome {
    pub fn record_deleted(&mut self, identifier: String) {
        self.deleted.push(identifier);
    }

    pub fn record_error(&mut self, stage: DeletionStage, resource: String, message: String) {
        self.errors.push(DeletionErrorEntry {
            stage,
            resource,
            message,
        });
    }

    pub fn into_report(self) -> DeletionReport {
        if self.errors.is_empty() {
            DeletionReport::Success {
                deleted: self.deleted,
            }
        } else {
            DeletionReport::PartialFailure {
                deleted: self.deleted,
                errors: self.errors,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeletionReport {
    NoImagesFound {
        prefix: String,
    },
    Success {
        deleted: Vec<String>,
    },
    PartialFailure {
        deleted: Vec<String>,
        errors: Vec<DeletionErrorEntry>,
    },
}

impl DeletionReport {
    pub fn status_label(&self) -> &'static str {
        match self {
            DeletionReport::NoImagesFound { .. } => "no_images_found",
            DeletionReport::Success { .. } => "success",
            DeletionReport::PartialFailure { .. } => "partial_failure",
        }
    }
}
