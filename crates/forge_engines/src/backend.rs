#![forbid(unsafe_code)]

//! Capability seam between the orchestrator and a concrete build/registry
//! provider. Implementations are chosen by configuration; nothing above this
//! module branches on which provider is live.

use std::path::Path;

use forge_kernel_contracts::build::{BuildOutcome, BuildSpec};
use forge_kernel_contracts::namespace::OwnerId;
use forge_kernel_contracts::registry::{ImageRef, TagRef, VersionRef};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("backend protocol error: {0}")]
    Protocol(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::NotFound(_) => "not_found",
            BackendError::PermissionDenied(_) => "permission_denied",
            BackendError::FailedPrecondition(_) => "failed_precondition",
            BackendError::Unavailable(_) => "unavailable",
            BackendError::Protocol(_) => "protocol",
        }
    }
}

/// Blocking build + registry provider.
pub trait BuildBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// `projects/<p>/locations/<l>/repositories/<r>` style parent of tag and
    /// version resource names.
    fn repository_parent(&self) -> &str;

    /// Pull/push prefix placed in front of `user_<owner>_q_<job>:latest`.
    fn image_repository(&self) -> &str;

    /// Whether `submit` expects `BuildSpec::source` to point at an uploaded archive.
    fn requires_staged_context(&self) -> bool;

    /// Full contents of the repository scope.
    fn list_images(&self) -> Result<Vec<ImageRef>, BackendError>;

    fn delete_tag(&self, tag: &TagRef) -> Result<(), BackendError>;

    /// Fails with `FailedPrecondition` while a tag still points at the version.
    fn delete_version(&self, version: &VersionRef) -> Result<(), BackendError>;

    /// Runs the build to a terminal result. `Err` is reserved for failures to
    /// talk to the provider; a build that ran and failed is `Ok(Failed)`.
    fn submit(&self, spec: &BuildSpec) -> Result<BuildOutcome, BackendError>;
}

/// Blob storage the build provider pulls staged contexts from.
pub trait ContextStore: Send + Sync {
    fn upload(&self, bucket: &str, object: &str, archive: &Path) -> Result<(), BackendError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Resolves a bearer credential to the owner it belongs to.
pub trait IdentityProvider: Send + Sync {
    fn resolve_owner(&self, bearer_token: &str) -> Result<OwnerId, AuthError>;
}
