#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forge_engines::backend::{AuthError, BackendError, BuildBackend, ContextStore, IdentityProvider};
use forge_engines::context::BuildContextPreparer;
use forge_engines::deletion::ArtifactDeleter;
use forge_engines::deploy_script::{render_deploy_script, DeployScript};
use forge_engines::namespace::ArtifactNamespace;
use forge_engines::quota::{QuotaError, QuotaGuard, DEFAULT_QUOTA_LIMIT};
use forge_kernel_contracts::build::BuildJob;
use forge_kernel_contracts::deletion::DeletionReport;
use forge_kernel_contracts::deploy::DeployScriptRequest;
use forge_kernel_contracts::namespace::{JobId, NamespacePrefix, OwnerId};
use forge_kernel_contracts::ContractViolation;
use forge_os::submitter::{BuildSubmitter, BuildSubmitterConfig, SubmitError};
use forge_os::{DEFAULT_BUILD_DEADLINE_SECS, DEFAULT_IMAGE_CAP};
use forge_storage::store::ForgeStore;
use serde_json::Value;
use tracing::{debug, info, warn};

pub mod config;
pub mod http;

pub const DEFAULT_TEMPLATE_DIR: &str = "survey_template";
pub const DEFAULT_CONTEXT_BUCKET: &str = "forge-contexts";

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("invalid credential: {0}")]
    AuthInvalid(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("request quota exceeded: {current_count} of {limit} requests used")]
    QuotaExceeded { current_count: u64, limit: u64 },
    #[error("image limit reached: {count} of {cap} images, delete one to build another")]
    ImageCapExceeded { count: usize, cap: usize },
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdapterError {
    pub fn status_code(&self) -> u16 {
        match self {
            AdapterError::BadRequest(_) => 400,
            AdapterError::AuthInvalid(_) => 401,
            AdapterError::Forbidden(_) => 403,
            AdapterError::NotFound(_) => 404,
            AdapterError::QuotaExceeded { .. } | AdapterError::ImageCapExceeded { .. } => 429,
            AdapterError::Internal(_) => 500,
        }
    }

    /// Stable machine-readable name carried in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AdapterError::BadRequest(_) => "bad_request",
            AdapterError::AuthInvalid(_) => "auth_invalid",
            AdapterError::Forbidden(_) => "permission_denied",
            AdapterError::NotFound(_) => "not_found",
            AdapterError::QuotaExceeded { .. } => "quota_exceeded",
            AdapterError::ImageCapExceeded { .. } => "image_cap_exceeded",
            AdapterError::Internal(_) => "internal",
        }
    }
}

impl From<ContractViolation> for AdapterError {
    fn from(err: ContractViolation) -> Self {
        AdapterError::BadRequest(err.to_string())
    }
}

impl From<BackendError> for AdapterError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::PermissionDenied(_) => AdapterError::Forbidden(err.to_string()),
            BackendError::NotFound(_) => AdapterError::NotFound(err.to_string()),
            _ => AdapterError::Internal(err.to_string()),
        }
    }
}

impl From<AuthError> for AdapterError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Invalid(detail) => AdapterError::AuthInvalid(detail),
            AuthError::Unavailable(_) => AdapterError::Internal(err.to_string()),
        }
    }
}

impl From<QuotaError> for AdapterError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded {
                current_count,
                limit,
                ..
            } => AdapterError::QuotaExceeded {
                current_count,
                limit,
            },
            QuotaError::Store(detail) => AdapterError::Internal(detail),
        }
    }
}

impl From<SubmitError> for AdapterError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::ImageCapExceeded { count, cap } => {
                AdapterError::ImageCapExceeded { count, cap }
            }
            SubmitError::Backend(err) => err.into(),
            other => AdapterError::Internal(other.to_string()),
        }
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BuildRequest {
    /// Optional echo of the caller's id; must match the credential when sent.
    #[serde(default, alias = "user_id")]
    pub owner_id: Option<String>,
    pub title: String,
    pub schema: Value,
    #[serde(default = "empty_object")]
    pub ui_schema: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BuildAccepted {
    pub status: String,
    pub job_id: String,
    pub submission_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BuildStatusResponse {
    pub status: String,
    pub job_id: String,
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub submission_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ImageListRow {
    pub name: String,
    pub tag: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct ImageListResponse {
    pub images: Vec<ImageListRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub backend: String,
    pub status_rows: usize,
    pub quota_rows: usize,
    pub in_flight_builds: usize,
    pub journal: Option<String>,
}

/// Knobs shared by every backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub quota_limit: u64,
    pub image_cap: usize,
    pub build_deadline: Duration,
    pub template_dir: PathBuf,
    pub context_bucket: String,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            quota_limit: DEFAULT_QUOTA_LIMIT,
            image_cap: DEFAULT_IMAGE_CAP,
            build_deadline: Duration::from_secs(DEFAULT_BUILD_DEADLINE_SECS),
            template_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
            context_bucket: DEFAULT_CONTEXT_BUCKET.to_string(),
        }
    }
}

/// Endpoint semantics, independent of the HTTP framing. Every collaborator
/// is built once and handed in; nothing is process-global.
#[derive(Clone)]
pub struct AdapterRuntime {
    store: Arc<Mutex<ForgeStore>>,
    identity: Arc<dyn IdentityProvider>,
    quota: QuotaGuard,
    namespace: ArtifactNamespace,
    deleter: ArtifactDeleter,
    submitter: BuildSubmitter,
}

impl AdapterRuntime {
    pub fn new(
        store: Arc<Mutex<ForgeStore>>,
        identity: Arc<dyn IdentityProvider>,
        backend: Arc<dyn BuildBackend>,
        context_store: Arc<dyn ContextStore>,
        settings: RuntimeSettings,
    ) -> Self {
        let namespace = ArtifactNamespace::new(backend);
        let preparer = BuildContextPreparer::new(
            settings.template_dir,
            settings.context_bucket,
            context_store,
        );
        let submitter = BuildSubmitter::new(
            store.clone(),
            namespace.clone(),
            preparer,
            BuildSubmitterConfig {
                image_cap: settings.image_cap,
                deadline: settings.build_deadline,
            },
        );
        Self {
            quota: QuotaGuard::new(store.clone(), settings.quota_limit),
            deleter: ArtifactDeleter::new(namespace.clone()),
            store,
            identity,
            namespace,
            submitter,
        }
    }

    pub fn submitter(&self) -> &BuildSubmitter {
        &self.submitter
    }

    pub fn store(&self) -> &Arc<Mutex<ForgeStore>> {
        &self.store
    }

    pub fn image_repository(&self) -> &str {
        self.namespace.backend().image_repository()
    }

    /// Resolves the bearer credential, then spends one quota unit for the
    /// owner. Blocking when the identity provider is remote.
    pub fn authenticate(&self, bearer_token: Option<&str>) -> Result<OwnerId, AdapterError> {
        let token = bearer_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AdapterError::AuthInvalid("missing bearer credential".to_string()))?;
        let owner_id = self.identity.resolve_owner(token)?;
        let count = self.quota.admit(&owner_id)?;
        debug!(owner_id = %owner_id, quota_count = count, "request authenticated");
        Ok(owner_id)
    }

    pub async fn submit_build(
        &self,
        owner_id: &OwnerId,
        job_id: &str,
        request: BuildRequest,
    ) -> Result<BuildAccepted, AdapterError> {
        let job_id = parse_job_id(job_id)?;
        if let Some(claimed) = request.owner_id.as_deref() {
            if claimed != owner_id.as_str() {
                warn!(owner_id = %owner_id, claimed, "build request names another owner");
                return Err(AdapterError::Forbidden(
                    "owner_id does not match the credential".to_string(),
                ));
            }
        }
        let job = BuildJob::v1(
            owner_id.clone(),
            job_id,
            request.title,
            request.schema,
            request.ui_schema,
        )?;
        let ticket = self.submitter.submit(job).await?;
        Ok(BuildAccepted {
            status: ticket.status.as_str().to_string(),
            job_id: ticket.job_id.to_string(),
            submission_seq: ticket.submission_seq,
        })
    }

    pub fn build_status(
        &self,
        owner_id: &OwnerId,
        job_id: &str,
    ) -> Result<BuildStatusResponse, AdapterError> {
        let job_id = parse_job_id(job_id)?;
        let store = self
            .store
            .lock()
            .map_err(|_| AdapterError::Internal("store lock poisoned".to_string()))?;
        let record = store
            .status_row(owner_id, &job_id)
            .ok_or_else(|| AdapterError::NotFound(format!("no build for job {job_id}")))?;
        Ok(BuildStatusResponse {
            status: record.status.as_str().to_string(),
            job_id: record.job_id.to_string(),
            image: record.image_ref.clone(),
            error: record.error.clone(),
            submission_seq: record.submission_seq,
        })
    }

    /// One row per (image, tag). Untagged versions are not listed.
    pub fn list_images(
        &self,
        owner_id: &OwnerId,
        job_id: &str,
    ) -> Result<ImageListResponse, AdapterError> {
        let job_id = parse_job_id(job_id)?;
        let images = self
            .namespace
            .list_by_prefix(&NamespacePrefix::for_job(owner_id, &job_id))?;
        let rows = images
            .iter()
            .flat_map(|image| {
                let updated_at = image.upload_time_label();
                image.tags.iter().map(move |tag| ImageListRow {
                    name: image.package.clone(),
                    tag: tag.clone(),
                    updated_at: updated_at.clone(),
                })
            })
            .collect();
        Ok(ImageListResponse { images: rows })
    }

    pub fn delete_images(
        &self,
        owner_id: &OwnerId,
        job_id: &str,
        tag: Option<&str>,
    ) -> Result<DeletionReport, AdapterError> {
        let job_id = parse_job_id(job_id)?;
        let tag = tag.map(str::trim).filter(|tag| !tag.is_empty());
        let prefix = NamespacePrefix::for_job(owner_id, &job_id);
        let report = self.deleter.delete_by_prefix(&prefix, tag)?;
        info!(
            owner_id = %owner_id,
            job_id = %job_id,
            status = report.status_label(),
            "delete request handled"
        );
        Ok(report)
    }

    pub fn deploy_script(&self, request: &DeployScriptRequest) -> Result<DeployScript, AdapterError> {
        Ok(render_deploy_script(self.image_repository(), request)?)
    }

    pub fn health_report(&self) -> Result<AdapterHealthResponse, AdapterError> {
        let store = self
            .store
            .lock()
            .map_err(|_| AdapterError::Internal("store lock poisoned".to_string()))?;
        Ok(AdapterHealthResponse {
            status: "ok".to_string(),
            backend: self.namespace.backend().name().to_string(),
            status_rows: store.status_rows().len(),
            quota_rows: store.quota_rows().len(),
            in_flight_builds: self.submitter.in_flight_count(),
            journal: store.journal_path().map(|path| path.display().to_string()),
        })
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, AdapterError> {
    JobId::new(raw.trim()).map_err(|err| AdapterError::BadRequest(format!("job_id: {err}")))
}
