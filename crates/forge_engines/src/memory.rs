#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forge_kernel_contracts::build::{BuildOutcome, BuildSpec};
use forge_kernel_contracts::namespace::DEFAULT_IMAGE_TAG;
use forge_kernel_contracts::registry::{package_from_image_uri, ImageRef, TagRef, VersionRef};
use sha2::{Digest, Sha256};

use crate::backend::{BackendError, BuildBackend, ContextStore};

pub const MEMORY_REPOSITORY_PARENT: &str =
    "projects/local/locations/local/repositories/survey-forge";
pub const MEMORY_IMAGE_REPOSITORY: &str = "local-docker.pkg.dev/local/survey-forge";

/// Every call the backend received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    ListImages,
    DeleteTag { resource: String },
    DeleteVersion { resource: String },
    Submit { image_tag: String },
    Upload { bucket: String, object: String },
}

impl BackendCall {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, BackendCall::ListImages)
    }
}

#[derive(Debug, Clone)]
struct StoredImage {
    tags: BTreeSet<String>,
    upload_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    // (package, digest)
    images: BTreeMap<(String, String), StoredImage>,
    blobs: BTreeMap<(String, String), Vec<u8>>,
    resource_failures: BTreeMap<String, BackendError>,
    listing_failure: Option<BackendError>,
    upload_failure: Option<BackendError>,
    submit_failure: Option<BackendError>,
    build_failure_detail: Option<String>,
    submit_delay: Duration,
    calls: Vec<BackendCall>,
    builds: u64,
}

/// Registry, blob store and builder in one process. Behaves like the hosted
/// registry where it matters to callers: missing resources are `NotFound`
/// and a tagged version refuses deletion.
#[derive(Debug)]
pub struct InMemoryBackend {
    repository_parent: String,
    image_repository: String,
    requires_staged_context: bool,
    allow_tagged_version_delete: bool,
    state: Mutex<MemoryState>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(MEMORY_REPOSITORY_PARENT, MEMORY_IMAGE_REPOSITORY)
    }
}

impl InMemoryBackend {
    pub fn new(repository_parent: impl Into<String>, image_repository: impl Into<String>) -> Self {
        Self {
            repository_parent: repository_parent.into(),
            image_repository: image_repository.into(),
            requires_staged_context: true,
            allow_tagged_version_delete: false,
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn with_staged_context(mut self, required: bool) -> Self {
        self.requires_staged_context = required;
        self
    }

    /// Drops the "still tagged" precondition on version deletes.
    pub fn allow_tagged_version_delete(mut self) -> Self {
        self.allow_tagged_version_delete = true;
        self
    }

    pub fn seed_image(
        &self,
        package: &str,
        digest: &str,
        tags: &[&str],
        upload_time: DateTime<Utc>,
    ) {
        self.lock().images.insert(
            (package.to_string(), digest.to_string()),
            StoredImage {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                upload_time,
            },
        );
    }

    /// Every delete addressed to `resource_name` fails with `error`.
    pub fn fail_resource(&self, resource_name: impl Into<String>, error: BackendError) {
        self.lock()
            .resource_failures
            .insert(resource_name.into(), error);
    }

    pub fn fail_listing(&self, error: BackendError) {
        self.lock().listing_failure = Some(error);
    }

    pub fn fail_uploads(&self, error: BackendError) {
        self.lock().upload_failure = Some(error);
    }

    pub fn fail_submits(&self, error: BackendError) {
        self.lock().submit_failure = Some(error);
    }

    /// Builds run and report `Failed { detail }`.
    pub fn fail_builds(&self, detail: impl Into<String>) {
        self.lock().build_failure_detail = Some(detail.into());
    }

    pub fn set_submit_delay(&self, delay: Duration) {
        self.lock().submit_delay = delay;
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().calls.clone()
    }

    pub fn mutation_calls(&self) -> Vec<BackendCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    pub fn image_count(&self) -> usize {
        self.lock().images.len()
    }

    pub fn blob(&self, bucket: &str, object: &str) -> Option<Vec<u8>> {
        self.lock()
            .blobs
            .get(&(bucket.to_string(), object.to_string()))
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // State stays consistent across a panicking holder: every mutation is
        // a single map operation.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn image_uri(&self, package: &str, digest: &str) -> String {
        format!(
            "{}/{package}@{digest}",
            self.image_repository.trim_end_matches('/')
        )
    }
}

impl BuildBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn repository_parent(&self) -> &str {
        &self.repository_parent
    }

    fn image_repository(&self) -> &str {
        &self.image_repository
    }

    fn requires_staged_context(&self) -> bool {
        self.requires_staged_context
    }

    fn list_images(&self) -> Result<Vec<ImageRef>, BackendError> {
        let mut state = self.lock();
        state.calls.push(BackendCall::ListImages);
        if let Some(err) = state.listing_failure.clone() {
            return Err(err);
        }
        state
            .images
            .iter()
            .map(|((package, digest), image)| {
                ImageRef::v1(
                    self.image_uri(package, digest),
                    image.tags.clone(),
                    image.upload_time,
                )
                .map_err(|err| BackendError::Protocol(err.to_string()))
            })
            .collect()
    }

    fn delete_tag(&self, tag: &TagRef) -> Result<(), BackendError> {
        let resource = tag.resource_name(&self.repository_parent);
        let mut state = self.lock();
        state.calls.push(BackendCall::DeleteTag {
            resource: resource.clone(),
        });
        if let Some(err) = state.resource_failures.get(&resource) {
            return Err(err.clone());
        }
        let holder = state
            .images
            .iter_mut()
            .find(|((package, _), image)| package == &tag.package && image.tags.contains(&tag.tag));
        match holder {
            Some((_, image)) => {
                image.tags.remove(&tag.tag);
                Ok(())
            }
            None => Err(BackendError::NotFound(resource)),
        }
    }

    fn delete_version(&self, version: &VersionRef) -> Result<(), BackendError> {
        let resource = version.resource_name(&self.repository_parent);
        let mut state = self.lock();
        state.calls.push(BackendCall::DeleteVersion {
            resource: resource.clone(),
        });
        if let Some(err) = state.resource_failures.get(&resource) {
            return Err(err.clone());
        }
        let key = (version.package.clone(), version.digest.clone());
        let Some(image) = state.images.get(&key) else {
            return Err(BackendError::NotFound(resource));
        };
        if !image.tags.is_empty() && !self.allow_tagged_version_delete {
            return Err(BackendError::FailedPrecondition(format!(
                "{resource} is still referenced by {} tag(s)",
                image.tags.len()
            )));
        }
        state.images.remove(&key);
        Ok(())
    }

    fn submit(&self, spec: &BuildSpec) -> Result<BuildOutcome, BackendError> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(BackendCall::Submit {
                image_tag: spec.image_tag.clone(),
            });
            if let Some(err) = state.submit_failure.clone() {
                return Err(err);
            }
            state.submit_delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        let mut state = self.lock();
        if let Some(detail) = state.build_failure_detail.clone() {
            return Ok(BuildOutcome::Failed { detail });
        }
        if self.requires_staged_context {
            let Some(source) = spec.source.as_ref() else {
                return Ok(BuildOutcome::Failed {
                    detail: "no staged build context".to_string(),
                });
            };
            let key = (source.bucket.clone(), source.object.clone());
            if !state.blobs.contains_key(&key) {
                return Ok(BuildOutcome::Failed {
                    detail: format!("build context gs://{}/{} not found", key.0, key.1),
                });
            }
        }

        state.builds += 1;
        let package = package_from_image_uri(&spec.image_tag).to_string();
        let digest = format!(
            "sha256:{}",
            hex::encode(Sha256::digest(
                format!("{}#{}", spec.image_tag, state.builds).as_bytes()
            ))
        );
        // A push moves `latest` onto the new version.
        for ((pkg, _), image) in state.images.iter_mut() {
            if pkg == &package {
                image.tags.remove(DEFAULT_IMAGE_TAG);
            }
        }
        state.images.insert(
            (package, digest),
            StoredImage {
                tags: BTreeSet::from([DEFAULT_IMAGE_TAG.to_string()]),
                upload_time: Utc::now(),
            },
        );
        Ok(BuildOutcome::Succeeded {
            image: spec.image_tag.clone(),
        })
    }
}

impl ContextStore for InMemoryBackend {
    fn upload(&self, bucket: &str, object: &str, archive: &Path) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.calls.push(BackendCall::Upload {
            bucket: bucket.to_string(),
            object: object.to_string(),
        });
        if let Some(err) = state.upload_failure.clone() {
            return Err(err);
        }
        let bytes = fs::read(archive).map_err(|err| {
            BackendError::Unavailable(format!("read {}: {err}", archive.display()))
        })?;
        state
            .blobs
            .insert((bucket.to_string(), object.to_string()), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use forge_kernel_contracts::build::{BuildJob, BuildSpec};
    use forge_kernel_contracts::namespace::{JobId, OwnerId};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn tag(package: &str, tag: &str) -> TagRef {
        TagRef {
            package: package.to_string(),
            tag: tag.to_string(),
        }
    }

    fn version(package: &str, digest: &str) -> VersionRef {
        VersionRef {
            package: package.to_string(),
            digest: digest.to_string(),
        }
    }

    #[test]
    fn at_memory_01_deletes_are_idempotent_through_not_found() {
        let b = InMemoryBackend::default();
        b.seed_image("user_U_q_7", "sha256:a", &["latest"], t0());
        assert!(b.delete_tag(&tag("user_U_q_7", "latest")).is_ok());
        assert!(b
            .delete_tag(&tag("user_U_q_7", "latest"))
            .unwrap_err()
            .is_not_found());
        assert!(b.delete_version(&version("user_U_q_7", "sha256:a")).is_ok());
        assert!(b
            .delete_version(&version("user_U_q_7", "sha256:a"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn at_memory_02_tagged_version_refuses_delete() {
        let b = InMemoryBackend::default();
        b.seed_image("user_U_q_7", "sha256:a", &["latest"], t0());
        assert!(matches!(
            b.delete_version(&version("user_U_q_7", "sha256:a")),
            Err(BackendError::FailedPrecondition(_))
        ));
        assert_eq!(b.image_count(), 1);
    }

    #[test]
    fn at_memory_03_listing_derives_package_from_uri() {
        let b = InMemoryBackend::default();
        b.seed_image("user_U_q_7", "sha256:a", &["latest", "v1"], t0());
        let images = b.list_images().unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].package, "user_U_q_7");
        assert_eq!(images[0].digest, "sha256:a");
        assert_eq!(images[0].tags.len(), 2);
        assert_eq!(b.calls(), vec![BackendCall::ListImages]);
        assert!(b.mutation_calls().is_empty());
    }

    #[test]
    fn at_memory_04_unstaged_build_pushes_latest() {
        let b = InMemoryBackend::default().with_staged_context(false);
        b.seed_image("user_U_q_7", "sha256:old", &["latest"], t0());
        let job = BuildJob::v1(
            OwnerId::new("U").unwrap(),
            JobId::new("7").unwrap(),
            "t".to_string(),
            json!({}),
            json!({}),
        )
        .unwrap();
        let spec = BuildSpec::v1(b.image_repository(), &job.variables(), None).unwrap();
        let outcome = b.submit(&spec).unwrap();
        assert_eq!(
            outcome,
            BuildOutcome::Succeeded {
                image: format!("{MEMORY_IMAGE_REPOSITORY}/user_U_q_7:latest")
            }
        );
        let images = b.list_images().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(
            images.iter().filter(|i| i.tags.contains("latest")).count(),
            1
        );
    }

    #[test]
    fn at_memory_05_staged_build_without_blob_fails() {
        let b = InMemoryBackend::default();
        let job = BuildJob::v1(
            OwnerId::new("U").unwrap(),
            JobId::new("7").unwrap(),
            "t".to_string(),
            json!({}),
            json!({}),
        )
        .unwrap();
        let spec = BuildSpec::v1(b.image_repository(), &job.variables(), None).unwrap();
        assert!(matches!(
            b.submit(&spec).unwrap(),
            BuildOutcome::Failed { .. }
        ));
        assert_eq!(b.image_count(), 0);
    }
}
