#![forbid(unsafe_code)]

use forge_kernel_contracts::deletion::{
    DeletionOutcome, DeletionReport, DeletionStage, ALREADY_ABSENT_SUFFIX,
};
use forge_kernel_contracts::namespace::NamespacePrefix;
use forge_kernel_contracts::registry::ImageRef;
use tracing::{error, info, warn};

use crate::backend::{BackendError, BuildBackend};
use crate::namespace::ArtifactNamespace;

/// Removes every image under a prefix: tags first, then the version, one
/// call at a time. Per-resource failures are collected, never fatal.
#[derive(Clone)]
pub struct ArtifactDeleter {
    namespace: ArtifactNamespace,
}

impl ArtifactDeleter {
    pub fn new(namespace: ArtifactNamespace) -> Self {
        Self { namespace }
    }

    /// Only a failed listing is an `Err`; everything after that is reported
    /// inside the `DeletionReport`.
    pub fn delete_by_prefix(
        &self,
        prefix: &NamespacePrefix,
        tag_filter: Option<&str>,
    ) -> Result<DeletionReport, BackendError> {
        let mut targets = self.namespace.list_by_prefix(prefix)?;
        if let Some(tag) = tag_filter {
            targets.retain(|image| image.tags.contains(tag));
        }
        if targets.is_empty() {
            warn!(prefix = %prefix, tag = ?tag_filter, "no images found for deletion");
            return Ok(DeletionReport::NoImagesFound {
                prefix: prefix.as_str().to_string(),
            });
        }
        if targets.len() > 1 {
            let uris: Vec<&str> = targets.iter().map(|image| image.uri.as_str()).collect();
            warn!(
                prefix = %prefix,
                count = targets.len(),
                images = ?uris,
                "several images match prefix, deleting all of them"
            );
        }

        let backend: &dyn BuildBackend = self.namespace.backend().as_ref();
        let mut outcome = DeletionOutcome::default();
        for image in &targets {
            delete_image(backend, image, &mut outcome);
        }
        let report = outcome.into_report();
        info!(
            prefix = %prefix,
            status = report.status_label(),
            "deletion finished"
        );
        Ok(report)
    }
}

fn delete_image(backend: &dyn BuildBackend, image: &ImageRef, outcome: &mut DeletionOutcome) {
    let parent = backend.repository_parent();
    info!(image = %image.uri, "deleting image");

    if image.tags.is_empty() {
        warn!(image = %image.identifier(), "image has no tags, deleting version directly");
    }
    for tag in image.tag_refs() {
        let resource = tag.resource_name(parent);
        match backend.delete_tag(&tag) {
            Ok(()) => info!(resource = %resource, "tag deleted"),
            Err(err) if err.is_not_found() => {
                warn!(resource = %resource, "tag already absent");
            }
            Err(err) => {
                error!(resource = %resource, kind = err.kind(), error = %err, "tag delete failed");
                outcome.record_error(DeletionStage::DeleteTag, resource, err.to_string());
            }
        }
    }

    // Attempted even when a tag delete failed; the backend reports a
    // still-tagged version as FailedPrecondition.
    let version = image.version_ref();
    let resource = version.resource_name(parent);
    match backend.delete_version(&version) {
        Ok(()) => {
            info!(resource = %resource, "version deleted");
            outcome.record_deleted(version.identifier());
        }
        Err(err) if err.is_not_found() => {
            warn!(resource = %resource, "version already absent");
            outcome.record_deleted(format!("{}{ALREADY_ABSENT_SUFFIX}", version.identifier()));
        }
        Err(err) => {
            error!(resource = %resource, kind = err.kind(), error = %err, "version delete failed");
            outcome.record_error(DeletionStage::DeleteVersion, resource, err.to_string());
        }
    }
}
