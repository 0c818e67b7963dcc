#![forbid(unsafe_code)]

use std::sync::Arc;

use forge_kernel_contracts::namespace::{NamespacePrefix, OwnerId};
use forge_kernel_contracts::registry::ImageRef;
use tracing::debug;

use crate::backend::{BackendError, BuildBackend};

/// Prefix view over the shared repository. Filtering happens here, after a
/// full listing, so every call costs one pass over the whole registry.
#[derive(Clone)]
pub struct ArtifactNamespace {
    backend: Arc<dyn BuildBackend>,
}

impl ArtifactNamespace {
    pub fn new(backend: Arc<dyn BuildBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn BuildBackend> {
        &self.backend
    }

    pub fn list_by_prefix(&self, prefix: &NamespacePrefix) -> Result<Vec<ImageRef>, BackendError> {
        let all = self.backend.list_images()?;
        let total = all.len();
        let matching: Vec<ImageRef> = all
            .into_iter()
            .filter(|image| prefix.matches(&image.package))
            .collect();
        debug!(
            prefix = %prefix,
            total,
            matching = matching.len(),
            "filtered registry listing"
        );
        Ok(matching)
    }

    /// Images under `user_<owner>_q_`, across every job.
    pub fn count_for_owner(&self, owner_id: &OwnerId) -> Result<usize, BackendError> {
        Ok(self
            .list_by_prefix(&NamespacePrefix::for_owner(owner_id))?
            .len())
    }
}
