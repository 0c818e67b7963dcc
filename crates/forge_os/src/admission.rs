#![forbid(unsafe_code)]

use forge_engines::namespace::ArtifactNamespace;
use forge_kernel_contracts::namespace::OwnerId;
use tracing::{debug, warn};

use crate::submitter::SubmitError;

pub const DEFAULT_IMAGE_CAP: usize = 5;

/// Per-owner image-count cap, checked before a submission writes anything.
///
/// Two concurrent submissions can both read a count under the cap; nothing
/// here serializes them.
#[derive(Clone)]
pub struct ImageCapGate {
    namespace: ArtifactNamespace,
    cap: usize,
}

impl ImageCapGate {
    pub fn new(namespace: ArtifactNamespace, cap: usize) -> Self {
        Self { namespace, cap }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn namespace(&self) -> &ArtifactNamespace {
        &self.namespace
    }

    /// Blocking: lists the registry. Returns the owner's current image count.
    pub fn check(&self, owner_id: &OwnerId) -> Result<usize, SubmitError> {
        let count = self.namespace.count_for_owner(owner_id)?;
        if count >= self.cap {
            warn!(owner_id = %owner_id, count, cap = self.cap, "image cap reached");
            return Err(SubmitError::ImageCapExceeded {
                count,
                cap: self.cap,
            });
        }
        debug!(owner_id = %owner_id, count, cap = self.cap, "image cap check passed");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use chrono::Utc;
    use forge_engines::backend::BackendError;
    use forge_engines::memory::InMemoryBackend;

    fn gate(backend: &Arc<InMemoryBackend>) -> ImageCapGate {
        ImageCapGate::new(ArtifactNamespace::new(backend.clone()), DEFAULT_IMAGE_CAP)
    }

    fn seed(backend: &InMemoryBackend, owner: &str, n: usize) {
        for i in 0..n {
            backend.seed_image(
                &format!("user_{owner}_q_{i}"),
                &format!("sha256:{owner}{i}"),
                &["latest"],
                Utc::now(),
            );
        }
    }

    #[test]
    fn at_admission_01_cap_counts_only_the_owner_prefix() {
        let backend = Arc::new(InMemoryBackend::default());
        seed(&backend, "U", 4);
        seed(&backend, "V", 6);
        let owner = OwnerId::new("U").unwrap();
        assert_eq!(gate(&backend).check(&owner).unwrap(), 4);

        backend.seed_image("user_U_q_9", "sha256:extra", &[], Utc::now());
        let err = gate(&backend).check(&owner).unwrap_err();
        assert!(matches!(
            err,
            SubmitError::ImageCapExceeded { count: 5, cap: 5 }
        ));
    }

    #[test]
    fn at_admission_02_listing_failure_blocks_admission() {
        let backend = Arc::new(InMemoryBackend::default());
        backend.fail_listing(BackendError::Unavailable("registry down".to_string()));
        let err = gate(&backend)
            .check(&OwnerId::new("U").unwrap())
            .unwrap_err();
        assert!(matches!(err, SubmitError::Backend(BackendError::Unavailable(_))));
    }
}
