#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::common::validate_text;
use crate::{ContractViolation, Validate};

pub const UPLOAD_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// One image version as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ImageRef {
    pub package: String,
    pub uri: String,
    pub digest: String,
    pub tags: BTreeSet<String>,
    pub upload_time: DateTime<Utc>,
}

impl ImageRef {
    pub fn v1(
        uri: String,
        tags: BTreeSet<String>,
        upload_time: DateTime<Utc>,
    ) -> Result<Self, ContractViolation> {
        let package = package_from_image_uri(&uri).to_string();
        let digest = digest_from_image_uri(&uri)
            .ok_or(ContractViolation::InvalidValue {
                field: "image_ref.uri",
                reason: "must carry an @<digest> suffix",
            })?
            .to_string();
        let image = Self {
            package,
            uri,
            digest,
            tags,
            upload_time,
        };
        image.validate()?;
        Ok(image)
    }

    /// `<package>@<digest>`, the identifier reported for a deleted version.
    pub fn identifier(&self) -> String {
        format!("{}@{}", self.package, self.digest)
    }

    pub fn upload_time_label(&self) -> String {
        self.upload_time.format(UPLOAD_TIME_FORMAT).to_string()
    }

    pub fn tag_refs(&self) -> Vec<TagRef> {
        self.tags
            .iter()
            .map(|tag| TagRef {
                package: self.package.clone(),
                tag: tag.clone(),
            })
            .collect()
    }

    pub fn version_ref(&self) -> VersionRef {
        VersionRef {
            package: self.package.clone(),
            digest: self.digest.clone(),
        }
    }
}

impl Validate for ImageRef {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("image_ref.package", &self.package, 256)?;
        validate_text("image_ref.digest", &self.digest, 256)?;
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(ContractViolation::InvalidValue {
                field: "image_ref.tags",
                reason: "must not contain empty tags",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagRef {
    pub package: String,
    pub tag: String,
}

impl TagRef {
    pub fn resource_name(&self, repository_parent: &str) -> String {
        format!(
            "{repository_parent}/packages/{}/tags/{}",
            self.package, self.tag
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionRef {
    pub package: String,
    pub digest: String,
}

impl VersionRef {
    pub fn resource_name(&self, repository_parent: &str) -> String {
        format!(
            "{repository_parent}/packages/{}/versions/{}",
            self.package, self.digest
        )
    }

    pub fn identifier(&self) -> String {
        format!("{}@{}", self.package, self.digest)
    }
}

/// Last path segment of an image URI, cut at the digest or tag separator.
///
/// `europe-west1-docker.pkg.dev/p/r/user_a_q_b@sha256:00` -> `user_a_q_b`
pub fn package_from_image_uri(uri: &str) -> &str {
    let last = uri.rsplit('/').next().unwrap_or(uri);
    let end = last.find(['@', ':']).unwrap_or(last.len());
    &last[..end]
}

pub fn digest_from_image_uri(uri: &str) -> Option<&str> {
    uri.rsplit_once('@')
        .map(|(_, digest)| digest)
        .filter(|d| !d.is_empty())
}
