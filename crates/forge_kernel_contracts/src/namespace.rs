#![forbid(unsafe_code)]

//! Registry naming. `user_<owner>_q_<job>` is the only thing separating one
//! owner's images from another's in the shared repository, so every name is
//! built here from validated ids and nowhere else.

use std::fmt;

use crate::{ContractViolation, Validate};

pub const DEFAULT_IMAGE_TAG: &str = "latest";

const PACKAGE_OWNER_MARKER: &str = "user_";
const PACKAGE_JOB_MARKER: &str = "_q_";
const ID_MAX_LEN: usize = 128;

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for OwnerId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_namespace_id("owner_id", &self.0)
    }
}

impl TryFrom<String> for OwnerId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OwnerId> for String {
    fn from(value: OwnerId) -> Self {
        value.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for JobId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_namespace_id("job_id", &self.0)
    }
}

impl TryFrom<String> for JobId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry package name of one job's image: `user_<owner>_q_<job>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PackageName(String);

impl PackageName {
    pub fn for_job(owner_id: &OwnerId, job_id: &JobId) -> Self {
        Self(format!(
            "{PACKAGE_OWNER_MARKER}{}{PACKAGE_JOB_MARKER}{}",
            owner_id.as_str(),
            job_id.as_str()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Exact, case-sensitive `starts_with` prefix over derived package names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacePrefix(String);

impl NamespacePrefix {
    /// `user_<owner>_q_`: every image the owner has.
    pub fn for_owner(owner_id: &OwnerId) -> Self {
        Self(format!(
            "{PACKAGE_OWNER_MARKER}{}{PACKAGE_JOB_MARKER}",
            owner_id.as_str()
        ))
    }

    /// `user_<owner>_q_<job>`. Also matches jobs whose id extends `job`.
    pub fn for_job(owner_id: &OwnerId, job_id: &JobId) -> Self {
        Self(PackageName::for_job(owner_id, job_id).0)
    }

    pub fn matches(&self, package: &str) -> bool {
        package.starts_with(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespacePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_namespace_id(field: &'static str, s: &str) -> Result<(), ContractViolation> {
    if s.is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if s.len() > ID_MAX_LEN {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "too long",
        });
    }
    // No '_' keeps `_q_` unambiguous inside package names.
    if !s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must contain only ASCII alphanumerics and '-'",
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).unwrap()
    }

    fn job(id: &str) -> JobId {
        JobId::new(id).unwrap()
    }

    #[test]
    fn at_namespace_01_package_name_matches_wire_contract() {
        let name = PackageName::for_job(&owner("U"), &job("q5"));
        assert_eq!(name.as_str(), "user_U_q_q5");
    }

    #[test]
    fn at_namespace_02_owner_prefix_is_job_independent() {
        let prefix = NamespacePrefix::for_owner(&owner("9f1c-aa"));
        assert_eq!(prefix.as_str(), "user_9f1c-aa_q_");
        assert!(prefix.matches("user_9f1c-aa_q_7"));
        assert!(!prefix.matches("user_9f1c-ab_q_7"));
    }

    #[test]
    fn at_namespace_03_prefix_is_case_sensitive_and_literal() {
        let prefix = NamespacePrefix::for_job(&owner("U"), &job("7"));
        assert!(prefix.matches("user_U_q_7"));
        assert!(prefix.matches("user_U_q_70"));
        assert!(!prefix.matches("user_u_q_7"));
        assert!(!prefix.matches("xuser_U_q_7"));
    }

    #[test]
    fn at_namespace_04_ids_reject_underscore_and_separators() {
        assert!(OwnerId::new("a_q_b").is_err());
        assert!(JobId::new("j/1").is_err());
        assert!(JobId::new("j:1").is_err());
        assert!(OwnerId::new("").is_err());
        assert!(OwnerId::new("x".repeat(129)).is_err());
        assert!(OwnerId::new("6a0f3c1e-1b2d-4c5e-9f00-0123456789ab").is_ok());
    }

    #[test]
    fn at_namespace_05_ids_validate_on_deserialize() {
        let ok: Result<OwnerId, _> = serde_json::from_str("\"owner-1\"");
        assert_eq!(ok.unwrap().as_str(), "owner-1");
        let bad: Result<JobId, _> = serde_json::from_str("\"has space\"");
        assert!(bad.is_err());
    }
}
