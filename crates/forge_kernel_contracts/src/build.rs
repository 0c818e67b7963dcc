#![forbid(unsafe_code)]

use serde_json::Value;

use crate::common::validate_text;
use crate::namespace::{JobId, OwnerId, PackageName, DEFAULT_IMAGE_TAG};
use crate::{ContractViolation, Validate};

/// Directory name the template is staged under inside the context archive.
pub const BUILD_CONTEXT_DIR: &str = "custom_build_context";

pub const BUILD_ARG_SCHEMA: &str = "Q_SCHEMA";
pub const BUILD_ARG_UI_SCHEMA: &str = "Q_UI_SCHEMA";
pub const BUILD_ARG_JOB_ID: &str = "Q_ID";
pub const BUILD_ARG_TITLE: &str = "Q_TITLE";

/// One questionnaire build request, as accepted from the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildJob {
    pub owner_id: OwnerId,
    pub job_id: JobId,
    pub title: String,
    pub form_schema: Value,
    pub ui_schema: Value,
}

impl BuildJob {
    pub fn v1(
        owner_id: OwnerId,
        job_id: JobId,
        title: String,
        form_schema: Value,
        ui_schema: Value,
    ) -> Result<Self, ContractViolation> {
        let job = Self {
            owner_id,
            job_id,
            title,
            form_schema,
            ui_schema,
        };
        job.validate()?;
        Ok(job)
    }

    pub fn package_name(&self) -> PackageName {
        PackageName::for_job(&self.owner_id, &self.job_id)
    }

    pub fn variables(&self) -> BuildVariables {
        BuildVariables {
            owner_id: self.owner_id.clone(),
            job_id: self.job_id.clone(),
            title: self.title.clone(),
            form_schema: self.form_schema.clone(),
            ui_schema: self.ui_schema.clone(),
        }
    }
}

impl Validate for BuildJob {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.owner_id.validate()?;
        self.job_id.validate()?;
        validate_text("build_job.title", &self.title, 512)?;
        if !self.form_schema.is_object() {
            return Err(ContractViolation::InvalidValue {
                field: "build_job.form_schema",
                reason: "must be a JSON object",
            });
        }
        if !self.ui_schema.is_object() {
            return Err(ContractViolation::InvalidValue {
                field: "build_job.ui_schema",
                reason: "must be a JSON object",
            });
        }
        Ok(())
    }
}

/// Values injected into the build: schema files and build-time arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildVariables {
    pub owner_id: OwnerId,
    pub job_id: JobId,
    pub title: String,
    pub form_schema: Value,
    pub ui_schema: Value,
}

impl BuildVariables {
    /// Ordered `(name, value)` build arguments.
    pub fn build_args(&self) -> Vec<(String, String)> {
        vec![
            (BUILD_ARG_SCHEMA.to_string(), self.form_schema.to_string()),
            (BUILD_ARG_UI_SCHEMA.to_string(), self.ui_schema.to_string()),
            (BUILD_ARG_JOB_ID.to_string(), self.job_id.as_str().to_string()),
            (BUILD_ARG_TITLE.to_string(), self.title.clone()),
        ]
    }
}

/// Where a staged build context can be pulled from.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ContextHandle {
    pub bucket: String,
    pub object: String,
    pub sha256_hex: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStep {
    BuildImage {
        image_tag: String,
        build_args: Vec<(String, String)>,
        context_dir: String,
    },
    PushImage {
        image_tag: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub image_tag: String,
    pub steps: Vec<BuildStep>,
    pub source: Option<ContextHandle>,
}

impl BuildSpec {
    /// Build then push `<repository>/user_<owner>_q_<job>:latest`.
    pub fn v1(
        image_repository: &str,
        variables: &BuildVariables,
        source: Option<ContextHandle>,
    ) -> Result<Self, ContractViolation> {
        validate_text("build_spec.image_repository", image_repository, 512)?;
        let package = PackageName::for_job(&variables.owner_id, &variables.job_id);
        let image_tag = format!(
            "{}/{}:{}",
            image_repository.trim_end_matches('/'),
            package,
            DEFAULT_IMAGE_TAG
        );
        let steps = vec![
            BuildStep::BuildImage {
                image_tag: image_tag.clone(),
                build_args: variables.build_args(),
                context_dir: BUILD_CONTEXT_DIR.to_string(),
            },
            BuildStep::PushImage {
                image_tag: image_tag.clone(),
            },
        ];
        Ok(Self {
            image_tag,
            steps,
            source,
        })
    }

    pub fn build_args(&self) -> &[(String, String)] {
        self.steps
            .iter()
            .find_map(|step| match step {
                BuildStep::BuildImage { build_args, .. } => Some(build_args.as_slice()),
                BuildStep::PushImage { .. } => None,
            })
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Succeeded { image: String },
    Failed { detail: String },
}
