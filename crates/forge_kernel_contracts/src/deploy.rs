#![forbid(unsafe_code)]

use crate::common::validate_text;
use crate::{ContractViolation, Validate};

pub const DEPLOY_DEFAULT_PORT: u16 = 5000;
pub const DEPLOY_DEFAULT_VOLUME_PATH: &str = "~/docker_data";
pub const DEPLOY_DEFAULT_QID: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeployTarget {
    Linux,
    Mac,
    Windows,
}

/// Result of mapping the free-form `os` label onto a script flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployTargetResolution {
    pub target: DeployTarget,
    /// The label was neither `linux` nor `mac` and was treated as Windows.
    pub fell_back: bool,
}

impl DeployTarget {
    /// Anything other than `linux`/`mac` resolves to Windows rather than being
    /// rejected; unknown labels are reported through `fell_back`.
    pub fn resolve(os_label: &str) -> DeployTargetResolution {
        match os_label {
            "linux" => DeployTargetResolution {
                target: DeployTarget::Linux,
                fell_back: false,
            },
            "mac" => DeployTargetResolution {
                target: DeployTarget::Mac,
                fell_back: false,
            },
            "windows" => DeployTargetResolution {
                target: DeployTarget::Windows,
                fell_back: false,
            },
            _ => DeployTargetResolution {
                target: DeployTarget::Windows,
                fell_back: true,
            },
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            DeployTarget::Linux | DeployTarget::Mac => "sh",
            DeployTarget::Windows => "ps1",
        }
    }
}

fn default_port() -> u16 {
    DEPLOY_DEFAULT_PORT
}

fn default_volume_path() -> String {
    DEPLOY_DEFAULT_VOLUME_PATH.to_string()
}

fn default_qid() -> String {
    DEPLOY_DEFAULT_QID.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeployScriptRequest {
    pub image: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_volume_path")]
    pub volume_path: String,
    pub os: String,
    #[serde(default = "default_qid")]
    pub qid: String,
}

impl Validate for DeployScriptRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("deploy_script_request.image", &self.image, 512)?;
        validate_text("deploy_script_request.volume_path", &self.volume_path, 1024)?;
        validate_text("deploy_script_request.qid", &self.qid, 128)?;
        if self.port == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "deploy_script_request.port",
                reason: "must be > 0",
            });
        }
        // qid lands in a Content-Disposition filename.
        if !self
            .qid
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ContractViolation::InvalidValue {
                field: "deploy_script_request.qid",
                reason: "must contain only ASCII alphanumerics, '-' and '_'",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_deploy_01_known_labels_resolve_without_fallback() {
        assert_eq!(
            DeployTarget::resolve("linux"),
            DeployTargetResolution {
                target: DeployTarget::Linux,
                fell_back: false
            }
        );
        assert_eq!(DeployTarget::resolve("mac").target, DeployTarget::Mac);
        assert!(!DeployTarget::resolve("windows").fell_back);
    }

    #[test]
    fn at_deploy_02_unknown_label_falls_through_to_windows() {
        let resolution = DeployTarget::resolve("freebsd");
        assert_eq!(resolution.target, DeployTarget::Windows);
        assert!(resolution.fell_back);
        assert_eq!(resolution.target.extension(), "ps1");
    }

    #[test]
    fn at_deploy_03_request_defaults_apply() {
        let req: DeployScriptRequest =
            serde_json::from_str(r#"{"image":"user_a_q_b:latest","os":"linux"}"#).unwrap();
        assert_eq!(req.port, 5000);
        assert_eq!(req.volume_path, "~/docker_data");
        assert_eq!(req.qid, "unknown");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn at_deploy_04_header_unsafe_qid_is_rejected() {
        let req = DeployScriptRequest {
            image: "img".to_string(),
            port: 8080,
            volume_path: "/data".to_string(),
            os: "linux".to_string(),
            qid: "a\"; b".to_string(),
        };
        assert!(req.validate().is_err());
    }
}
