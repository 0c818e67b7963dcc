#![forbid(unsafe_code)]

use std::time::Duration;

use serde_json::Value;

use crate::backend::BackendError;

pub const FORGE_USER_AGENT: &str = "survey-forge/0.1";

pub fn build_http_agent(timeout_ms: u32, user_agent: &str) -> Result<ureq::Agent, String> {
    if timeout_ms == 0 {
        return Err("timeout must be > 0".to_string());
    }
    let timeout = Duration::from_millis(u64::from(timeout_ms).max(100));
    Ok(ureq::AgentBuilder::new()
        .timeout_connect(timeout)
        .timeout_read(timeout)
        .timeout_write(timeout)
        .user_agent(user_agent)
        .try_proxy_from_env(true)
        .build())
}

/// Maps a Google-style error response onto `BackendError`. The `error.status`
/// field wins over the HTTP status when both are present.
pub(crate) fn backend_error_from_ureq(context: &str, err: ureq::Error) -> BackendError {
    match err {
        ureq::Error::Status(status, response) => {
            let body: Option<Value> = response.into_json().ok();
            let api_status = body
                .as_ref()
                .and_then(|b| b.pointer("/error/status"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let message = body
                .as_ref()
                .and_then(|b| b.pointer("/error/message"))
                .and_then(Value::as_str)
                .map(|m| format!("{context}: {m}"))
                .unwrap_or_else(|| format!("{context}: http status {status}"));
            backend_error_from_status(status, api_status.as_deref(), message)
        }
        ureq::Error::Transport(transport) => BackendError::Unavailable(format!(
            "{context}: {} ({})",
            classify_transport_error_kind(&format!("{:?} {}", transport.kind(), transport)),
            transport
        )),
    }
}

pub(crate) fn backend_error_from_status(
    http_status: u16,
    api_status: Option<&str>,
    message: String,
) -> BackendError {
    match api_status {
        Some("NOT_FOUND") => return BackendError::NotFound(message),
        Some("PERMISSION_DENIED") | Some("UNAUTHENTICATED") => {
            return BackendError::PermissionDenied(message)
        }
        Some("FAILED_PRECONDITION") => return BackendError::FailedPrecondition(message),
        Some("UNAVAILABLE") | Some("RESOURCE_EXHAUSTED") | Some("DEADLINE_EXCEEDED") => {
            return BackendError::Unavailable(message)
        }
        _ => {}
    }
    match http_status {
        404 => BackendError::NotFound(message),
        401 | 403 => BackendError::PermissionDenied(message),
        412 => BackendError::FailedPrecondition(message),
        429 | 500..=599 => BackendError::Unavailable(message),
        _ => BackendError::Protocol(message),
    }
}

/// Long-running operations report failures as a numeric RPC code.
pub(crate) fn backend_error_from_rpc_code(code: i64, message: String) -> BackendError {
    match code {
        5 => BackendError::NotFound(message),
        7 | 16 => BackendError::PermissionDenied(message),
        9 => BackendError::FailedPrecondition(message),
        4 | 8 | 14 => BackendError::Unavailable(message),
        _ => BackendError::Protocol(message),
    }
}

pub(crate) fn classify_transport_error_kind(raw: &str) -> &'static str {
    let lower = raw.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("tls") || lower.contains("ssl") {
        "tls"
    } else if lower.contains("dns") {
        "dns"
    } else if lower.contains("connection") || lower.contains("connect") {
        "connection"
    } else {
        "transport"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_http_01_api_status_takes_precedence() {
        assert!(matches!(
            backend_error_from_status(400, Some("FAILED_PRECONDITION"), "m".to_string()),
            BackendError::FailedPrecondition(_)
        ));
        assert!(matches!(
            backend_error_from_status(403, None, "m".to_string()),
            BackendError::PermissionDenied(_)
        ));
        assert!(matches!(
            backend_error_from_status(404, None, "m".to_string()),
            BackendError::NotFound(_)
        ));
        assert!(matches!(
            backend_error_from_status(503, None, "m".to_string()),
            BackendError::Unavailable(_)
        ));
        assert!(matches!(
            backend_error_from_status(400, None, "m".to_string()),
            BackendError::Protocol(_)
        ));
    }

    #[test]
    fn at_http_02_rpc_codes_map_to_backend_errors() {
        assert!(backend_error_from_rpc_code(5, "m".to_string()).is_not_found());
        assert!(matches!(
            backend_error_from_rpc_code(9, "m".to_string()),
            BackendError::FailedPrecondition(_)
        ));
        assert!(matches!(
            backend_error_from_rpc_code(7, "m".to_string()),
            BackendError::PermissionDenied(_)
        ));
    }

    #[test]
    fn at_http_03_zero_timeout_is_rejected() {
        assert!(build_http_agent(0, FORGE_USER_AGENT).is_err());
        assert!(build_http_agent(500, FORGE_USER_AGENT).is_ok());
    }
}
