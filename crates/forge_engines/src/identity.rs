#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use forge_kernel_contracts::namespace::OwnerId;
use serde_json::Value;
use tracing::debug;

use crate::backend::{AuthError, IdentityProvider};
use crate::http::{build_http_agent, classify_transport_error_kind, FORGE_USER_AGENT};

/// Fixed token -> owner table for local runs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    owners_by_token: BTreeMap<String, OwnerId>,
}

impl StaticIdentityProvider {
    pub fn new(owners_by_token: BTreeMap<String, OwnerId>) -> Self {
        Self { owners_by_token }
    }

    pub fn with_token(mut self, token: impl Into<String>, owner_id: OwnerId) -> Self {
        self.owners_by_token.insert(token.into(), owner_id);
        self
    }

    /// Parses `token=owner,token=owner`.
    pub fn parse_table(raw: &str) -> Result<Self, String> {
        let mut owners_by_token = BTreeMap::new();
        for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let Some((token, owner)) = pair.split_once('=') else {
                return Err(format!("static token entry '{pair}' must be token=owner"));
            };
            let token = token.trim();
            if token.is_empty() {
                return Err("static token entry has an empty token".to_string());
            }
            let owner_id = OwnerId::new(owner.trim())
                .map_err(|err| format!("static token entry for '{token}': {err}"))?;
            owners_by_token.insert(token.to_string(), owner_id);
        }
        Ok(Self { owners_by_token })
    }

    pub fn len(&self) -> usize {
        self.owners_by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners_by_token.is_empty()
    }
}

impl IdentityProvider for StaticIdentityProvider {
    fn resolve_owner(&self, bearer_token: &str) -> Result<OwnerId, AuthError> {
        self.owners_by_token
            .get(bearer_token)
            .cloned()
            .ok_or_else(|| AuthError::Invalid("unknown token".to_string()))
    }
}

/// Validates tokens against a Supabase project's `auth/v1/user` endpoint.
#[derive(Debug, Clone)]
pub struct SupabaseIdentityProvider {
    user_endpoint: String,
    api_key: String,
    agent: ureq::Agent,
}

impl SupabaseIdentityProvider {
    pub fn new(project_url: &str, api_key: String, timeout_ms: u32) -> Result<Self, String> {
        let base = url::Url::parse(project_url)
            .map_err(|err| format!("invalid supabase url '{project_url}': {err}"))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(format!("supabase url '{project_url}' must be http(s)"));
        }
        if api_key.trim().is_empty() {
            return Err("supabase api key must not be empty".to_string());
        }
        let user_endpoint = format!("{}/auth/v1/user", base.as_str().trim_end_matches('/'));
        Ok(Self {
            user_endpoint,
            api_key,
            agent: build_http_agent(timeout_ms, FORGE_USER_AGENT)?,
        })
    }

    pub fn user_endpoint(&self) -> &str {
        &self.user_endpoint
    }
}

impl IdentityProvider for SupabaseIdentityProvider {
    fn resolve_owner(&self, bearer_token: &str) -> Result<OwnerId, AuthError> {
        let response = self
            .agent
            .get(&self.user_endpoint)
            .set("apikey", &self.api_key)
            .set("Authorization", &format!("Bearer {bearer_token}"))
            .set("Accept", "application/json")
            .call();
        let response = match response {
            Ok(response) => response,
            Err(ureq::Error::Status(status, _)) => {
                debug!(status, "identity provider rejected credential");
                return Err(AuthError::Invalid(format!(
                    "identity provider returned http {status}"
                )));
            }
            Err(ureq::Error::Transport(transport)) => {
                let kind =
                    classify_transport_error_kind(&format!("{:?} {}", transport.kind(), transport));
                return Err(AuthError::Unavailable(format!("{kind}: {transport}")));
            }
        };
        let body: Value = response
            .into_json()
            .map_err(|err| AuthError::Invalid(format!("unreadable user payload: {err}")))?;
        owner_from_user_payload(&body)
    }
}

fn owner_from_user_payload(body: &Value) -> Result<OwnerId, AuthError> {
    let id = body
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| AuthError::Invalid("user payload has no id".to_string()))?;
    OwnerId::new(id).map_err(|err| AuthError::Invalid(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn at_identity_01_static_table_parses_and_resolves() {
        let provider = StaticIdentityProvider::parse_table(" tok-a=owner-a , tok-b=owner-b,").unwrap();
        assert_eq!(provider.len(), 2);
        assert_eq!(provider.resolve_owner("tok-b").unwrap().as_str(), "owner-b");
        assert!(matches!(
            provider.resolve_owner("nope"),
            Err(AuthError::Invalid(_))
        ));
    }

    #[test]
    fn at_identity_02_static_table_rejects_malformed_entries() {
        assert!(StaticIdentityProvider::parse_table("missing-separator").is_err());
        assert!(StaticIdentityProvider::parse_table("tok=bad_owner").is_err());
        assert!(StaticIdentityProvider::parse_table("=owner").is_err());
    }

    #[test]
    fn at_identity_03_user_payload_needs_valid_id() {
        let owner =
            owner_from_user_payload(&json!({"id": "6a0f3c1e-1b2d-4c5e-9f00-0123456789ab"}))
                .unwrap();
        assert_eq!(owner.as_str(), "6a0f3c1e-1b2d-4c5e-9f00-0123456789ab");
        assert!(owner_from_user_payload(&json!({"email": "x@y"})).is_err());
        assert!(owner_from_user_payload(&json!({"id": "a b"})).is_err());
    }

    #[test]
    fn at_identity_04_supabase_endpoint_is_derived_from_project_url() {
        let provider =
            SupabaseIdentityProvider::new("https://abc.supabase.co/", "key".to_string(), 1000)
                .unwrap();
        assert_eq!(provider.user_endpoint(), "https://abc.supabase.co/auth/v1/user");
        assert!(SupabaseIdentityProvider::new("ftp://x", "key".to_string(), 1000).is_err());
        assert!(SupabaseIdentityProvider::new("https://x", " ".to_string(), 1000).is_err());
    }
}
