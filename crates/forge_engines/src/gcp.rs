#![forbid(unsafe_code)]

//! Google Cloud adapter: Artifact Registry for listing and deletes, Cloud
//! Build for builds and Cloud Storage for staged contexts, all over REST.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use forge_kernel_contracts::build::{BuildOutcome, BuildSpec, BuildStep};
use forge_kernel_contracts::registry::{ImageRef, TagRef, VersionRef};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::backend::{BackendError, BuildBackend, ContextStore};
use crate::http::{
    backend_error_from_rpc_code, backend_error_from_ureq, build_http_agent, FORGE_USER_AGENT,
};

pub const ARTIFACT_REGISTRY_API: &str = "https://artifactregistry.googleapis.com/v1";
pub const CLOUD_BUILD_API: &str = "https://cloudbuild.googleapis.com/v1";
pub const STORAGE_UPLOAD_API: &str = "https://storage.googleapis.com/upload/storage/v1";
pub const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
pub const CLOUD_BUILDER_DOCKER: &str = "gcr.io/cloud-builders/docker";
pub const CLOUD_BUILD_LOGGING: &str = "CLOUD_LOGGING_ONLY";

const LIST_PAGE_SIZE: &str = "500";
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcpBackendConfig {
    pub project: String,
    pub location: String,
    pub repository: String,
    pub http_timeout_ms: u32,
    pub poll_interval: Duration,
    /// Upper bound on waiting for one long-running operation.
    pub operation_timeout: Duration,
}

impl GcpBackendConfig {
    pub fn repository_parent(&self) -> String {
        format!(
            "projects/{}/locations/{}/repositories/{}",
            self.project, self.location, self.repository
        )
    }

    pub fn image_repository(&self) -> String {
        format!(
            "{}-docker.pkg.dev/{}/{}",
            self.location, self.project, self.repository
        )
    }

    fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("project", &self.project),
            ("location", &self.location),
            ("repository", &self.repository),
        ] {
            if value.trim().is_empty() {
                return Err(format!("gcp {field} must not be empty"));
            }
            if value.contains('/') {
                return Err(format!("gcp {field} must not contain '/'"));
            }
        }
        if self.poll_interval.is_zero() {
            return Err("gcp poll interval must be > 0".to_string());
        }
        Ok(())
    }
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

enum TokenSourceKind {
    Fixed(String),
    MetadataServer {
        agent: ureq::Agent,
        cached: Mutex<Option<CachedToken>>,
    },
}

/// OAuth access tokens for the REST calls.
pub struct GcpTokenSource {
    kind: TokenSourceKind,
}

impl fmt::Debug for GcpTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TokenSourceKind::Fixed(_) => "fixed",
            TokenSourceKind::MetadataServer { .. } => "metadata_server",
        };
        f.debug_struct("GcpTokenSource").field("kind", &kind).finish()
    }
}

impl GcpTokenSource {
    pub fn fixed(token: String) -> Self {
        Self {
            kind: TokenSourceKind::Fixed(token),
        }
    }

    pub fn metadata_server(timeout_ms: u32) -> Result<Self, String> {
        Ok(Self {
            kind: TokenSourceKind::MetadataServer {
                agent: build_http_agent(timeout_ms, FORGE_USER_AGENT)?,
                cached: Mutex::new(None),
            },
        })
    }

    pub fn access_token(&self) -> Result<String, BackendError> {
        let (agent, cached) = match &self.kind {
            TokenSourceKind::Fixed(token) => return Ok(token.clone()),
            TokenSourceKind::MetadataServer { agent, cached } => (agent, cached),
        };
        let mut cached = cached
            .lock()
            .map_err(|_| BackendError::Unavailable("token cache lock poisoned".to_string()))?;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
        }
        let body: Value = agent
            .get(METADATA_TOKEN_URL)
            .set("Metadata-Flavor", "Google")
            .call()
            .map_err(|err| backend_error_from_ureq("metadata token", err))?
            .into_json()
            .map_err(|err| BackendError::Protocol(format!("metadata token payload: {err}")))?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Protocol("metadata token has no access_token".into()))?
            .to_string();
        let expires_in = body.get("expires_in").and_then(Value::as_u64).unwrap_or(0);
        let lifetime = Duration::from_secs(expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(CachedToken {
            token: token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        debug!(expires_in, "refreshed gcp access token");
        Ok(token)
    }
}

#[derive(Debug)]
pub struct GcpBackend {
    config: GcpBackendConfig,
    repository_parent: String,
    image_repository: String,
    agent: ureq::Agent,
    tokens: GcpTokenSource,
}

impl GcpBackend {
    pub fn new(config: GcpBackendConfig, tokens: GcpTokenSource) -> Result<Self, String> {
        config.validate()?;
        Ok(Self {
            repository_parent: config.repository_parent(),
            image_repository: config.image_repository(),
            agent: build_http_agent(config.http_timeout_ms, FORGE_USER_AGENT)?,
            config,
            tokens,
        })
    }

    pub fn config(&self) -> &GcpBackendConfig {
        &self.config
    }

    fn bearer(&self) -> Result<String, BackendError> {
        Ok(format!("Bearer {}", self.tokens.access_token()?))
    }

    fn get_json(
        &self,
        context: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, BackendError> {
        let mut request = self
            .agent
            .get(url)
            .set("Authorization", &self.bearer()?)
            .set("Accept", "application/json");
        for (key, value) in query {
            request = request.query(key, value);
        }
        let response = request
            .call()
            .map_err(|err| backend_error_from_ureq(context, err))?;
        read_json(context, response)
    }

    fn delete_json(&self, context: &str, url: &str) -> Result<Value, BackendError> {
        let response = self
            .agent
            .delete(url)
            .set("Authorization", &self.bearer()?)
            .set("Accept", "application/json")
            .call()
            .map_err(|err| backend_error_from_ureq(context, err))?;
        read_json(context, response)
    }

    fn post_json(&self, context: &str, url: &str, body: &Value) -> Result<Value, BackendError> {
        let response = self
            .agent
            .post(url)
            .set("Authorization", &self.bearer()?)
            .set("Accept", "application/json")
            .send_json(body.clone())
            .map_err(|err| backend_error_from_ureq(context, err))?;
        read_json(context, response)
    }

    /// Polls until `done`; the finished operation is returned as-is.
    fn wait_for_operation(
        &self,
        api_base: &str,
        mut operation: Value,
        context: &str,
    ) -> Result<Value, BackendError> {
        let started = Instant::now();
        loop {
            if operation.get("done").and_then(Value::as_bool) == Some(true) {
                return Ok(operation);
            }
            let name = operation
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| BackendError::Protocol(format!("{context}: operation has no name")))?
                .to_string();
            if started.elapsed() >= self.config.operation_timeout {
                return Err(BackendError::Unavailable(format!(
                    "{context}: operation {name} still running after {}s",
                    self.config.operation_timeout.as_secs()
                )));
            }
            thread::sleep(self.config.poll_interval);
            operation = self.get_json(context, &format!("{api_base}/{name}"), &[])?;
        }
    }
}

impl BuildBackend for GcpBackend {
    fn name(&self) -> &'static str {
        "gcp"
    }

    fn repository_parent(&self) -> &str {
        &self.repository_parent
    }

    fn image_repository(&self) -> &str {
        &self.image_repository
    }

    fn requires_staged_context(&self) -> bool {
        true
    }

    fn list_images(&self) -> Result<Vec<ImageRef>, BackendError> {
        let url = format!("{ARTIFACT_REGISTRY_API}/{}/dockerImages", self.repository_parent);
        let mut images = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![("pageSize", LIST_PAGE_SIZE)];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }
            let page = self.get_json("list docker images", &url, &query)?;
            let (page_images, next) = docker_images_from_page(&page)?;
            images.extend(page_images);
            match next {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        debug!(count = images.len(), "listed artifact registry images");
        Ok(images)
    }

    fn delete_tag(&self, tag: &TagRef) -> Result<(), BackendError> {
        let resource = tag.resource_name(&self.repository_parent);
        self.delete_json("delete tag", &format!("{ARTIFACT_REGISTRY_API}/{resource}"))?;
        Ok(())
    }

    fn delete_version(&self, version: &VersionRef) -> Result<(), BackendError> {
        let resource = version.resource_name(&self.repository_parent);
        let operation =
            self.delete_json("delete version", &format!("{ARTIFACT_REGISTRY_API}/{resource}"))?;
        let finished = self.wait_for_operation(ARTIFACT_REGISTRY_API, operation, "delete version")?;
        match operation_error(&finished) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn submit(&self, spec: &BuildSpec) -> Result<BuildOutcome, BackendError> {
        let body = build_request_body(spec);
        let url = format!(
            "{CLOUD_BUILD_API}/projects/{}/locations/{}/builds",
            self.config.project, self.config.location
        );
        info!(image = %spec.image_tag, "submitting cloud build");
        let operation = self.post_json("create build", &url, &body)?;
        let finished = self.wait_for_operation(CLOUD_BUILD_API, operation, "build")?;
        Ok(build_outcome_from_operation(spec, &finished))
    }
}

impl ContextStore for GcpBackend {
    fn upload(&self, bucket: &str, object: &str, archive: &Path) -> Result<(), BackendError> {
        let bytes = fs::read(archive).map_err(|err| {
            BackendError::Unavailable(format!("read {}: {err}", archive.display()))
        })?;
        let url = format!("{STORAGE_UPLOAD_API}/b/{bucket}/o");
        self.agent
            .post(&url)
            .set("Authorization", &self.bearer()?)
            .set("Content-Type", "application/gzip")
            .query("uploadType", "media")
            .query("name", object)
            .send_bytes(&bytes)
            .map_err(|err| backend_error_from_ureq("upload build context", err))?;
        debug!(bucket, object, size = bytes.len(), "uploaded build context");
        Ok(())
    }
}

fn read_json(context: &str, response: ureq::Response) -> Result<Value, BackendError> {
    let text = response
        .into_string()
        .map_err(|err| BackendError::Protocol(format!("{context}: unreadable body: {err}")))?;
    if text.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(&text)
        .map_err(|err| BackendError::Protocol(format!("{context}: invalid json: {err}")))
}

fn operation_error(operation: &Value) -> Option<BackendError> {
    let error = operation.get("error")?;
    let code = error.get("code").and_then(Value::as_i64).unwrap_or(2);
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("operation failed")
        .to_string();
    Some(backend_error_from_rpc_code(code, message))
}

/// Cloud Build request carrying the ordered build and push steps.
pub fn build_request_body(spec: &BuildSpec) -> Value {
    let steps: Vec<Value> = spec
        .steps
        .iter()
        .map(|step| match step {
            BuildStep::BuildImage {
                image_tag,
                build_args,
                context_dir,
            } => {
                let mut args = vec!["build".to_string(), "-t".to_string(), image_tag.clone()];
                for (name, value) in build_args {
                    args.push("--build-arg".to_string());
                    args.push(format!("{name}={value}"));
                }
                args.push(".".to_string());
                json!({"name": CLOUD_BUILDER_DOCKER, "args": args, "dir": context_dir})
            }
            BuildStep::PushImage { image_tag } => {
                json!({"name": CLOUD_BUILDER_DOCKER, "args": ["push", image_tag]})
            }
        })
        .collect();
    let mut body = json!({
        "steps": steps,
        "images": [spec.image_tag],
        "options": {"logging": CLOUD_BUILD_LOGGING},
    });
    if let (Some(source), Some(obj)) = (spec.source.as_ref(), body.as_object_mut()) {
        obj.insert(
            "source".to_string(),
            json!({"storageSource": {"bucket": source.bucket, "object": source.object}}),
        );
    }
    body
}

fn build_outcome_from_operation(spec: &BuildSpec, operation: &Value) -> BuildOutcome {
    let build = operation.get("response");
    let status = build
        .and_then(|b| b.get("status"))
        .and_then(Value::as_str);
    match status {
        Some("SUCCESS") => BuildOutcome::Succeeded {
            image: spec.image_tag.clone(),
        },
        Some(other) => {
            let detail = build
                .and_then(|b| b.get("statusDetail"))
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("build finished with status {other}"));
            BuildOutcome::Failed { detail }
        }
        None => {
            let detail = operation
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("build operation finished without a result")
                .to_string();
            warn!(image = %spec.image_tag, %detail, "build operation has no build status");
            BuildOutcome::Failed { detail }
        }
    }
}

/// One `dockerImages` page: images and the next page token, if any.
pub fn docker_images_from_page(
    page: &Value,
) -> Result<(Vec<ImageRef>, Option<String>), BackendError> {
    let mut images = Vec::new();
    let items = page
        .get("dockerImages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for item in items {
        let uri = item
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Protocol("docker image without uri".to_string()))?;
        let tags: BTreeSet<String> = item
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let upload_time = item
            .get("uploadTime")
            .and_then(Value::as_str)
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|err| {
                        BackendError::Protocol(format!("bad uploadTime '{raw}': {err}"))
                    })
            })
            .transpose()?
            .unwrap_or_default();
        let image = ImageRef::v1(uri.to_string(), tags, upload_time)
            .map_err(|err| BackendError::Protocol(format!("docker image '{uri}': {err}")))?;
        images.push(image);
    }
    let next = page
        .get("nextPageToken")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    Ok((images, next))
}
