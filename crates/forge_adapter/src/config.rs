#![forbid(unsafe_code)]

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forge_engines::backend::{BuildBackend, ContextStore, IdentityProvider};
use forge_engines::gcp::{GcpBackend, GcpBackendConfig, GcpTokenSource};
use forge_engines::identity::{StaticIdentityProvider, SupabaseIdentityProvider};
use forge_engines::memory::InMemoryBackend;
use forge_os::system_time_now_ns;
use forge_storage::store::ForgeStore;
use tracing::{info, warn};

use crate::{AdapterRuntime, RuntimeSettings, DEFAULT_CONTEXT_BUCKET, DEFAULT_TEMPLATE_DIR};

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_HTTP_TIMEOUT_MS: u32 = 30_000;
pub const DEFAULT_GCP_POLL_INTERVAL_MS: u64 = 2_000;
const BUILD_DEADLINE_SECS_RANGE: std::ops::RangeInclusive<u64> = 1..=86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSelection {
    Memory,
    Gcp {
        project: String,
        location: String,
        repository: String,
        /// `None` fetches tokens from the instance metadata server.
        access_token: Option<String>,
        poll_interval: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySelection {
    /// `token=owner,...`
    Static(String),
    Supabase { url: String, api_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    pub bind: SocketAddr,
    pub backend: BackendSelection,
    pub identity: IdentitySelection,
    pub store_path: Option<PathBuf>,
    pub http_timeout_ms: u32,
    pub runtime: RuntimeSettings,
}

impl AdapterConfig {
    pub fn from_env() -> Result<Self, String> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, String>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |key: &str| {
            env_getter(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let bind: SocketAddr = parse_or("FORGE_HTTP_BIND", get("FORGE_HTTP_BIND"), || {
            DEFAULT_HTTP_BIND.to_string()
        })?;
        let http_timeout_ms: u32 = parse_or("FORGE_HTTP_TIMEOUT_MS", get("FORGE_HTTP_TIMEOUT_MS"), || {
            DEFAULT_HTTP_TIMEOUT_MS.to_string()
        })?;
        if http_timeout_ms == 0 {
            return Err("FORGE_HTTP_TIMEOUT_MS must be > 0".to_string());
        }
        let quota_limit: u64 = parse_or("FORGE_QUOTA_LIMIT", get("FORGE_QUOTA_LIMIT"), || {
            forge_engines::quota::DEFAULT_QUOTA_LIMIT.to_string()
        })?;
        let image_cap: usize = parse_or("FORGE_IMAGE_CAP", get("FORGE_IMAGE_CAP"), || {
            forge_os::DEFAULT_IMAGE_CAP.to_string()
        })?;
        if image_cap == 0 {
            return Err("FORGE_IMAGE_CAP must be > 0".to_string());
        }
        let deadline_secs: u64 = parse_or(
            "FORGE_BUILD_DEADLINE_SECS",
            get("FORGE_BUILD_DEADLINE_SECS"),
            || forge_os::DEFAULT_BUILD_DEADLINE_SECS.to_string(),
        )?;
        if !BUILD_DEADLINE_SECS_RANGE.contains(&deadline_secs) {
            return Err(format!(
                "FORGE_BUILD_DEADLINE_SECS must be within 1..=86400, got {deadline_secs}"
            ));
        }
        let template_dir = get("FORGE_TEMPLATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEMPLATE_DIR));
        let store_path = get("FORGE_STORE_PATH").map(PathBuf::from);

        let backend_label = get("FORGE_BACKEND").unwrap_or_else(|| "memory".to_string());
        let backend = match backend_label.to_ascii_lowercase().as_str() {
            "memory" => BackendSelection::Memory,
            "gcp" => {
                let poll_ms: u64 = parse_or(
                    "FORGE_GCP_POLL_INTERVAL_MS",
                    get("FORGE_GCP_POLL_INTERVAL_MS"),
                    || DEFAULT_GCP_POLL_INTERVAL_MS.to_string(),
                )?;
                if poll_ms == 0 {
                    return Err("FORGE_GCP_POLL_INTERVAL_MS must be > 0".to_string());
                }
                BackendSelection::Gcp {
                    project: required("FORGE_GCP_PROJECT", get("FORGE_GCP_PROJECT"))?,
                    location: required("FORGE_GCP_LOCATION", get("FORGE_GCP_LOCATION"))?,
                    repository: required("FORGE_GCP_REPOSITORY", get("FORGE_GCP_REPOSITORY"))?,
                    access_token: get("FORGE_GCP_ACCESS_TOKEN"),
                    poll_interval: Duration::from_millis(poll_ms),
                }
            }
            other => {
                return Err(format!(
                    "FORGE_BACKEND must be 'memory' or 'gcp', got '{other}'"
                ))
            }
        };
        let context_bucket = match (&backend, get("FORGE_CONTEXT_BUCKET")) {
            (_, Some(bucket)) => bucket,
            (BackendSelection::Memory, None) => DEFAULT_CONTEXT_BUCKET.to_string(),
            (BackendSelection::Gcp { .. }, None) => {
                return Err("FORGE_CONTEXT_BUCKET is required for the gcp backend".to_string())
            }
        };

        let identity = match (get("SUPABASE_URL"), get("SUPABASE_KEY")) {
            (Some(url), Some(api_key)) => IdentitySelection::Supabase { url, api_key },
            (Some(_), None) => return Err("SUPABASE_KEY is required with SUPABASE_URL".to_string()),
            (None, _) => IdentitySelection::Static(get("FORGE_STATIC_TOKENS").unwrap_or_default()),
        };

        Ok(Self {
            bind,
            backend,
            identity,
            store_path,
            http_timeout_ms,
            runtime: RuntimeSettings {
                quota_limit,
                image_cap,
                build_deadline: Duration::from_secs(deadline_secs),
                template_dir,
                context_bucket,
            },
        })
    }
}

fn parse_or<T, D>(key: &str, value: Option<String>, default: D) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    D: FnOnce() -> String,
{
    let raw = value.unwrap_or_else(default);
    raw.parse::<T>()
        .map_err(|err| format!("{key}='{raw}' is invalid: {err}"))
}

fn required(key: &str, value: Option<String>) -> Result<String, String> {
    value.ok_or_else(|| format!("{key} is required"))
}

impl AdapterRuntime {
    /// Builds every collaborator named by `config`. Errors here are startup
    /// failures.
    pub fn from_config(config: &AdapterConfig) -> Result<Self, String> {
        let store = match &config.store_path {
            Some(path) => ForgeStore::open_with_journal(path.clone(), system_time_now_ns())
                .map_err(|err| format!("failed to open store: {err}"))?,
            None => ForgeStore::new_in_memory(),
        };
        let store = Arc::new(Mutex::new(store));

        let (backend, context_store): (Arc<dyn BuildBackend>, Arc<dyn ContextStore>) =
            match &config.backend {
                BackendSelection::Memory => {
                    warn!("using in-memory build backend; images do not outlive the process");
                    let backend = Arc::new(InMemoryBackend::default());
                    let build: Arc<dyn BuildBackend> = backend.clone();
                    let context: Arc<dyn ContextStore> = backend;
                    (build, context)
                }
                BackendSelection::Gcp {
                    project,
                    location,
                    repository,
                    access_token,
                    poll_interval,
                } => {
                    let tokens = match access_token {
                        Some(token) => GcpTokenSource::fixed(token.clone()),
                        None => GcpTokenSource::metadata_server(config.http_timeout_ms)?,
                    };
                    let backend = Arc::new(GcpBackend::new(
                        GcpBackendConfig {
                            project: project.clone(),
                            location: location.clone(),
                            repository: repository.clone(),
                            http_timeout_ms: config.http_timeout_ms,
                            poll_interval: *poll_interval,
                            operation_timeout: config.runtime.build_deadline,
                        },
                        tokens,
                    )?);
                    let build: Arc<dyn BuildBackend> = backend.clone();
                    let context: Arc<dyn ContextStore> = backend;
                    (build, context)
                }
            };

        let identity: Arc<dyn IdentityProvider> = match &config.identity {
            IdentitySelection::Static(table) => {
                let provider = StaticIdentityProvider::parse_table(table)?;
                if provider.is_empty() {
                    warn!("no static tokens configured; every request will be rejected");
                }
                Arc::new(provider)
            }
            IdentitySelection::Supabase { url, api_key } => Arc::new(
                SupabaseIdentityProvider::new(url, api_key.clone(), config.http_timeout_ms)?,
            ),
        };

        info!(
            backend = backend.name(),
            image_repository = backend.image_repository(),
            quota_limit = config.runtime.quota_limit,
            image_cap = config.runtime.image_cap,
            build_deadline_secs = config.runtime.build_deadline.as_secs(),
            "adapter runtime configured"
        );
        Ok(Self::new(
            store,
            identity,
            backend,
            context_store,
            config.runtime.clone(),
        ))
    }
}
