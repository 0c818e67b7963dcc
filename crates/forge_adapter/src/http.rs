#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use forge_kernel_contracts::deletion::DeletionReport;
use forge_kernel_contracts::deploy::DeployScriptRequest;
use tracing::{error, warn};

use crate::{
    AdapterError, AdapterRuntime, BuildAccepted, BuildRequest,
    BuildStatusResponse, ImageListResponse,
};

pub type SharedRuntime = Arc<AdapterRuntime>;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error: String,
    pub detail: String,
}

impl From<&AdapterError> for ErrorResponse {
    fn from(err: &AdapterError) -> Self {
        Self {
            status: "error".to_string(),
            error: err.code().to_string(),
            detail: err.to_string(),
        }
    }
}

impl IntoResponse for AdapterError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(code = self.code(), error = %self, "request rejected");
        }
        (status, Json(ErrorResponse::from(&self))).into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct JobQuery {
    #[serde(alias = "questionnaire_id")]
    pub job_id: String,
    #[serde(default)]
    pub tag: Option<String>,
}

pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/build/:job_id", post(submit_build))
        .route("/build_status", get(build_status))
        .route("/list", get(list_images))
        .route("/delete_image", delete(delete_images))
        .route("/generate_deploy_script", post(generate_deploy_script))
        .with_state(runtime)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim().to_string())
}

/// Runs identity resolution and registry calls off the async workers.
async fn run_blocking<T, F>(runtime: SharedRuntime, work: F) -> Result<T, AdapterError>
where
    T: Send + 'static,
    F: FnOnce(&AdapterRuntime) -> Result<T, AdapterError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || work(&*runtime))
        .await
        .map_err(|err| AdapterError::Internal(format!("request worker failed: {err}")))?
}

async fn healthz(State(runtime): State<SharedRuntime>) -> Response {
    match runtime.health_report() {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn submit_build(
    State(runtime): State<SharedRuntime>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<BuildRequest>,
) -> Result<(StatusCode, Json<BuildAccepted>), AdapterError> {
    let token = bearer_token(&headers);
    let owner_id = run_blocking(runtime.clone(), move |rt| rt.authenticate(token.as_deref())).await?;
    let accepted = runtime.submit_build(&owner_id, &job_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn build_status(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Query(query): Query<JobQuery>,
) -> Result<Json<BuildStatusResponse>, AdapterError> {
    let token = bearer_token(&headers);
    run_blocking(runtime, move |rt| {
        let owner_id = rt.authenticate(token.as_deref())?;
        rt.build_status(&owner_id, &query.job_id)
    })
    .await
    .map(Json)
}

async fn list_images(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Query(query): Query<JobQuery>,
) -> Result<Json<ImageListResponse>, AdapterError> {
    let token = bearer_token(&headers);
    run_blocking(runtime, move |rt| {
        let owner_id = rt.authenticate(token.as_deref())?;
        rt.list_images(&owner_id, &query.job_id)
    })
    .await
    .map(Json)
}

async fn delete_images(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Query(query): Query<JobQuery>,
) -> Result<(StatusCode, Json<DeletionReport>), AdapterError> {
    let token = bearer_token(&headers);
    let report = run_blocking(runtime, move |rt| {
        let owner_id = rt.authenticate(token.as_deref())?;
        rt.delete_images(&owner_id, &query.job_id, query.tag.as_deref())
    })
    .await?;
    let status = match report {
        DeletionReport::PartialFailure { .. } => StatusCode::MULTI_STATUS,
        DeletionReport::NoImagesFound { .. } | DeletionReport::Success { .. } => StatusCode::OK,
    };
    Ok((status, Json(report)))
}

/// Unauthenticated: the script only embeds what the caller sent.
async fn generate_deploy_script(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<DeployScriptRequest>,
) -> Result<Response, AdapterError> {
    let script = runtime.deploy_script(&request)?;
    let headers = [
        (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", script.filename),
        ),
    ];
    Ok((StatusCode::OK, headers, script.body).into_response())
}
