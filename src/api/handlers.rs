use std::convert::Infallible;

use chrono::{DateTime, Utc};
use serde::Serialize;
use warp::{http::StatusCode, reply, Reply};

use crate::orchestrator::Orchestrator;
use crate::shimlet::ShimletError;
use crate::types::{RequirementSpec, ServicePhase};

use super::envelope::Envelope;
use super::AppState;

#[derive(Debug, thiserror::Error)]
pub(super) enum Error {
    #[error("shimlet error: {0}")]
    Shimlet(#[from] ShimletError),
}

impl Error {
    fn into_response(self) -> reply::Response {
        match self {
            Error::Shimlet(ShimletError::Validation(msg)) => {
                json_error(StatusCode::BAD_REQUEST, 400, msg)
            }
            Error::Shimlet(ShimletError::Adapter(msg)) => {
                tracing::warn!(error = %msg, "adapter error serving request");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, 500, "internal error")
            }
            Error::Shimlet(ShimletError::Permanent(msg)) => {
                tracing::warn!(error = %msg, "adapter permanently rejected request");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, 500, "internal error")
            }
        }
    }
}

// Used in place of `?` so handler errors turn into envelopes, not warp rejections.
macro_rules! api_try {
    ($expr:expr) => {
        match $expr {
            Ok(val) => val,
            Err(err) => return Ok(Error::from(err).into_response()),
        }
    };
}

#[derive(Serialize)]
struct ServiceId {
    #[serde(rename = "serviceId")]
    service_id: String,
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(rename = "serviceId")]
    service_id: String,
    status: ServicePhase,
    endpoint: String,
    #[serde(rename = "updateTime")]
    update_time: DateTime<Utc>,
}

#[derive(Serialize)]
struct ModelEntry {
    #[serde(rename = "modelName")]
    model_name: String,
    #[serde(rename = "modelPath")]
    model_path: String,
}

#[tracing::instrument(skip(state, spec), level = "debug")]
pub(super) async fn deploy(
    spec: RequirementSpec,
    state: AppState,
) -> Result<reply::Response, Infallible> {
    // An empty modelName is accepted here and parked failed downstream by
    // the reconciler, once resolve-model-path and the apply goal run it
    // through the same rejection path as any other unsatisfiable spec.
    let service_id = state.orchestrator.provision(spec);
    Ok(ok_response(ServiceId { service_id }))
}

#[tracing::instrument(skip(state, spec), level = "debug")]
pub(super) async fn update(
    service_id: String,
    mut spec: RequirementSpec,
    state: AppState,
) -> Result<reply::Response, Infallible> {
    spec.service_id = service_id;
    let service_id = state.orchestrator.provision(spec);
    Ok(ok_response(ServiceId { service_id }))
}

#[tracing::instrument(skip(state), level = "debug")]
pub(super) async fn delete(
    service_id: String,
    state: AppState,
) -> Result<reply::Response, Infallible> {
    state.orchestrator.delete(&service_id);
    Ok(ok_response(ServiceId { service_id }))
}

#[tracing::instrument(skip(state), level = "debug")]
pub(super) async fn status(
    service_id: String,
    state: AppState,
) -> Result<reply::Response, Infallible> {
    let status = api_try!(state.orchestrator.status(&service_id).await);
    Ok(ok_response(StatusResponse {
        service_id,
        status: status.status,
        endpoint: status.end_point,
        update_time: Utc::now(),
    }))
}

#[tracing::instrument(skip(state), level = "debug")]
pub(super) async fn list_models(state: AppState) -> Result<reply::Response, Infallible> {
    let mut entries = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(&state.model_root).await {
        Ok(rd) => rd,
        Err(err) => {
            tracing::warn!(model_root = %state.model_root, error = %err, "failed to list model root");
            return Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                500,
                "failed to list models",
            ));
        }
    };
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
            let model_name = entry.file_name().to_string_lossy().into_owned();
            let model_path = entry.path().to_string_lossy().into_owned();
            entries.push(ModelEntry {
                model_name,
                model_path,
            });
        }
    }
    Ok(ok_response(entries))
}

fn ok_response<T: Serialize>(data: T) -> reply::Response {
    reply::with_status(reply::json(&Envelope::ok(data)), StatusCode::OK).into_response()
}

fn json_error(status: StatusCode, code: i32, message: impl Into<String>) -> reply::Response {
    reply::with_status(reply::json(&Envelope::<()>::err(code, message)), status).into_response()
}
