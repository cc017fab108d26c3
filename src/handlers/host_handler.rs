use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    models::{DebugStepRequest, ErrorResponse, Host, HostProgressReport, RegisterHostRequest},
    AppState,
};

type HandlerError = (StatusCode, Json<ErrorResponse>);

pub async fn register_host(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Json(params): Json<RegisterHostRequest>,
) -> Result<(StatusCode, Json<Host>), HandlerError> {
    match state.inventory.register_host(cluster_id, params).await {
        Ok(host) => Ok((StatusCode::CREATED, Json(host))),
        Err(e) => {
            tracing::error!("Failed to register host in cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

pub async fn list_hosts(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
) -> Result<Json<Vec<Host>>, HandlerError> {
    match state.inventory.list_hosts(cluster_id) {
        Ok(hosts) => Ok(Json(hosts)),
        Err(e) => Err(e.into()),
    }
}

pub async fn get_host(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Host>, HandlerError> {
    match state.inventory.get_host(cluster_id, host_id) {
        Ok(host) => Ok(Json(host)),
        Err(e) => Err(e.into()),
    }
}

pub async fn deregister_host(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, HandlerError> {
    match state.inventory.deregister_host(cluster_id, host_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            tracing::error!("Failed to deregister host {}: {}", host_id, e);
            Err(e.into())
        }
    }
}

pub async fn enable_host(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Host>, HandlerError> {
    match state.inventory.enable_host(cluster_id, host_id).await {
        Ok(host) => Ok(Json(host)),
        Err(e) => {
            tracing::error!("Failed to enable host {}: {}", host_id, e);
            Err(e.into())
        }
    }
}

pub async fn disable_host(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Host>, HandlerError> {
    match state.inventory.disable_host(cluster_id, host_id).await {
        Ok(host) => Ok(Json(host)),
        Err(e) => {
            tracing::error!("Failed to disable host {}: {}", host_id, e);
            Err(e.into())
        }
    }
}

pub async fn reset_host(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Host>, HandlerError> {
    match state.inventory.reset_host(cluster_id, host_id).await {
        Ok(host) => Ok(Json(host)),
        Err(e) => {
            tracing::error!("Failed to reset host {}: {}", host_id, e);
            Err(e.into())
        }
    }
}

pub async fn update_install_progress(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
    Json(progress): Json<HostProgressReport>,
) -> Result<StatusCode, HandlerError> {
    match state
        .inventory
        .update_host_install_progress(cluster_id, host_id, progress)
        .await
    {
        Ok(()) => Ok(StatusCode::OK),
        Err(e) => {
            tracing::error!("Failed to update progress of host {}: {}", host_id, e);
            Err(e.into())
        }
    }
}

pub async fn set_debug_step(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<DebugStepRequest>,
) -> Result<StatusCode, HandlerError> {
    match state
        .steps
        .set_debug_step(cluster_id, host_id, request.command)
        .await
    {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadLogsQuery {
    pub file_name: Option<String>,
}

pub async fn upload_host_logs(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<UploadLogsQuery>,
    body: Bytes,
) -> Result<StatusCode, HandlerError> {
    let file_name = query.file_name.unwrap_or_else(|| "logs.tar.gz".to_string());
    match state
        .inventory
        .upload_host_logs(cluster_id, host_id, &file_name, body.to_vec())
        .await
    {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            tracing::error!("Failed to upload logs of host {}: {}", host_id, e);
            Err(e.into())
        }
    }
}
