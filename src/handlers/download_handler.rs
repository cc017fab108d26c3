use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::{
    models::{Cluster, ErrorResponse, ImageCreateParams},
    services::inventory_service::KUBECONFIG,
    AppState,
};

type HandlerError = (StatusCode, Json<ErrorResponse>);

fn file_response(file_name: &str, data: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={}", file_name),
            ),
        ],
        data,
    )
        .into_response()
}

pub async fn generate_cluster_iso(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Json(params): Json<ImageCreateParams>,
) -> Result<(StatusCode, Json<Cluster>), HandlerError> {
    match state.inventory.generate_cluster_iso(cluster_id, params).await {
        Ok(cluster) => Ok((StatusCode::CREATED, Json(cluster))),
        Err(e) => {
            tracing::error!("Failed to generate image for cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

pub async fn download_cluster_iso(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
) -> Result<Response, HandlerError> {
    match state.inventory.download_cluster_iso(cluster_id).await {
        Ok((file_name, data)) => Ok(file_response(&file_name, data)),
        Err(e) => {
            tracing::error!("Failed to download image of cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct FileQuery {
    pub file_name: String,
}

pub async fn download_cluster_files(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Query(query): Query<FileQuery>,
) -> Result<Response, HandlerError> {
    match state
        .inventory
        .download_cluster_file(cluster_id, &query.file_name)
        .await
    {
        Ok(data) => Ok(file_response(&query.file_name, data)),
        Err(e) => {
            tracing::error!(
                "Failed to download file {} of cluster {}: {}",
                query.file_name,
                cluster_id,
                e
            );
            Err(e.into())
        }
    }
}

pub async fn get_presigned_for_cluster_files(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Query(query): Query<FileQuery>,
) -> Result<Json<serde_json::Value>, HandlerError> {
    match state
        .inventory
        .presigned_cluster_file_url(cluster_id, &query.file_name)
        .await
    {
        Ok(url) => Ok(Json(json!({ "url": url }))),
        Err(e) => Err(e.into()),
    }
}

pub async fn download_cluster_kubeconfig(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
) -> Result<Response, HandlerError> {
    match state
        .inventory
        .download_cluster_file(cluster_id, KUBECONFIG)
        .await
    {
        Ok(data) => Ok(file_response(KUBECONFIG, data)),
        Err(e) => Err(e.into()),
    }
}

/// The ingress certificate arrives as a PEM text body and is merged
/// into the stored kubeconfig.
pub async fn upload_cluster_ingress_cert(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    body: String,
) -> Result<StatusCode, HandlerError> {
    match state.inventory.upload_ingress_cert(cluster_id, &body).await {
        Ok(()) => Ok(StatusCode::CREATED),
        Err(e) => {
            tracing::error!(
                "Failed to upload ingress certificate for cluster {}: {}",
                cluster_id,
                e
            );
            Err(e.into())
        }
    }
}
