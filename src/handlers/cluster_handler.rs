use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    models::{
        Cluster, ClusterWithHosts, CompleteInstallationRequest, CreateClusterRequest, Credentials,
        ErrorResponse, Event, UpdateClusterRequest,
    },
    AppState,
};

type HandlerError = (StatusCode, Json<ErrorResponse>);

pub async fn register_cluster(
    State(state): State<AppState>,
    Json(params): Json<CreateClusterRequest>,
) -> Result<(StatusCode, Json<Cluster>), HandlerError> {
    match state
        .inventory
        .register_cluster(params, "admin".to_string(), String::new())
    {
        Ok(cluster) => Ok((StatusCode::CREATED, Json(cluster))),
        Err(e) => {
            tracing::error!("Failed to register cluster: {}", e);
            Err(e.into())
        }
    }
}

pub async fn list_clusters(
    State(state): State<AppState>,
) -> Result<Json<Vec<Cluster>>, HandlerError> {
    Ok(Json(state.inventory.list_clusters()))
}

pub async fn get_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
) -> Result<Json<ClusterWithHosts>, HandlerError> {
    match state.inventory.get_cluster(cluster_id) {
        Ok(cluster) => Ok(Json(cluster)),
        Err(e) => Err(e.into()),
    }
}

pub async fn update_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Json(params): Json<UpdateClusterRequest>,
) -> Result<(StatusCode, Json<ClusterWithHosts>), HandlerError> {
    match state.inventory.update_cluster(cluster_id, params).await {
        Ok(cluster) => Ok((StatusCode::CREATED, Json(cluster))),
        Err(e) => {
            tracing::error!("Failed to update cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

pub async fn deregister_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
) -> Result<StatusCode, HandlerError> {
    match state.inventory.deregister_cluster(cluster_id).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            tracing::error!("Failed to deregister cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

pub async fn install_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Cluster>), HandlerError> {
    match state.inventory.install_cluster(cluster_id).await {
        Ok(cluster) => Ok((StatusCode::ACCEPTED, Json(cluster))),
        Err(e) => {
            tracing::error!("Failed to install cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

pub async fn cancel_installation(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Cluster>), HandlerError> {
    match state.inventory.cancel_installation(cluster_id).await {
        Ok(cluster) => Ok((StatusCode::ACCEPTED, Json(cluster))),
        Err(e) => {
            tracing::error!("Failed to cancel installation of cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

pub async fn reset_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
) -> Result<(StatusCode, Json<Cluster>), HandlerError> {
    match state.inventory.reset_cluster(cluster_id).await {
        Ok(cluster) => Ok((StatusCode::ACCEPTED, Json(cluster))),
        Err(e) => {
            tracing::error!("Failed to reset cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

pub async fn complete_installation(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Json(params): Json<CompleteInstallationRequest>,
) -> Result<(StatusCode, Json<Cluster>), HandlerError> {
    match state.inventory.complete_installation(cluster_id, params).await {
        Ok(cluster) => Ok((StatusCode::ACCEPTED, Json(cluster))),
        Err(e) => {
            tracing::error!("Failed to complete installation of cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

pub async fn get_credentials(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
) -> Result<Json<Credentials>, HandlerError> {
    match state.inventory.get_credentials(cluster_id).await {
        Ok(credentials) => Ok(Json(credentials)),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct FreeAddressesQuery {
    pub network: String,
    pub prefix: Option<String>,
    pub limit: Option<i64>,
}

pub async fn get_free_addresses(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Query(query): Query<FreeAddressesQuery>,
) -> Result<Json<Vec<String>>, HandlerError> {
    match state.inventory.get_free_addresses(
        cluster_id,
        &query.network,
        query.prefix.as_deref(),
        query.limit,
    ) {
        Ok(addresses) => Ok(Json(addresses)),
        Err(e) => {
            tracing::warn!("Failed to get free addresses of cluster {}: {}", cluster_id, e);
            Err(e.into())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub host_id: Option<Uuid>,
}

pub async fn list_events(
    State(state): State<AppState>,
    Path(cluster_id): Path<Uuid>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<Event>>, HandlerError> {
    match state.inventory.list_events(cluster_id, query.host_id) {
        Ok(events) => Ok(Json(events)),
        Err(e) => Err(e.into()),
    }
}
