use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use crate::{
    models::{ErrorResponse, StepReply, Steps},
    AppState,
};

type HandlerError = (StatusCode, Json<ErrorResponse>);

/// The agent poll: ordered instructions for the host's current state.
pub async fn get_next_steps(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Steps>, HandlerError> {
    match state.steps.get_next_steps(cluster_id, host_id).await {
        Ok(steps) => Ok(Json(steps)),
        Err(e) => {
            tracing::error!(
                "failed to get steps for host {} cluster {}: {}",
                host_id,
                cluster_id,
                e
            );
            Err(e.into())
        }
    }
}

pub async fn post_step_reply(
    State(state): State<AppState>,
    Path((cluster_id, host_id)): Path<(Uuid, Uuid)>,
    Json(reply): Json<StepReply>,
) -> Result<StatusCode, HandlerError> {
    match state.steps.post_step_reply(cluster_id, host_id, reply).await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e) => {
            tracing::error!(
                "failed to process step reply from host {} cluster {}: {}",
                host_id,
                cluster_id,
                e
            );
            Err(e.into())
        }
    }
}
