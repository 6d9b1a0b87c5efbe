//! Operator-initiated replay.
//!
//! Re-inserts pending attempts for an existing event against the routes
//! that currently match. Terminated attempts are never resurrected; replay
//! adds fresh rows at `now()`.

use axum::{
    extract::{Path, State},
    Json,
};
use hookline_core::EventId;
use uuid::Uuid;

use super::ingest::IngestResponse;
use crate::{error::ApiError, AppState};

/// `POST /events/{id}/replay`.
pub async fn replay_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<IngestResponse>, ApiError> {
    let outcome = state.storage.events.replay(EventId::from(id)).await.map_err(ApiError::from)?;

    Ok(Json(IngestResponse {
        event_id: outcome.event_id.to_string(),
        attempts_created: outcome.attempts_created,
    }))
}
