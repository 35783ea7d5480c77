//! Lift ride submission endpoint.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Serialize;

use chairlift_core::metrics::increment;
use chairlift_core::{RidePath, validate_ride};

use crate::error::ApiError;
use crate::state::AppState;

/// Response for an accepted ride.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedResponse {
    status: &'static str,
    queue: String,
}

/// `POST /skiers/{resortID}/seasons/{seasonID}/days/{dayID}/skiers/{skierID}`
///
/// Validates the ride, then publishes it on the blocking pool since borrowing
/// a channel may wait.
pub async fn record_ride(
    State(state): State<AppState>,
    Path((resort_id, season_id, day_id, skier_id)): Path<(String, String, String, String)>,
    body: Bytes,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let path = RidePath {
        resort_id: &resort_id,
        season_id: &season_id,
        day_id: &day_id,
        skier_id: &skier_id,
    };
    let event = validate_ride(path, &body).inspect_err(|e| {
        increment("ingress_events_rejected_total", 1);
        tracing::debug!(error = %e, "rejected ride");
    })?;

    let gateway = state.gateway.clone();
    let accepted = tokio::task::spawn_blocking(move || gateway.accept(&event))
        .await
        .map_err(anyhow::Error::from)??;

    Ok((
        StatusCode::CREATED,
        Json(AcceptedResponse {
            status: "accepted",
            queue: accepted.queue,
        }),
    ))
}
