//! Saga inspection.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::CorrelationId;
use saga::SagaView;

use crate::error::ApiError;
use crate::runtime::AppState;

/// GET /sagas/{correlation_id}: saga state with its compensation entries and
/// reservation mirror.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<CorrelationId>,
) -> Result<Json<SagaView>, ApiError> {
    Ok(Json(state.orders.saga(correlation_id).await?))
}
