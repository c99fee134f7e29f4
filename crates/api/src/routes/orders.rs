//! Order reads and the upstream cancel/confirm signals.
//!
//! Neither signal changes the order directly. Both publish the matching
//! event under the order's correlation id and the saga applies it when it is
//! delivered.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use common::{CorrelationId, OrderId};
use saga::Order;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::runtime::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct OrderSignalResponse {
    pub order_id: OrderId,
    pub correlation_id: CorrelationId,
}

impl From<Order> for OrderSignalResponse {
    fn from(order: Order) -> Self {
        Self {
            order_id: order.order_id,
            correlation_id: order.correlation_id,
        }
    }
}

/// GET /orders/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Order>, ApiError> {
    Ok(Json(state.orders.order(order_id).await?))
}

/// POST /orders/{id}/cancel: request cancellation of a non-terminal order.
///
/// The body is optional; without a `reason` the cancellation is recorded as
/// `user_requested`.
#[tracing::instrument(skip(state, body))]
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<OrderId>,
    body: Bytes,
) -> Result<Json<OrderSignalResponse>, ApiError> {
    let req = parse_cancel_request(&body)?;
    let order = state.orders.cancel(order_id, req.reason).await?;
    Ok(Json(order.into()))
}

/// POST /orders/{id}/confirm: the upstream confirmation of a placed order.
#[tracing::instrument(skip(state))]
pub async fn confirm(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<OrderId>,
) -> Result<Json<OrderSignalResponse>, ApiError> {
    let order = state.orders.confirm(order_id).await?;
    Ok(Json(order.into()))
}

fn parse_cancel_request(body: &[u8]) -> Result<CancelRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(CancelRequest::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid cancel request: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_uses_default_reason() {
        assert!(parse_cancel_request(b"").unwrap().reason.is_none());
        assert!(parse_cancel_request(b" \n").unwrap().reason.is_none());
        assert!(parse_cancel_request(b"{}").unwrap().reason.is_none());
    }

    #[test]
    fn test_reason_is_read() {
        let req = parse_cancel_request(br#"{"reason":"changed_mind"}"#).unwrap();
        assert_eq!(req.reason.as_deref(), Some("changed_mind"));
    }

    #[test]
    fn test_malformed_body_is_rejected() {
        assert!(matches!(
            parse_cancel_request(b"{not json"),
            Err(ApiError::BadRequest(_))
        ));
    }
}
