//! Cart endpoints and the checkout trigger.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use cart::Cart;
use common::{CartId, CorrelationId, LineItem, UserId};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::runtime::AppState;

#[derive(Deserialize)]
pub struct PutCartRequest {
    pub user_id: UserId,
    pub items: Vec<LineItem>,
}

#[derive(Serialize)]
pub struct CheckoutResponse {
    pub correlation_id: CorrelationId,
}

/// PUT /carts/{id}: replace the contents of an active cart.
#[tracing::instrument(skip(state, req))]
pub async fn put(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<CartId>,
    Json(req): Json<PutCartRequest>,
) -> Result<Json<Cart>, ApiError> {
    if req.items.iter().any(|item| item.quantity == 0) {
        return Err(ApiError::BadRequest("Item quantities must be positive".to_string()));
    }

    let cart = state
        .checkout
        .put(Cart::new(cart_id, req.user_id, req.items))
        .await?;
    Ok(Json(cart))
}

/// GET /carts/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<CartId>,
) -> Result<Json<Cart>, ApiError> {
    let cart = state
        .checkout
        .get(cart_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Cart {cart_id} not found")))?;
    Ok(Json(cart))
}

/// POST /carts/{id}/checkout: start the checkout saga for the cart.
///
/// Answers 202 as soon as `CartCheckoutInitiated` is published; progress is
/// visible under `/sagas/{correlation_id}`.
#[tracing::instrument(skip(state))]
pub async fn checkout(
    State(state): State<Arc<AppState>>,
    Path(cart_id): Path<CartId>,
) -> Result<(StatusCode, Json<CheckoutResponse>), ApiError> {
    let correlation_id = state.checkout.checkout(cart_id).await?;
    Ok((StatusCode::ACCEPTED, Json(CheckoutResponse { correlation_id })))
}
