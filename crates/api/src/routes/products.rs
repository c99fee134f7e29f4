//! Stock administration for the inventory domain.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ProductId;
use inventory::{InventoryStore, StockLevel};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::runtime::AppState;

#[derive(Deserialize)]
pub struct PutStockRequest {
    pub total_stock: i64,
}

#[derive(Serialize)]
pub struct StockResponse {
    pub product_id: ProductId,
    pub total_stock: i64,
    pub reserved: i64,
    pub available: i64,
}

impl From<StockLevel> for StockResponse {
    fn from(level: StockLevel) -> Self {
        Self {
            product_id: level.product_id,
            total_stock: level.total_stock,
            reserved: level.reserved,
            available: level.available(),
        }
    }
}

/// PUT /products/{id}/stock: set the product's total stock.
///
/// Existing reservations are kept, so `available` may go negative until
/// they are released.
#[tracing::instrument(skip(state, req))]
pub async fn put(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<ProductId>,
    Json(req): Json<PutStockRequest>,
) -> Result<Json<StockResponse>, ApiError> {
    if req.total_stock < 0 {
        return Err(ApiError::BadRequest("total_stock must not be negative".to_string()));
    }

    let store = state.inventory.store();
    store.set_stock(product_id, req.total_stock).await?;
    tracing::info!(total_stock = req.total_stock, "stock level set");
    stock(&state, product_id).await
}

/// GET /products/{id}/stock
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<ProductId>,
) -> Result<Json<StockResponse>, ApiError> {
    stock(&state, product_id).await
}

async fn stock(state: &AppState, product_id: ProductId) -> Result<Json<StockResponse>, ApiError> {
    let level = state
        .inventory
        .store()
        .stock_level(product_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Product {product_id} not found")))?;
    Ok(Json(level.into()))
}
