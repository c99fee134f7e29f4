//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cart::CartError;
use inventory::InventoryError;
use saga::SagaError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    Cart(CartError),
    Inventory(InventoryError),
    Saga(SagaError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Cart(err) => cart_error_to_response(err),
            ApiError::Inventory(err) => inventory_error_to_response(err),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        if status.is_server_error() {
            tracing::error!(error = %message, "internal server error");
        }

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn cart_error_to_response(err: CartError) -> (StatusCode, String) {
    match &err {
        CartError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        CartError::Empty(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        CartError::CheckoutInProgress(_) | CartError::AlreadyCheckedOut(_) => {
            (StatusCode::CONFLICT, err.to_string())
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn inventory_error_to_response(err: InventoryError) -> (StatusCode, String) {
    match &err {
        InventoryError::UnknownProduct(_) => (StatusCode::NOT_FOUND, err.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    match &err {
        SagaError::OrderNotFound(_) | SagaError::SagaNotFound(_) => {
            (StatusCode::NOT_FOUND, err.to_string())
        }
        SagaError::OrderTerminal { .. }
        | SagaError::OrderNotPlaced { .. }
        | SagaError::CompensationPending(_)
        | SagaError::ReservationLapsed(_) => (StatusCode::CONFLICT, err.to_string()),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

impl From<CartError> for ApiError {
    fn from(err: CartError) -> Self {
        ApiError::Cart(err)
    }
}

impl From<InventoryError> for ApiError {
    fn from(err: InventoryError) -> Self {
        ApiError::Inventory(err)
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{CartId, CorrelationId, OrderId};
    use saga::OrderStatus;

    fn status_of(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_cart_errors_map_to_status() {
        let cart = CartId::new(1);
        assert_eq!(status_of(CartError::NotFound(cart)), StatusCode::NOT_FOUND);
        assert_eq!(status_of(CartError::Empty(cart)), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(CartError::CheckoutInProgress(cart)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CartError::InvalidStatus("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_saga_errors_map_to_status() {
        let order_id = OrderId::new();
        assert_eq!(
            status_of(SagaError::OrderNotFound(order_id)),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SagaError::SagaNotFound(CorrelationId::new())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(SagaError::OrderTerminal {
                order_id,
                status: OrderStatus::Cancelled,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::OrderNotPlaced {
                order_id,
                status: OrderStatus::Pending,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::CompensationPending(order_id)),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(SagaError::ReservationLapsed(order_id)),
            StatusCode::CONFLICT
        );
    }
}
