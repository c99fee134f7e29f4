//! HTTP API and service runtime for the checkout saga.
//!
//! One process hosts the cart, inventory and order domains, each consuming
//! its own queue. The router exposes checkout, order signals, saga
//! inspection and stock administration, with structured logging (tracing)
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod runtime;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use error::ApiError;
pub use runtime::{AppState, Runtime, StartupError, Stores, build_runtime, run_migrations};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/carts/{id}", get(routes::carts::get).put(routes::carts::put))
        .route("/carts/{id}/checkout", post(routes::carts::checkout))
        .route("/orders/{id}", get(routes::orders::get))
        .route("/orders/{id}/cancel", post(routes::orders::cancel))
        .route("/orders/{id}/confirm", post(routes::orders::confirm))
        .route("/sagas/{correlation_id}", get(routes::sagas::get))
        .route("/products/{id}/stock", get(routes::products::get).put(routes::products::put))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
