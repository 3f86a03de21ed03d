//! Payment Tracker Library
//!
//! Order and payment tracking on top of Stripe: a pluggable order store, a Stripe
//! gateway client, a signed-webhook dispatcher and the HTTP API that ties them together.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod health;
pub mod middleware_helpers;
pub mod migrator;
pub mod models;
pub mod openapi;
pub mod store;
pub mod tracing;
pub mod webhooks;

use axum::{http::HeaderValue, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};

use crate::gateway::PaymentGateway;
use crate::store::PaymentStore;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PaymentStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub config: config::AppConfig,
}

impl AppState {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: config::AppConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
        }
    }
}

/// CORS from the configured origin list; unparseable origins are skipped.
fn cors_layer(config: &config::AppConfig) -> CorsLayer {
    match config.cors_origins() {
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| match HeaderValue::from_str(origin) {
                    Ok(value) => Some(value),
                    Err(_) => {
                        ::tracing::warn!(%origin, "Ignoring invalid CORS origin");
                        None
                    }
                })
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
        None => CorsLayer::permissive(),
    }
}

/// Full application router with middleware applied.
pub fn app_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    let timeout = TimeoutLayer::new(state.config.request_timeout());

    Router::new()
        .nest("/api/payments", handlers::payment_routes())
        .nest("/api/products", handlers::product_routes())
        .merge(health::health_routes())
        .merge(openapi::openapi_routes())
        .with_state(state)
        .layer(timeout)
        .layer(cors)
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(
            crate::middleware_helpers::request_id::request_id_middleware,
        ))
}
