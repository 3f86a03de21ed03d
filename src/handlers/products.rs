use axum::{
    extract::{Path, Query, State},
    response::Response,
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;
use utoipa::{IntoParams, ToSchema};

use super::common::success_response;
use crate::errors::ServiceError;
use crate::gateway::{Product, MAX_PRODUCT_PAGE};
use crate::handlers::AppState;

pub const DEFAULT_PRODUCT_LIMIT: u64 = 10;

#[derive(Debug, Default, Deserialize, Serialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ProductListParams {
    /// Page size; non-positive values fall back to 10, larger ones are capped at 100
    pub limit: Option<i64>,
}

impl ProductListParams {
    pub fn limit(&self) -> u64 {
        match self.limit {
            Some(limit) if limit > 0 => (limit as u64).min(MAX_PRODUCT_PAGE),
            _ => DEFAULT_PRODUCT_LIMIT,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ProductListResponse {
    pub products: Vec<Product>,
}

/// List active catalogue products
#[utoipa::path(
    get,
    path = "/api/products",
    params(ProductListParams),
    responses(
        (status = 200, description = "Active products", body = ProductListResponse),
        (status = 502, description = "Payment gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Products"
)]
#[instrument(skip(state))]
pub async fn list_products(
    State(state): State<AppState>,
    Query(params): Query<ProductListParams>,
) -> Result<Response, ServiceError> {
    let products = state.gateway.list_products(params.limit()).await?;
    Ok(success_response(ProductListResponse { products }))
}

/// Get a single catalogue product
#[utoipa::path(
    get,
    path = "/api/products/{id}",
    params(("id" = String, Path, description = "Product identifier")),
    responses(
        (status = 200, description = "Product details", body = Product),
        (status = 400, description = "Malformed product id", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Products"
)]
#[instrument(skip(state))]
pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let product = state.gateway.get_product(&id).await?;
    Ok(success_response(product))
}

/// Routes mounted under `/api/products`.
pub fn product_routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_products))
        .route("/:id", get(get_product))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn product_limit_defaults_and_caps() {
        assert_eq!(ProductListParams { limit: None }.limit(), 10);
        assert_eq!(ProductListParams { limit: Some(0) }.limit(), 10);
        assert_eq!(ProductListParams { limit: Some(-4) }.limit(), 10);
        assert_eq!(ProductListParams { limit: Some(25) }.limit(), 25);
        assert_eq!(ProductListParams { limit: Some(1_000) }.limit(), 100);
    }
}
