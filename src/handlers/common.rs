use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::IntoParams;

use crate::store::DEFAULT_PAGE_LIMIT;

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Pagination parameters for order listings.
///
/// Both values are taken as signed so that a negative or zero `limit` can fall
/// back to the default instead of failing extraction.
#[derive(Debug, Default, Deserialize, Serialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PaginationParams {
    /// Page size; non-positive values fall back to 50
    pub limit: Option<i64>,
    /// Number of orders to skip; negative values are treated as 0
    pub offset: Option<i64>,
}

impl PaginationParams {
    pub fn limit(&self) -> u64 {
        match self.limit {
            Some(limit) if limit > 0 => limit as u64,
            _ => DEFAULT_PAGE_LIMIT,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset.filter(|offset| *offset > 0).unwrap_or(0) as u64
    }
}

/// Human-readable acknowledgement for state-changing order actions.
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct MessageResponse {
    pub message: String,
    pub order_id: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>, order_id: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            order_id: order_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults() {
        let params = PaginationParams::default();
        assert_eq!(params.limit(), 50);
        assert_eq!(params.offset(), 0);
    }

    #[test]
    fn non_positive_limit_falls_back_to_default() {
        for limit in [0, -5] {
            let params = PaginationParams {
                limit: Some(limit),
                offset: Some(-1),
            };
            assert_eq!(params.limit(), DEFAULT_PAGE_LIMIT);
            assert_eq!(params.offset(), 0);
        }

        let params = PaginationParams {
            limit: Some(10),
            offset: Some(20),
        };
        assert_eq!((params.limit(), params.offset()), (10, 20));
    }
}
