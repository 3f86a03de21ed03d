//! Payment processor integration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::errors::ServiceError;

pub mod stripe;

pub use stripe::StripeGateway;

/// A payment intent as reported by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub status: String,
    pub amount: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
}

/// A catalogue product as reported by the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// Largest page the processor returns for a product listing.
pub const MAX_PRODUCT_PAGE: u64 = 100;

/// Processor object ids are non-empty runs of ASCII letters, digits and underscores.
pub fn validate_object_id(kind: &str, id: &str) -> Result<(), ServiceError> {
    if id.is_empty() {
        return Err(ServiceError::BadRequest(format!("Missing {} ID", kind)));
    }
    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ServiceError::BadRequest(format!("Invalid {} ID", kind)));
    }
    Ok(())
}

/// Parameters for a hosted single-item checkout session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub product_name: String,
    /// Unit amount in minor units
    pub amount: i64,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
}

/// Processor client. Lookups by id reject ids that fail [`validate_object_id`]
/// with `BadRequest` before any request is made.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        description: Option<&str>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError>;

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ServiceError>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError>;

    /// Active products, at most `limit` of them.
    async fn list_products(&self, limit: u64) -> Result<Vec<Product>, ServiceError>;

    async fn get_product(&self, id: &str) -> Result<Product, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn object_ids_accept_processor_shapes() {
        for id in ["pi_3MtwBwLkdIwHu7ix28a3tqPa", "prod_NWjs8kKbJWmuuc", "pi_test_1"] {
            assert!(validate_object_id("payment", id).is_ok(), "{}", id);
        }
    }

    #[test]
    fn object_ids_reject_path_and_query_characters() {
        assert_matches!(
            validate_object_id("payment", ""),
            Err(ServiceError::BadRequest(ref msg)) if msg == "Missing payment ID"
        );
        for id in ["../customers", "pi_1/../../v1/customers", "pi_1?expand[]=customer", "pi 1", "pi_1%2F", "prod_é"] {
            assert_matches!(
                validate_object_id("product", id),
                Err(ServiceError::BadRequest(ref msg)) if msg == "Invalid product ID",
                "{}", id
            );
        }
    }
}
