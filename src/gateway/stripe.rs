use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{
    validate_object_id, CheckoutRequest, CheckoutSession, PaymentGateway, PaymentIntent, Product,
    MAX_PRODUCT_PAGE,
};
use crate::config::AppConfig;
use crate::errors::ServiceError;

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

/// Stripe REST client. Requests are form-encoded and authenticated with the secret key.
#[derive(Debug, Clone)]
pub struct StripeGateway {
    client: Client,
    secret_key: String,
    api_base: String,
}

impl StripeGateway {
    pub fn new(secret_key: impl Into<String>, api_base: impl Into<String>) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("failed to construct Stripe client: {}", e))
            })?;
        Ok(Self::with_client(secret_key, api_base, client))
    }

    /// Build a gateway from an existing client (useful for testing).
    pub fn with_client(
        secret_key: impl Into<String>,
        api_base: impl Into<String>,
        client: Client,
    ) -> Self {
        Self {
            client,
            secret_key: secret_key.into(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        Self::new(config.stripe_secret_key.clone(), config.stripe_api_base.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.api_base, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ServiceError> {
        let response = request
            .basic_auth(&self.secret_key, Some(""))
            .send()
            .await
            .map_err(|e| {
                counter!("payment_tracker_gateway.errors", 1, "operation" => operation);
                ServiceError::ExternalServiceError(format!("Stripe request failed: {}", e))
            })?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("failed to read Stripe response: {}", e))
        })?;

        if !status.is_success() {
            counter!("payment_tracker_gateway.errors", 1, "operation" => operation);
            let detail = serde_json::from_slice::<StripeErrorBody>(&body)
                .ok()
                .and_then(|b| b.error.message.or(b.error.code))
                .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
            warn!(%status, operation, "Stripe API error: {}", detail);
            return Err(ServiceError::ExternalServiceError(format!(
                "Stripe API error (status: {}): {}",
                status, detail
            )));
        }

        serde_json::from_slice(&body).map_err(|e| {
            ServiceError::ExternalServiceError(format!("unexpected Stripe response: {}", e))
        })
    }
}

/// Form fields for a payment intent, with metadata flattened to `metadata[key]`.
fn payment_intent_form(
    amount: i64,
    currency: &str,
    description: Option<&str>,
    metadata: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut form = vec![
        ("amount".to_string(), amount.to_string()),
        ("currency".to_string(), currency.to_string()),
        (
            "automatic_payment_methods[enabled]".to_string(),
            "true".to_string(),
        ),
    ];
    if let Some(description) = description.filter(|d| !d.is_empty()) {
        form.push(("description".to_string(), description.to_string()));
    }
    for (key, value) in metadata {
        form.push((format!("metadata[{}]", key), value.clone()));
    }
    form
}

fn checkout_form(request: &CheckoutRequest) -> Vec<(String, String)> {
    vec![
        ("mode".to_string(), "payment".to_string()),
        ("payment_method_types[0]".to_string(), "card".to_string()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
        (
            "line_items[0][price_data][currency]".to_string(),
            request.currency.clone(),
        ),
        (
            "line_items[0][price_data][product_data][name]".to_string(),
            request.product_name.clone(),
        ),
        (
            "line_items[0][price_data][unit_amount]".to_string(),
            request.amount.to_string(),
        ),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
    ]
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, metadata))]
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        description: Option<&str>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError> {
        let form = payment_intent_form(amount, currency, description, metadata);
        let intent: PaymentIntent = self
            .send(
                "create_payment_intent",
                self.client.post(self.url("payment_intents")).form(&form),
            )
            .await?;
        debug!(payment_intent_id = %intent.id, "Payment intent created");
        Ok(intent)
    }

    #[instrument(skip(self))]
    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ServiceError> {
        validate_object_id("payment", id)?;
        self.send(
            "retrieve_payment_intent",
            self.client.get(self.url(&format!("payment_intents/{}", id))),
        )
        .await
    }

    #[instrument(skip(self, request), fields(product = %request.product_name))]
    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        self.send(
            "create_checkout_session",
            self.client
                .post(self.url("checkout/sessions"))
                .form(&checkout_form(request)),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn list_products(&self, limit: u64) -> Result<Vec<Product>, ServiceError> {
        let limit = limit.clamp(1, MAX_PRODUCT_PAGE).to_string();
        let page: ListResponse<Product> = self
            .send(
                "list_products",
                self.client
                    .get(self.url("products"))
                    .query(&[("active", "true"), ("limit", limit.as_str())]),
            )
            .await?;
        Ok(page.data)
    }

    #[instrument(skip(self))]
    async fn get_product(&self, id: &str) -> Result<Product, ServiceError> {
        validate_object_id("product", id)?;
        self.send(
            "get_product",
            self.client.get(self.url(&format!("products/{}", id))),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::matchers::{
        any, body_string_contains, header_exists, method, path, query_param,
    };
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn metadata_is_flattened_into_form_keys() {
        let mut metadata = BTreeMap::new();
        metadata.insert("order_id".to_string(), "ORD1".to_string());
        let form = payment_intent_form(999, "usd", None, &metadata);

        assert!(form.contains(&("amount".to_string(), "999".to_string())));
        assert!(form.contains(&("metadata[order_id]".to_string(), "ORD1".to_string())));
        assert!(!form.iter().any(|(k, _)| k == "description"));
    }

    #[tokio::test]
    async fn creates_payment_intent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/payment_intents"))
            .and(header_exists("authorization"))
            .and(body_string_contains("amount=999"))
            .and(body_string_contains("metadata%5Btracking_id%5D=TRK1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "pi_123",
                "client_secret": "pi_123_secret_abc",
                "status": "requires_payment_method",
                "amount": 999,
                "currency": "usd"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = StripeGateway::new("sk_test_123", server.uri()).unwrap();
        let mut metadata = BTreeMap::new();
        metadata.insert("tracking_id".to_string(), "TRK1".to_string());
        let intent = gateway
            .create_payment_intent(999, "usd", Some("Order ORD1"), &metadata)
            .await
            .unwrap();

        assert_eq!(intent.id, "pi_123");
        assert_eq!(intent.client_secret.as_deref(), Some("pi_123_secret_abc"));
    }

    #[tokio::test]
    async fn api_errors_become_external_service_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payment_intents/pi_missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": {"code": "resource_missing", "message": "No such payment_intent"}
            })))
            .mount(&server)
            .await;

        let gateway = StripeGateway::new("sk_test_123", server.uri()).unwrap();
        let err = gateway
            .retrieve_payment_intent("pi_missing")
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ExternalServiceError(ref msg) if msg.contains("No such payment_intent"));
    }

    #[tokio::test]
    async fn creates_checkout_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(body_string_contains("mode=payment"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "cs_test_1",
                "url": "https://checkout.stripe.com/c/pay/cs_test_1"
            })))
            .mount(&server)
            .await;

        let gateway = StripeGateway::new("sk_test_123", format!("{}/", server.uri())).unwrap();
        let session = gateway
            .create_checkout_session(&CheckoutRequest {
                product_name: "Loop Pack".into(),
                amount: 1500,
                currency: "usd".into(),
                success_url: "https://shop.example.com/success".into(),
                cancel_url: "https://shop.example.com/cancel".into(),
            })
            .await
            .unwrap();
        assert_eq!(session.id, "cs_test_1");
    }

    #[tokio::test]
    async fn lists_active_products() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/products"))
            .and(query_param("active", "true"))
            .and(query_param("limit", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": "list",
                "has_more": false,
                "data": [
                    {
                        "id": "prod_loops",
                        "object": "product",
                        "active": true,
                        "name": "Analog Drum Loops",
                        "description": "120 loops",
                        "images": ["https://files.example.com/loops.png"],
                        "metadata": {"file_type": "wav"}
                    },
                    {"id": "prod_kit", "name": "Kit", "description": null}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = StripeGateway::new("sk_test_123", server.uri()).unwrap();
        let products = gateway.list_products(3).await.unwrap();

        assert_eq!(products.len(), 2);
        assert_eq!(products[0].name, "Analog Drum Loops");
        assert_eq!(products[0].metadata.get("file_type").map(String::as_str), Some("wav"));
        assert_eq!(products[1].description, None);
        assert!(products[1].images.is_empty());
    }

    #[tokio::test]
    async fn product_page_size_is_clamped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/products"))
            .and(query_param("limit", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": []})))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = StripeGateway::new("sk_test_123", server.uri()).unwrap();
        assert!(gateway.list_products(5_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gets_single_product() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/products/prod_loops"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "prod_loops",
                "name": "Analog Drum Loops",
                "images": []
            })))
            .mount(&server)
            .await;

        let gateway = StripeGateway::new("sk_test_123", server.uri()).unwrap();
        let product = gateway.get_product("prod_loops").await.unwrap();
        assert_eq!(product.id, "prod_loops");
        assert_eq!(product.description, None);
    }

    #[tokio::test]
    async fn malformed_ids_never_reach_stripe() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "cus_1"})))
            .expect(0)
            .mount(&server)
            .await;

        let gateway = StripeGateway::new("sk_test_123", server.uri()).unwrap();
        for id in ["../customers", "pi_1/../../customers", "pi_1?expand[]=customer", ""] {
            assert_matches!(
                gateway.retrieve_payment_intent(id).await,
                Err(ServiceError::BadRequest(_)),
                "{}", id
            );
            assert_matches!(
                gateway.get_product(id).await,
                Err(ServiceError::BadRequest(_)),
                "{}", id
            );
        }
    }
}
