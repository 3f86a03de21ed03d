use axum::{routing::get, Json, Router};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Payment Tracker API",
        description = r#"
Order and payment tracking on top of Stripe.

Orders are created with a payment intent, followed through Stripe webhooks and looked up by
order id, customer-facing tracking id or customer email.

## Errors

Every failing endpoint returns the same body:

```json
{
  "error": "Not Found",
  "message": "Not found: order ORD5f2c9a1e0b7d4c3a not found",
  "request_id": "req-abc123xyz",
  "timestamp": "2024-01-01T00:00:00Z"
}
```

## Webhooks

`POST /api/payments/webhook` requires a `Stripe-Signature` header signed with the configured
webhook secret. Bodies above 64 KiB are rejected.
        "#,
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Payments", description = "Orders, payment tracking and Stripe integration"),
        (name = "Products", description = "Active products from the Stripe catalogue"),
        (name = "Health", description = "Health check endpoints")
    ),
    paths(
        crate::handlers::payments::create_order,
        crate::handlers::payments::get_payment_status,
        crate::handlers::payments::get_order_details,
        crate::handlers::payments::track_payment,
        crate::handlers::payments::get_customer_payments,
        crate::handlers::payments::get_all_payments,
        crate::handlers::payments::get_payment_stats,
        crate::handlers::payments::fulfill_order,
        crate::handlers::payments::refund_order,
        crate::handlers::payments::create_payment_intent,
        crate::handlers::payments::create_checkout_session,
        crate::handlers::payments::verify_payment,
        crate::handlers::payment_webhooks::stripe_webhook,
        crate::handlers::products::list_products,
        crate::handlers::products::get_product,
        crate::health::health_check,
    ),
    components(
        schemas(
            crate::models::Order,
            crate::models::OrderItem,
            crate::models::CustomerInfo,
            crate::models::PaymentInfo,
            crate::models::PaymentEvent,
            crate::models::OrderSummary,
            crate::models::PaymentStats,
            crate::models::OrderStatus,
            crate::models::PaymentStatus,
            crate::models::PaymentMethod,
            crate::handlers::payments::CreateOrderRequest,
            crate::handlers::payments::OrderItemRequest,
            crate::handlers::payments::CreateOrderResponse,
            crate::handlers::payments::PaymentStatusResponse,
            crate::handlers::payments::TrackingResponse,
            crate::handlers::payments::CustomerOrdersResponse,
            crate::handlers::payments::OrderListResponse,
            crate::handlers::payments::CreateIntentRequest,
            crate::handlers::payments::PaymentIntentResponse,
            crate::handlers::payments::CreateCheckoutRequest,
            crate::handlers::payments::CheckoutResponse,
            crate::handlers::payments::VerifyPaymentResponse,
            crate::handlers::common::MessageResponse,
            crate::gateway::Product,
            crate::handlers::products::ProductListResponse,
            crate::health::HealthInfo,
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDoc;

/// Serves the generated document at `/api-docs/openapi.json`.
pub fn openapi_routes<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDoc::openapi()) }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_lists_payment_routes() {
        let json = serde_json::to_string(&ApiDoc::openapi()).unwrap();
        assert!(json.contains("Payment Tracker API"));
        assert!(json.contains("/api/payments/create-order"));
        assert!(json.contains("/api/payments/track/{tracking_id}"));
        assert!(json.contains("/api/payments/webhook"));
        assert!(json.contains("/api/products/{id}"));
    }
}
