use std::collections::BTreeMap;

use axum::{
    extract::{Json, Path, Query, State},
    response::Response,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use validator::Validate;

use super::common::{created_response, success_response, MessageResponse, PaginationParams};
use super::payment_webhooks::webhook_routes;
use crate::errors::ServiceError;
use crate::gateway::CheckoutRequest;
use crate::handlers::AppState;
use crate::models::event::{
    OrderCreatedData, OrderFulfilledData, OrderRefundedData, PaymentSyncedData,
};
use crate::models::{
    generate_order_id, generate_tracking_id, now, CustomerInfo, EventData, NewPaymentEvent, Order,
    OrderItem, OrderStatus, OrderSummary, PaymentEvent, PaymentStats, PaymentStatus,
};

const DEFAULT_SUCCESS_URL: &str = "https://your-domain.com/success";
const DEFAULT_CANCEL_URL: &str = "https://your-domain.com/cancel";

#[derive(Debug, Deserialize, ToSchema)]
#[schema(example = json!({
    "product_id": "prod_loops_01",
    "product_name": "Analog Drum Loops",
    "file_type": "wav",
    "price": 9.99,
    "quantity": 1
}))]
pub struct OrderItemRequest {
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub file_type: String,
    /// Unit price in major currency units
    #[schema(value_type = f64, example = 9.99)]
    pub price: Decimal,
    /// Values below 1 are treated as 1
    #[serde(default)]
    pub quantity: i32,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl OrderItemRequest {
    fn into_item(self) -> OrderItem {
        OrderItem {
            product_id: self.product_id,
            product_name: self.product_name,
            file_type: self.file_type,
            price: self.price,
            quantity: self.quantity.max(1),
            download_url: self.download_url,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateOrderRequest {
    pub customer_info: CustomerInfo,
    pub items: Vec<OrderItemRequest>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateOrderResponse {
    pub order: Order,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentStatusResponse {
    pub order_id: String,
    pub tracking_id: String,
    pub payment_status: PaymentStatus,
    pub order_status: OrderStatus,
    /// Amount in minor currency units
    pub amount: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Order> for PaymentStatusResponse {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id.clone(),
            tracking_id: order.tracking_id.clone(),
            payment_status: order.payment.status,
            order_status: order.status,
            amount: order.payment.amount,
            currency: order.payment.currency.clone(),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TrackingResponse {
    pub order: Order,
    pub events: Vec<PaymentEvent>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CustomerOrdersResponse {
    pub customer_email: String,
    pub orders: Vec<Order>,
    pub total_orders: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderListResponse {
    pub orders: Vec<OrderSummary>,
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[schema(example = json!({"amount": 1999, "currency": "usd", "description": "Sample pack"}))]
pub struct CreateIntentRequest {
    /// Amount in minor currency units
    #[validate(range(min = 1))]
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PaymentIntentResponse {
    #[serde(rename = "clientSecret")]
    pub client_secret: String,
    pub id: String,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
#[schema(example = json!({"productName": "Tape Saturation Presets", "amount": 1500}))]
pub struct CreateCheckoutRequest {
    #[serde(alias = "product_name")]
    #[validate(length(min = 1))]
    pub product_name: String,
    /// Unit amount in minor currency units
    #[validate(range(min = 1))]
    pub amount: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default, alias = "success_url")]
    pub success_url: Option<String>,
    #[serde(default, alias = "cancel_url")]
    pub cancel_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResponse {
    pub url: String,
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct VerifyPaymentResponse {
    pub id: String,
    /// Raw processor status
    pub status: String,
    pub amount: i64,
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    value
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Appends an audit event. Failures are logged; the triggering action has already happened.
async fn record_event(state: &AppState, event: NewPaymentEvent) {
    let order_id = event.order_id.clone();
    let event_type = event.event_type.clone();
    if let Err(e) = state.store.add_payment_event(event).await {
        warn!(%order_id, %event_type, "Failed to record payment event: {}", e);
    }
}

/// Create an order and its payment intent
#[utoipa::path(
    post,
    path = "/api/payments/create-order",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = CreateOrderResponse,
            headers(("X-Request-Id" = String, description = "Unique request identifier"))
        ),
        (status = 400, description = "Missing email or items, negative price or oversized total", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
#[instrument(skip_all)]
pub async fn create_order(
    State(state): State<AppState>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Response, ServiceError> {
    if request.customer_info.email.trim().is_empty() {
        return Err(ServiceError::BadRequest(
            "Customer email is required".to_string(),
        ));
    }
    if request.items.is_empty() {
        return Err(ServiceError::BadRequest(
            "At least one item is required".to_string(),
        ));
    }

    let items = request
        .items
        .into_iter()
        .map(OrderItemRequest::into_item)
        .collect();
    let mut order = Order::new(
        generate_order_id(),
        generate_tracking_id(),
        request.customer_info,
        items,
        state.config.default_currency.clone(),
    )?;
    order.metadata = request.metadata.unwrap_or_default();

    let mut order = state.store.create_order(order).await?;

    let metadata = BTreeMap::from([
        ("order_id".to_string(), order.id.clone()),
        ("tracking_id".to_string(), order.tracking_id.clone()),
        (
            "customer_email".to_string(),
            order.customer_info.email.clone(),
        ),
    ]);
    let intent = state
        .gateway
        .create_payment_intent(order.payment.amount, &order.payment.currency, None, &metadata)
        .await?;

    order.payment.stripe_payment_intent_id = Some(intent.id.clone());
    order.payment.status = PaymentStatus::Pending;
    order.status = OrderStatus::Pending;
    let order = state.store.update_order(order).await?;

    record_event(
        &state,
        NewPaymentEvent::new(
            &order.id,
            PaymentStatus::Pending,
            EventData::OrderCreated(OrderCreatedData {
                payment_intent_id: intent.id,
            }),
        ),
    )
    .await;

    info!(order_id = %order.id, tracking_id = %order.tracking_id, amount = order.payment.amount, "Order created");
    Ok(created_response(CreateOrderResponse {
        order,
        client_secret: intent.client_secret,
    }))
}

/// Current payment status, synchronised with the processor when possible
#[utoipa::path(
    get,
    path = "/api/payments/status/{order_id}",
    params(("order_id" = String, Path, description = "Order identifier")),
    responses(
        (status = 200, description = "Payment status", body = PaymentStatusResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
#[instrument(skip(state))]
pub async fn get_payment_status(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Response, ServiceError> {
    let mut order = state.store.get_order(&order_id).await?;

    if let Some(intent_id) = order.payment.stripe_payment_intent_id.clone() {
        match state.gateway.retrieve_payment_intent(&intent_id).await {
            Ok(intent) => {
                let synced = PaymentStatus::from_gateway_status(&intent.status);
                let previous = order.payment.status;
                if synced != previous {
                    match state.store.update_payment_status(&order.id, synced).await {
                        Ok(updated) => {
                            order = updated;
                            record_event(
                                &state,
                                NewPaymentEvent::new(
                                    &order.id,
                                    synced,
                                    EventData::PaymentSynced(PaymentSyncedData {
                                        previous_status: previous,
                                        gateway_status: intent.status,
                                    }),
                                ),
                            )
                            .await;
                        }
                        Err(e) => warn!(%order_id, "Failed to store synced payment status: {}", e),
                    }
                }
            }
            Err(e) => warn!(%order_id, payment_intent_id = %intent_id, "Payment status sync failed: {}", e),
        }
    }

    Ok(success_response(PaymentStatusResponse::from(&order)))
}

/// Full order details
#[utoipa::path(
    get,
    path = "/api/payments/order/{order_id}",
    params(("order_id" = String, Path, description = "Order identifier")),
    responses(
        (status = 200, description = "Order", body = Order),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn get_order_details(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Response, ServiceError> {
    let order = state.store.get_order(&order_id).await?;
    Ok(success_response(order))
}

/// Order and audit trail by customer-facing tracking id
#[utoipa::path(
    get,
    path = "/api/payments/track/{tracking_id}",
    params(("tracking_id" = String, Path, description = "Tracking identifier")),
    responses(
        (status = 200, description = "Order with events", body = TrackingResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn track_payment(
    State(state): State<AppState>,
    Path(tracking_id): Path<String>,
) -> Result<Response, ServiceError> {
    let order = state.store.get_order_by_tracking_id(&tracking_id).await?;
    let events = state.store.get_payment_events(&order.id).await?;
    Ok(success_response(TrackingResponse { order, events }))
}

/// Order history for a customer
#[utoipa::path(
    get,
    path = "/api/payments/customer/{email}",
    params(("email" = String, Path, description = "Customer email")),
    responses((status = 200, description = "Customer orders", body = CustomerOrdersResponse)),
    tag = "Payments"
)]
pub async fn get_customer_payments(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<Response, ServiceError> {
    let orders = state.store.get_customer_orders(&email).await?;
    Ok(success_response(CustomerOrdersResponse {
        customer_email: email,
        total_orders: orders.len(),
        orders,
    }))
}

/// Paged order summaries, newest first
#[utoipa::path(
    get,
    path = "/api/payments/all",
    params(PaginationParams),
    responses((status = 200, description = "Order summaries", body = OrderListResponse)),
    tag = "Payments"
)]
pub async fn get_all_payments(
    State(state): State<AppState>,
    Query(params): Query<PaginationParams>,
) -> Result<Response, ServiceError> {
    let (limit, offset) = (params.limit(), params.offset());
    let orders = state.store.get_all_orders(limit, offset).await?;
    Ok(success_response(OrderListResponse {
        orders,
        limit,
        offset,
    }))
}

/// Aggregate order and revenue figures
#[utoipa::path(
    get,
    path = "/api/payments/stats",
    responses((status = 200, description = "Payment statistics", body = PaymentStats)),
    tag = "Payments"
)]
pub async fn get_payment_stats(State(state): State<AppState>) -> Result<Response, ServiceError> {
    let stats = state.store.get_payment_stats().await?;
    Ok(success_response(stats))
}

/// Mark a paid order as fulfilled
#[utoipa::path(
    post,
    path = "/api/payments/fulfill/{order_id}",
    params(("order_id" = String, Path, description = "Order identifier")),
    responses(
        (status = 200, description = "Order fulfilled", body = MessageResponse),
        (status = 400, description = "Order is not paid", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
#[instrument(skip(state))]
pub async fn fulfill_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Response, ServiceError> {
    let order = state.store.get_order(&order_id).await?;
    if order.status != OrderStatus::Paid {
        return Err(ServiceError::BadRequest(
            "Order must be paid before fulfillment".to_string(),
        ));
    }

    let order = state
        .store
        .update_order_status(&order_id, OrderStatus::Fulfilled)
        .await?;

    record_event(
        &state,
        NewPaymentEvent::new(
            &order.id,
            PaymentStatus::Succeeded,
            EventData::OrderFulfilled(OrderFulfilledData {
                fulfilled_at: order.fulfilled_at.unwrap_or_else(now),
            }),
        ),
    )
    .await;

    info!(%order_id, "Order fulfilled");
    Ok(success_response(MessageResponse::new(
        "Order fulfilled successfully",
        order_id,
    )))
}

/// Mark an order and its payment as refunded
#[utoipa::path(
    post,
    path = "/api/payments/refund/{order_id}",
    params(("order_id" = String, Path, description = "Order identifier")),
    responses(
        (status = 200, description = "Order refunded", body = MessageResponse),
        (status = 400, description = "No payment intent on the order", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
#[instrument(skip(state))]
pub async fn refund_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Response, ServiceError> {
    let order = state.store.get_order(&order_id).await?;
    let has_intent = order
        .payment
        .stripe_payment_intent_id
        .as_deref()
        .is_some_and(|id| !id.is_empty());
    if !has_intent {
        return Err(ServiceError::BadRequest(
            "No payment intent found for this order".to_string(),
        ));
    }

    // Local bookkeeping only; the processor-side refund is issued from the dashboard
    state
        .store
        .update_order_status(&order_id, OrderStatus::Refunded)
        .await?;
    let order = state
        .store
        .update_payment_status(&order_id, PaymentStatus::Refunded)
        .await?;

    record_event(
        &state,
        NewPaymentEvent::new(
            &order.id,
            PaymentStatus::Refunded,
            EventData::OrderRefunded(OrderRefundedData {
                refunded_at: order.payment.refunded_at.unwrap_or_else(now),
            }),
        ),
    )
    .await;

    info!(%order_id, "Order refunded");
    Ok(success_response(MessageResponse::new(
        "Order refunded successfully",
        order_id,
    )))
}

/// Create a standalone payment intent
#[utoipa::path(
    post,
    path = "/api/payments/create-intent",
    request_body = CreateIntentRequest,
    responses(
        (status = 200, description = "Payment intent created", body = PaymentIntentResponse),
        (status = 400, description = "Invalid amount", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn create_payment_intent(
    State(state): State<AppState>,
    Json(request): Json<CreateIntentRequest>,
) -> Result<Response, ServiceError> {
    request.validate()?;

    let currency = non_empty_or(request.currency, &state.config.default_currency);
    let metadata = request.metadata.unwrap_or_default();
    let intent = state
        .gateway
        .create_payment_intent(
            request.amount,
            &currency,
            request.description.as_deref(),
            &metadata,
        )
        .await?;

    Ok(success_response(PaymentIntentResponse {
        client_secret: intent.client_secret.unwrap_or_default(),
        id: intent.id,
    }))
}

/// Create a hosted checkout session for a single product
#[utoipa::path(
    post,
    path = "/api/payments/create-checkout",
    request_body = CreateCheckoutRequest,
    responses(
        (status = 200, description = "Checkout session created", body = CheckoutResponse),
        (status = 400, description = "Invalid request", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn create_checkout_session(
    State(state): State<AppState>,
    Json(request): Json<CreateCheckoutRequest>,
) -> Result<Response, ServiceError> {
    request.validate()?;

    let checkout = CheckoutRequest {
        product_name: request.product_name,
        amount: request.amount,
        currency: non_empty_or(request.currency, &state.config.default_currency),
        success_url: non_empty_or(request.success_url, DEFAULT_SUCCESS_URL),
        cancel_url: non_empty_or(request.cancel_url, DEFAULT_CANCEL_URL),
    };
    let session = state.gateway.create_checkout_session(&checkout).await?;

    Ok(success_response(CheckoutResponse {
        url: session.url.unwrap_or_default(),
        id: session.id,
    }))
}

/// Look up a payment intent at the processor
#[utoipa::path(
    get,
    path = "/api/payments/verify/{id}",
    params(("id" = String, Path, description = "Payment intent identifier")),
    responses(
        (status = 200, description = "Payment intent state", body = VerifyPaymentResponse),
        (status = 502, description = "Payment gateway failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn verify_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let intent = state.gateway.retrieve_payment_intent(&id).await?;
    Ok(success_response(VerifyPaymentResponse {
        id: intent.id,
        status: intent.status,
        amount: intent.amount,
    }))
}

/// Routes mounted under `/api/payments`.
pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/create-order", post(create_order))
        .route("/create-intent", post(create_payment_intent))
        .route("/create-checkout", post(create_checkout_session))
        .route("/verify/:id", get(verify_payment))
        .route("/status/:order_id", get(get_payment_status))
        .route("/order/:order_id", get(get_order_details))
        .route("/track/:tracking_id", get(track_payment))
        .route("/customer/:email", get(get_customer_payments))
        .route("/all", get(get_all_payments))
        .route("/stats", get(get_payment_stats))
        .route("/fulfill/:order_id", post(fulfill_order))
        .route("/refund/:order_id", post(refund_order))
        .merge(webhook_routes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn item_quantity_below_one_becomes_one() {
        let request: OrderItemRequest = serde_json::from_value(serde_json::json!({
            "product_id": "p1",
            "product_name": "Vinyl Crackle",
            "price": 4.5,
            "quantity": -2
        }))
        .unwrap();
        let item = request.into_item();
        assert_eq!(item.quantity, 1);
        assert_eq!(item.price, dec!(4.5));
        assert_eq!(item.file_type, "");
    }

    #[test]
    fn checkout_request_accepts_both_casings() {
        let camel: CreateCheckoutRequest = serde_json::from_value(serde_json::json!({
            "productName": "Reverb Impulses",
            "amount": 1200,
            "successUrl": "https://shop.example.com/ok"
        }))
        .unwrap();
        assert_eq!(camel.product_name, "Reverb Impulses");
        assert_eq!(camel.success_url.as_deref(), Some("https://shop.example.com/ok"));

        let snake: CreateCheckoutRequest = serde_json::from_value(serde_json::json!({
            "product_name": "Reverb Impulses",
            "amount": 1200,
            "cancel_url": "https://shop.example.com/no"
        }))
        .unwrap();
        assert_eq!(snake.cancel_url.as_deref(), Some("https://shop.example.com/no"));
    }

    #[test]
    fn intent_response_uses_client_secret_camel_case() {
        let body = serde_json::to_value(PaymentIntentResponse {
            client_secret: "pi_1_secret".into(),
            id: "pi_1".into(),
        })
        .unwrap();
        assert_eq!(body["clientSecret"], "pi_1_secret");
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        assert_eq!(non_empty_or(None, "usd"), "usd");
        assert_eq!(non_empty_or(Some("  ".into()), "usd"), "usd");
        assert_eq!(non_empty_or(Some("eur".into()), "usd"), "eur");
    }
}
