//! Stripe webhook handling: signature verification and event dispatch onto the store.

pub mod signature;

use metrics::counter;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::errors::ServiceError;
use crate::models::event::{
    CheckoutCompletedData, PaymentCanceledData, PaymentFailedData, PaymentSucceededData,
};
use crate::models::{now, EventData, NewPaymentEvent, OrderStatus, PaymentMethod, PaymentStatus};
use crate::store::PaymentStore;

pub use signature::{sign_payload, verify_signature, SIGNATURE_HEADER};

/// Largest webhook body accepted, in bytes.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 65_536;

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: Value,
}

/// Either a bare id or an expanded object carrying one.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object {
        id: String,
        #[serde(default, rename = "type")]
        kind: Option<String>,
    },
}

impl Expandable {
    fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object { id, .. } => id,
        }
    }

    fn kind(&self) -> Option<&str> {
        match self {
            Expandable::Id(_) => None,
            Expandable::Object { kind, .. } => kind.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    payment_method: Option<Expandable>,
    #[serde(default)]
    last_payment_error: Option<PaymentErrorObject>,
}

#[derive(Debug, Deserialize)]
struct PaymentErrorObject {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    payment_intent: Option<Expandable>,
    #[serde(default)]
    customer_details: Option<CustomerDetails>,
}

#[derive(Debug, Deserialize)]
struct CustomerDetails {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

/// What became of a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The store was updated and an audit event recorded
    Applied,
    /// Known type that is only logged
    Logged,
    /// Unknown type
    Ignored,
    /// Handling failed (no matching order, unparseable object or store error)
    Dropped,
}

impl Disposition {
    fn as_label(self) -> &'static str {
        match self {
            Disposition::Applied => "applied",
            Disposition::Logged => "logged",
            Disposition::Ignored => "ignored",
            Disposition::Dropped => "dropped",
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Routes verified Stripe events to store updates.
#[derive(Clone)]
pub struct WebhookDispatcher {
    store: Arc<dyn PaymentStore>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<dyn PaymentStore>) -> Self {
        Self { store }
    }

    /// Applies an event. Failures are logged and swallowed so the provider
    /// never retries an event that cannot be matched.
    #[instrument(skip(self, event), fields(event_id = %event.id, event_type = %event.event_type))]
    pub async fn dispatch(&self, event: &StripeEvent) -> Disposition {
        let result = match event.event_type.as_str() {
            "payment_intent.succeeded" => self.payment_succeeded(&event.data.object).await,
            "payment_intent.payment_failed" => self.payment_failed(&event.data.object).await,
            "payment_intent.canceled" => self.payment_canceled(&event.data.object).await,
            "checkout.session.completed" => self.checkout_completed(&event.data.object).await,
            "invoice.payment_succeeded" => {
                info!(
                    invoice_id = object_id(&event.data.object),
                    "Invoice payment succeeded"
                );
                Ok(Disposition::Logged)
            }
            "charge.dispute.created" => {
                let charge = event.data.object.get("charge").and_then(|c| match c {
                    Value::String(id) => Some(id.as_str()),
                    other => other.get("id").and_then(Value::as_str),
                });
                warn!(
                    dispute_id = object_id(&event.data.object),
                    charge_id = charge.unwrap_or(""),
                    "Charge dispute created; needs manual review"
                );
                Ok(Disposition::Logged)
            }
            other => {
                info!("Unhandled event type: {}", other);
                Ok(Disposition::Ignored)
            }
        };

        let disposition = match result {
            Ok(disposition) => disposition,
            Err(ServiceError::NotFound(msg)) => {
                warn!("Webhook event dropped: {}", msg);
                Disposition::Dropped
            }
            Err(e) => {
                error!("Failed to apply webhook event: {}", e);
                Disposition::Dropped
            }
        };

        counter!(
            "payment_tracker_webhooks.events",
            1,
            "outcome" => disposition.as_label()
        );
        disposition
    }

    async fn payment_succeeded(&self, object: &Value) -> Result<Disposition, ServiceError> {
        let intent: PaymentIntentObject = serde_json::from_value(object.clone())?;
        info!(payment_intent_id = %intent.id, "Payment succeeded");

        let order = self.store.find_order_by_payment_intent_id(&intent.id).await?;
        self.store
            .update_payment_status(&order.id, PaymentStatus::Succeeded)
            .await?;

        let method = PaymentMethod::from_gateway_type(
            intent.payment_method.as_ref().and_then(Expandable::kind),
        );
        self.store
            .add_payment_event(NewPaymentEvent::new(
                order.id.clone(),
                PaymentStatus::Succeeded,
                EventData::PaymentSucceeded(PaymentSucceededData {
                    payment_intent_id: intent.id,
                    amount: intent.amount,
                    currency: intent.currency,
                    payment_method: method,
                }),
            ))
            .await?;

        info!(order_id = %order.id, "Order is ready for fulfillment");
        Ok(Disposition::Applied)
    }

    async fn payment_failed(&self, object: &Value) -> Result<Disposition, ServiceError> {
        let intent: PaymentIntentObject = serde_json::from_value(object.clone())?;
        info!(payment_intent_id = %intent.id, "Payment failed");

        let order = self.store.find_order_by_payment_intent_id(&intent.id).await?;
        self.store
            .update_payment_status(&order.id, PaymentStatus::Failed)
            .await?;

        let (failure_code, failure_message) = intent
            .last_payment_error
            .map(|e| (e.code, e.message))
            .unwrap_or((None, None));
        self.store
            .add_payment_event(NewPaymentEvent::new(
                order.id,
                PaymentStatus::Failed,
                EventData::PaymentFailed(PaymentFailedData {
                    payment_intent_id: intent.id,
                    failure_code,
                    failure_message,
                }),
            ))
            .await?;
        Ok(Disposition::Applied)
    }

    async fn payment_canceled(&self, object: &Value) -> Result<Disposition, ServiceError> {
        let intent: PaymentIntentObject = serde_json::from_value(object.clone())?;
        info!(payment_intent_id = %intent.id, "Payment canceled");

        let order = self.store.find_order_by_payment_intent_id(&intent.id).await?;
        self.store
            .update_payment_status(&order.id, PaymentStatus::Canceled)
            .await?;
        self.store
            .update_order_status(&order.id, OrderStatus::Canceled)
            .await?;

        self.store
            .add_payment_event(NewPaymentEvent::new(
                order.id,
                PaymentStatus::Canceled,
                EventData::PaymentCanceled(PaymentCanceledData {
                    payment_intent_id: intent.id,
                    canceled_at: now(),
                }),
            ))
            .await?;
        Ok(Disposition::Applied)
    }

    async fn checkout_completed(&self, object: &Value) -> Result<Disposition, ServiceError> {
        let session: CheckoutSessionObject = serde_json::from_value(object.clone())?;
        info!(session_id = %session.id, "Checkout session completed");

        let intent_id = session
            .payment_intent
            .as_ref()
            .map(|pi| pi.id().to_string());

        let by_session = self.store.find_order_by_session_id(&session.id).await;
        let mut order = match (by_session, &intent_id) {
            (Ok(order), _) => order,
            (Err(ServiceError::NotFound(_)), Some(intent_id)) => {
                self.store.find_order_by_payment_intent_id(intent_id).await?
            }
            (Err(e), _) => return Err(e),
        };

        let mut customer_email = None;
        if let Some(details) = session.customer_details {
            if let Some(email) = non_empty(details.email) {
                order.customer_info.email = email.clone();
                customer_email = Some(email);
            }
            if let Some(name) = non_empty(details.name) {
                order.customer_info.name = Some(name);
            }
            if let Some(phone) = non_empty(details.phone) {
                order.customer_info.phone = Some(phone);
            }
        }

        if let Some(intent_id) = &intent_id {
            order.payment.stripe_payment_intent_id = Some(intent_id.clone());
        }
        order.payment.stripe_session_id = Some(session.id.clone());

        let order = self.store.update_order(order).await?;

        self.store
            .add_payment_event(NewPaymentEvent::new(
                order.id,
                PaymentStatus::Succeeded,
                EventData::CheckoutCompleted(CheckoutCompletedData {
                    session_id: session.id,
                    payment_intent_id: intent_id,
                    customer_email,
                }),
            ))
            .await?;
        Ok(Disposition::Applied)
    }
}

fn object_id(object: &Value) -> &str {
    object.get("id").and_then(Value::as_str).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CustomerInfo, Order, OrderItem};
    use crate::store::InMemoryPaymentStore;
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn setup() -> (WebhookDispatcher, Arc<dyn PaymentStore>) {
        let store: Arc<dyn PaymentStore> = Arc::new(InMemoryPaymentStore::new());
        let mut order = Order::new(
            "ORD1",
            "TRK1",
            CustomerInfo {
                email: "buyer@example.com".into(),
                ..Default::default()
            },
            vec![OrderItem {
                product_id: "p1".into(),
                product_name: "Synth Presets".into(),
                file_type: "zip".into(),
                price: dec!(9.99),
                quantity: 1,
                download_url: None,
            }],
            "usd",
        )
        .expect("valid order");
        order.payment.stripe_payment_intent_id = Some("pi_1".into());
        store.create_order(order).await.unwrap();
        (WebhookDispatcher::new(store.clone()), store)
    }

    fn event(kind: &str, object: Value) -> StripeEvent {
        serde_json::from_value(json!({
            "id": "evt_1",
            "type": kind,
            "data": {"object": object}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn succeeded_payment_marks_order_paid() {
        let (dispatcher, store) = setup().await;
        let outcome = dispatcher
            .dispatch(&event(
                "payment_intent.succeeded",
                json!({"id": "pi_1", "amount": 999, "currency": "usd",
                       "payment_method": {"id": "pm_1", "type": "paypal"}}),
            ))
            .await;
        assert_eq!(outcome, Disposition::Applied);

        let order = store.get_order("ORD1").await.unwrap();
        assert_eq!(order.status, OrderStatus::Paid);
        assert_eq!(order.payment.status, PaymentStatus::Succeeded);
        assert!(order.payment.processed_at.is_some());

        let events = store.get_payment_events("ORD1").await.unwrap();
        assert_eq!(events[0].event_type, "payment_succeeded");
        match &events[0].data {
            EventData::PaymentSucceeded(data) => {
                assert_eq!(data.payment_method, PaymentMethod::PayPal);
                assert_eq!(data.amount, 999);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_payment_records_failure_details() {
        let (dispatcher, store) = setup().await;
        dispatcher
            .dispatch(&event(
                "payment_intent.payment_failed",
                json!({"id": "pi_1", "last_payment_error": {
                    "code": "card_declined", "message": "Your card was declined."}}),
            ))
            .await;

        let order = store.get_order("ORD1").await.unwrap();
        assert_eq!(order.payment.status, PaymentStatus::Failed);
        let events = store.get_payment_events("ORD1").await.unwrap();
        assert!(matches!(
            &events[0].data,
            EventData::PaymentFailed(PaymentFailedData { failure_code: Some(code), .. }) if code == "card_declined"
        ));
    }

    #[tokio::test]
    async fn canceled_payment_cancels_order() {
        let (dispatcher, store) = setup().await;
        dispatcher
            .dispatch(&event("payment_intent.canceled", json!({"id": "pi_1"})))
            .await;

        let order = store.get_order("ORD1").await.unwrap();
        assert_eq!(order.status, OrderStatus::Canceled);
        assert_eq!(order.payment.status, PaymentStatus::Canceled);
    }

    #[tokio::test]
    async fn checkout_completion_falls_back_to_intent_lookup() {
        let (dispatcher, store) = setup().await;
        let outcome = dispatcher
            .dispatch(&event(
                "checkout.session.completed",
                json!({"id": "cs_1", "payment_intent": "pi_1",
                       "customer_details": {"email": "paid@example.com", "name": "Grace", "phone": ""}}),
            ))
            .await;
        assert_eq!(outcome, Disposition::Applied);

        let order = store.find_order_by_session_id("cs_1").await.unwrap();
        assert_eq!(order.id, "ORD1");
        assert_eq!(order.customer_info.email, "paid@example.com");
        assert_eq!(order.customer_info.name.as_deref(), Some("Grace"));
        assert_eq!(order.customer_info.phone, None);
    }

    #[tokio::test]
    async fn unmatched_and_unknown_events_do_not_fail() {
        let (dispatcher, store) = setup().await;
        assert_eq!(
            dispatcher
                .dispatch(&event("payment_intent.succeeded", json!({"id": "pi_unknown"})))
                .await,
            Disposition::Dropped
        );
        assert_eq!(
            dispatcher
                .dispatch(&event("customer.created", json!({"id": "cus_1"})))
                .await,
            Disposition::Ignored
        );
        assert_eq!(
            dispatcher
                .dispatch(&event("charge.dispute.created", json!({"id": "dp_1", "charge": "ch_1"})))
                .await,
            Disposition::Logged
        );
        assert!(store.get_payment_events("ORD1").await.unwrap().is_empty());
    }
}
