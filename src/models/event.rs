//! Payment event audit log entries and their typed payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use super::order::{PaymentMethod, PaymentStatus};

pub const ORDER_CREATED: &str = "order_created";
pub const PAYMENT_SUCCEEDED: &str = "payment_succeeded";
pub const PAYMENT_FAILED: &str = "payment_failed";
pub const PAYMENT_CANCELED: &str = "payment_canceled";
pub const CHECKOUT_COMPLETED: &str = "checkout_completed";
pub const ORDER_FULFILLED: &str = "order_fulfilled";
pub const ORDER_REFUNDED: &str = "order_refunded";
pub const PAYMENT_SYNCED: &str = "payment_synced";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub payment_intent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSucceededData {
    pub payment_intent_id: String,
    pub amount: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailedData {
    pub payment_intent_id: String,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCanceledData {
    pub payment_intent_id: String,
    pub canceled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutCompletedData {
    pub session_id: String,
    #[serde(default)]
    pub payment_intent_id: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFulfilledData {
    pub fulfilled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRefundedData {
    pub refunded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSyncedData {
    pub previous_status: PaymentStatus,
    pub gateway_status: String,
}

/// Event payload. Serialized as the bare inner object; the variant is recovered
/// from the event type when read back from storage.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventData {
    OrderCreated(OrderCreatedData),
    PaymentSucceeded(PaymentSucceededData),
    PaymentFailed(PaymentFailedData),
    PaymentCanceled(PaymentCanceledData),
    CheckoutCompleted(CheckoutCompletedData),
    OrderFulfilled(OrderFulfilledData),
    OrderRefunded(OrderRefundedData),
    PaymentSynced(PaymentSyncedData),
    /// Payload with no known shape, kept verbatim
    Other(Value),
}

impl EventData {
    /// Canonical event type for typed payloads.
    pub fn event_type(&self) -> Option<&'static str> {
        match self {
            EventData::OrderCreated(_) => Some(ORDER_CREATED),
            EventData::PaymentSucceeded(_) => Some(PAYMENT_SUCCEEDED),
            EventData::PaymentFailed(_) => Some(PAYMENT_FAILED),
            EventData::PaymentCanceled(_) => Some(PAYMENT_CANCELED),
            EventData::CheckoutCompleted(_) => Some(CHECKOUT_COMPLETED),
            EventData::OrderFulfilled(_) => Some(ORDER_FULFILLED),
            EventData::OrderRefunded(_) => Some(ORDER_REFUNDED),
            EventData::PaymentSynced(_) => Some(PAYMENT_SYNCED),
            EventData::Other(_) => None,
        }
    }

    /// Rebuilds a payload from its event type and stored JSON. Shapes that do not
    /// match the type fall back to [`EventData::Other`].
    pub fn from_parts(event_type: &str, value: Value) -> Self {
        fn typed<T, F>(value: Value, wrap: F) -> EventData
        where
            T: serde::de::DeserializeOwned,
            F: FnOnce(T) -> EventData,
        {
            match serde_json::from_value::<T>(value.clone()) {
                Ok(data) => wrap(data),
                Err(_) => EventData::Other(value),
            }
        }

        match event_type {
            ORDER_CREATED => typed(value, EventData::OrderCreated),
            PAYMENT_SUCCEEDED => typed(value, EventData::PaymentSucceeded),
            PAYMENT_FAILED => typed(value, EventData::PaymentFailed),
            PAYMENT_CANCELED => typed(value, EventData::PaymentCanceled),
            CHECKOUT_COMPLETED => typed(value, EventData::CheckoutCompleted),
            ORDER_FULFILLED => typed(value, EventData::OrderFulfilled),
            ORDER_REFUNDED => typed(value, EventData::OrderRefunded),
            PAYMENT_SYNCED => typed(value, EventData::PaymentSynced),
            _ => EventData::Other(value),
        }
    }

    pub fn to_json(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// A stored, immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct PaymentEvent {
    pub id: String,
    pub order_id: String,
    pub event_type: String,
    pub status: PaymentStatus,
    #[schema(value_type = Object)]
    pub data: EventData,
    pub created_at: DateTime<Utc>,
}

/// An event about to be appended. The store assigns `id` and `created_at`
/// when they are not supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPaymentEvent {
    pub id: Option<String>,
    pub order_id: String,
    pub event_type: String,
    pub status: PaymentStatus,
    pub data: EventData,
    pub created_at: Option<DateTime<Utc>>,
}

impl NewPaymentEvent {
    /// Event whose type is derived from the payload (`"custom"` for opaque payloads).
    pub fn new(order_id: impl Into<String>, status: PaymentStatus, data: EventData) -> Self {
        let event_type = data.event_type().unwrap_or("custom").to_string();
        Self {
            id: None,
            order_id: order_id.into(),
            event_type,
            status,
            data,
            created_at: None,
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Fills in missing identity and timestamp.
    pub fn into_event(self) -> PaymentEvent {
        PaymentEvent {
            id: self
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            order_id: self.order_id,
            event_type: self.event_type,
            status: self.status,
            data: self.data,
            created_at: self.created_at.unwrap_or_else(super::order::now),
        }
    }
}
