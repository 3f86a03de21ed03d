use chrono::{DateTime, SubsecRound, Utc};
use rand::RngCore;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::errors::ServiceError;

/// Current time at the precision every backend can persist (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

fn prefixed_random_id(prefix: &str) -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", prefix, hex::encode(bytes))
}

/// Generates an order identifier: `ORD` followed by 16 hex characters.
pub fn generate_order_id() -> String {
    prefixed_random_id("ORD")
}

/// Generates a customer-facing tracking identifier: `TRK` followed by 16 hex characters.
pub fn generate_tracking_id() -> String {
    prefixed_random_id("TRK")
}

/// Order lifecycle status
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::EnumString,
    strum::IntoStaticStr,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    #[sea_orm(string_value = "created")]
    Created,
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "fulfilled")]
    Fulfilled,
    #[sea_orm(string_value = "canceled")]
    Canceled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Paid and fulfilled orders count as completed revenue.
    pub fn is_completed(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Fulfilled)
    }
}

/// Payment status, tracked independently of the order status
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::EnumString,
    strum::IntoStaticStr,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "succeeded")]
    Succeeded,
    #[sea_orm(string_value = "failed")]
    Failed,
    #[sea_orm(string_value = "canceled")]
    Canceled,
    #[sea_orm(string_value = "refunded")]
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Maps a Stripe payment intent status onto the local payment status.
    pub fn from_gateway_status(status: &str) -> Self {
        match status {
            "succeeded" => PaymentStatus::Succeeded,
            "canceled" => PaymentStatus::Canceled,
            "processing"
            | "requires_payment_method"
            | "requires_confirmation"
            | "requires_action" => PaymentStatus::Pending,
            _ => PaymentStatus::Failed,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumIter,
    DeriveActiveEnum,
    strum::EnumString,
    strum::IntoStaticStr,
    ToSchema,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "paypal")]
    #[serde(rename = "paypal")]
    #[strum(serialize = "paypal")]
    PayPal,
    #[sea_orm(string_value = "apple_pay")]
    ApplePay,
    #[sea_orm(string_value = "google_pay")]
    GooglePay,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }

    /// Maps a Stripe payment method type; anything unrecognised is treated as a card.
    pub fn from_gateway_type(kind: Option<&str>) -> Self {
        match kind {
            Some("paypal") => PaymentMethod::PayPal,
            Some("apple_pay") => PaymentMethod::ApplePay,
            Some("google_pay") => PaymentMethod::GooglePay,
            _ => PaymentMethod::Card,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CustomerInfo {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderItem {
    pub product_id: String,
    pub product_name: String,
    #[serde(default)]
    pub file_type: String,
    /// Unit price in major currency units
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64, example = 9.99)]
    pub price: Decimal,
    pub quantity: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

impl OrderItem {
    /// Line total in minor units (cents), rounded to the nearest cent.
    ///
    /// Negative prices or quantities, and totals that do not fit in `i64` cents,
    /// are rejected rather than clamped.
    pub fn line_total_cents(&self) -> Result<i64, ServiceError> {
        if self.price < Decimal::ZERO {
            return Err(ServiceError::BadRequest(format!(
                "Price for product {} must not be negative",
                self.product_id
            )));
        }
        if self.quantity < 0 {
            return Err(ServiceError::BadRequest(format!(
                "Quantity for product {} must not be negative",
                self.product_id
            )));
        }

        self.price
            .checked_mul(Decimal::ONE_HUNDRED)
            .and_then(|cents| cents.checked_mul(Decimal::from(self.quantity)))
            .map(|cents| cents.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
            .and_then(|cents| cents.to_i64())
            .ok_or_else(|| {
                ServiceError::BadRequest(format!(
                    "Line total for product {} is too large",
                    self.product_id
                ))
            })
    }
}

/// Sum of all line totals in minor units.
pub fn total_amount_cents(items: &[OrderItem]) -> Result<i64, ServiceError> {
    items.iter().try_fold(0i64, |total, item| {
        total
            .checked_add(item.line_total_cents()?)
            .ok_or_else(|| ServiceError::BadRequest("Order total is too large".to_string()))
    })
}

/// Converts minor units into a two-decimal major-unit amount.
pub fn cents_to_major(amount: i64) -> Decimal {
    Decimal::new(amount, 2)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_payment_intent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_session_id: Option<String>,
    /// Amount in minor currency units (cents)
    pub amount: i64,
    pub currency: String,
    pub status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<PaymentMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded_at: Option<DateTime<Utc>>,
}

impl PaymentInfo {
    pub fn pending(amount: i64, currency: impl Into<String>) -> Self {
        Self {
            stripe_payment_intent_id: None,
            stripe_session_id: None,
            amount,
            currency: currency.into(),
            status: PaymentStatus::Pending,
            method: None,
            processed_at: None,
            refunded_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub id: String,
    pub tracking_id: String,
    pub customer_info: CustomerInfo,
    pub items: Vec<OrderItem>,
    pub payment: PaymentInfo,
    pub status: OrderStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Builds a new order in `created` status whose payment amount is the sum of its items.
    ///
    /// Fails with `BadRequest` when an item is priced below zero or the total overflows.
    pub fn new(
        id: impl Into<String>,
        tracking_id: impl Into<String>,
        customer_info: CustomerInfo,
        items: Vec<OrderItem>,
        currency: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let amount = total_amount_cents(&items)?;
        let created_at = now();
        Ok(Self {
            id: id.into(),
            tracking_id: tracking_id.into(),
            customer_info,
            items,
            payment: PaymentInfo::pending(amount, currency),
            status: OrderStatus::Created,
            metadata: BTreeMap::new(),
            created_at,
            updated_at: created_at,
            fulfilled_at: None,
        })
    }

    /// Order status transition. Entering `fulfilled` stamps `fulfilled_at` once.
    pub fn apply_order_status(&mut self, status: OrderStatus, at: DateTime<Utc>) {
        self.status = status;
        if status == OrderStatus::Fulfilled && self.fulfilled_at.is_none() {
            self.fulfilled_at = Some(at);
        }
        self.updated_at = at;
    }

    /// Combined payment transition.
    ///
    /// A successful payment stamps `processed_at` once and forces the order into `paid`.
    /// A refund stamps `refunded_at` once; the order status is left for the caller.
    pub fn apply_payment_status(&mut self, status: PaymentStatus, at: DateTime<Utc>) {
        self.payment.status = status;
        match status {
            PaymentStatus::Succeeded => {
                self.payment.processed_at.get_or_insert(at);
                self.status = OrderStatus::Paid;
            }
            PaymentStatus::Refunded => {
                self.payment.refunded_at.get_or_insert(at);
            }
            PaymentStatus::Pending | PaymentStatus::Failed | PaymentStatus::Canceled => {}
        }
        self.updated_at = at;
    }

    pub fn total_amount(&self) -> Decimal {
        cents_to_major(self.payment.amount)
    }
}
