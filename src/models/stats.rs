use chrono::{DateTime, Datelike, Local, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::order::{cents_to_major, Order, OrderStatus};

/// Compact listing row for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OrderSummary {
    pub id: String,
    pub tracking_id: String,
    pub customer_email: String,
    /// Order total in major currency units
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub total_amount: Decimal,
    pub status: OrderStatus,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderSummary {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id.clone(),
            tracking_id: order.tracking_id.clone(),
            customer_email: order.customer_info.email.clone(),
            total_amount: order.total_amount(),
            status: order.status,
            item_count: order.items.len(),
            created_at: order.created_at,
        }
    }
}

/// The figures of one order that feed [`PaymentStats`].
#[derive(Debug, Clone, Copy)]
pub struct OrderFigures {
    pub status: OrderStatus,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for OrderFigures {
    fn from(order: &Order) -> Self {
        Self {
            status: order.status,
            amount: order.payment.amount,
            created_at: order.created_at,
        }
    }
}

/// Aggregate statistics over all orders. Money is in major currency units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentStats {
    pub total_orders: u64,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub total_revenue: Decimal,
    pub pending_orders: u64,
    pub completed_orders: u64,
    pub refunded_orders: u64,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub average_order_value: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub revenue_today: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    #[schema(value_type = f64)]
    pub revenue_this_month: Decimal,
}

impl PaymentStats {
    /// Folds order figures into statistics. Calendar buckets ("today", "this month")
    /// compare each order's creation time against `now` in the local time zone.
    pub fn compute<I>(orders: I, now: DateTime<Local>) -> Self
    where
        I: IntoIterator<Item = OrderFigures>,
    {
        let today = now.date_naive();
        let mut stats = PaymentStats::default();

        for order in orders {
            stats.total_orders += 1;

            match order.status {
                OrderStatus::Pending => stats.pending_orders += 1,
                OrderStatus::Refunded => stats.refunded_orders += 1,
                status if status.is_completed() => {
                    stats.completed_orders += 1;
                    let amount = cents_to_major(order.amount);
                    stats.total_revenue += amount;

                    let created = order.created_at.with_timezone(&Local).date_naive();
                    if created == today {
                        stats.revenue_today += amount;
                    }
                    if created.year() == today.year() && created.month() == today.month() {
                        stats.revenue_this_month += amount;
                    }
                }
                _ => {}
            }
        }

        if stats.completed_orders > 0 {
            stats.average_order_value =
                (stats.total_revenue / Decimal::from(stats.completed_orders)).round_dp(2);
        }

        stats
    }
}
