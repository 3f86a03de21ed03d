//! Order and payment persistence.
//!
//! Both backends implement [`PaymentStore`] with identical observable behavior, so the
//! HTTP layer and the webhook dispatcher only ever see an `Arc<dyn PaymentStore>`.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::config::AppConfig;
use crate::db;
use crate::errors::ServiceError;
use crate::models::{
    NewPaymentEvent, Order, OrderStatus, OrderSummary, PaymentEvent, PaymentStats, PaymentStatus,
};

pub mod database;
pub mod in_memory;

pub use database::DatabasePaymentStore;
pub use in_memory::InMemoryPaymentStore;

/// Default page size for order listings.
pub const DEFAULT_PAGE_LIMIT: u64 = 50;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Persists a new order with its items and payment record.
    async fn create_order(&self, order: Order) -> Result<Order, ServiceError>;

    async fn get_order(&self, id: &str) -> Result<Order, ServiceError>;

    async fn get_order_by_tracking_id(&self, tracking_id: &str) -> Result<Order, ServiceError>;

    /// Replaces customer info, status, metadata, fulfillment time and the payment record.
    /// Creation time, tracking id and items are left untouched.
    async fn update_order(&self, order: Order) -> Result<Order, ServiceError>;

    async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
    ) -> Result<Order, ServiceError>;

    /// Applies the payment transition; a successful payment also marks the order paid.
    async fn update_payment_status(
        &self,
        id: &str,
        status: PaymentStatus,
    ) -> Result<Order, ServiceError>;

    /// Orders placed by `email`, newest first.
    async fn get_customer_orders(&self, email: &str) -> Result<Vec<Order>, ServiceError>;

    /// Summaries of all orders, newest first.
    async fn get_all_orders(
        &self,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<OrderSummary>, ServiceError>;

    async fn add_payment_event(&self, event: NewPaymentEvent)
        -> Result<PaymentEvent, ServiceError>;

    /// Events for an order by `created_at`; equal timestamps keep insertion order.
    async fn get_payment_events(&self, order_id: &str) -> Result<Vec<PaymentEvent>, ServiceError>;

    async fn get_payment_stats(&self) -> Result<PaymentStats, ServiceError>;

    async fn find_order_by_payment_intent_id(
        &self,
        payment_intent_id: &str,
    ) -> Result<Order, ServiceError>;

    async fn find_order_by_session_id(&self, session_id: &str) -> Result<Order, ServiceError>;

    async fn health_check(&self) -> Result<(), ServiceError>;

    /// Short backend name reported by the health endpoint.
    fn backend_name(&self) -> &'static str;
}

/// Builds the backend named by `store_backend`, connecting and migrating when it is the database.
pub async fn build_store(config: &AppConfig) -> Result<Arc<dyn PaymentStore>, ServiceError> {
    if config.uses_database_store() {
        let pool = db::establish_connection_from_app_config(config).await?;
        if config.auto_migrate {
            db::run_migrations(&pool).await?;
        }
        info!("Using database payment store");
        Ok(Arc::new(DatabasePaymentStore::new(Arc::new(pool))))
    } else {
        info!("Using in-memory payment store");
        Ok(Arc::new(InMemoryPaymentStore::new()))
    }
}

pub(crate) fn validate_new_order(order: &Order) -> Result<(), ServiceError> {
    if order.id.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "order id is required".to_string(),
        ));
    }
    if order.tracking_id.trim().is_empty() {
        return Err(ServiceError::ValidationError(
            "tracking id is required".to_string(),
        ));
    }
    Ok(())
}

/// Clamps a page window to `len` items, returning the slice bounds.
pub(crate) fn page_bounds(len: usize, limit: u64, offset: u64) -> (usize, usize) {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
    let take = usize::try_from(limit).unwrap_or(usize::MAX);
    let end = start.saturating_add(take).min(len);
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_bounds_clamp_to_length() {
        assert_eq!(page_bounds(10, 5, 0), (0, 5));
        assert_eq!(page_bounds(10, 5, 8), (8, 10));
        assert_eq!(page_bounds(10, 5, 10), (10, 10));
        assert_eq!(page_bounds(10, 50, 99), (10, 10));
        assert_eq!(page_bounds(3, u64::MAX, 1), (1, 3));
    }
}
