use async_trait::async_trait;
use chrono::Local;
use metrics::counter;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use super::{page_bounds, validate_new_order, PaymentStore};
use crate::errors::ServiceError;
use crate::models::{
    now, NewPaymentEvent, Order, OrderFigures, OrderStatus, OrderSummary, PaymentEvent,
    PaymentInfo, PaymentStats, PaymentStatus,
};

#[derive(Debug, Default)]
struct Inner {
    orders: HashMap<String, Order>,
    by_tracking_id: HashMap<String, String>,
    by_email: HashMap<String, Vec<String>>,
    by_payment_intent: HashMap<String, String>,
    by_session: HashMap<String, String>,
    events: HashMap<String, Vec<PaymentEvent>>,
}

impl Inner {
    fn order(&self, id: &str) -> Result<&Order, ServiceError> {
        self.orders
            .get(id)
            .ok_or_else(|| ServiceError::order_not_found(id))
    }

    fn order_mut(&mut self, id: &str) -> Result<&mut Order, ServiceError> {
        self.orders
            .get_mut(id)
            .ok_or_else(|| ServiceError::order_not_found(id))
    }

    /// Fails when a gateway id in `payment` already belongs to a different order.
    fn check_gateway_ids(&self, order_id: &str, payment: &PaymentInfo) -> Result<(), ServiceError> {
        let bound = |index: &HashMap<String, String>, key: &Option<String>| {
            key.as_ref()
                .and_then(|k| index.get(k))
                .map_or(false, |owner| owner != order_id)
        };
        if bound(&self.by_payment_intent, &payment.stripe_payment_intent_id) {
            return Err(ServiceError::Conflict(
                "payment intent is already linked to another order".to_string(),
            ));
        }
        if bound(&self.by_session, &payment.stripe_session_id) {
            return Err(ServiceError::Conflict(
                "checkout session is already linked to another order".to_string(),
            ));
        }
        Ok(())
    }

    fn index_gateway_ids(&mut self, order_id: &str, payment: &PaymentInfo) {
        if let Some(intent) = &payment.stripe_payment_intent_id {
            self.by_payment_intent
                .insert(intent.clone(), order_id.to_string());
        }
        if let Some(session) = &payment.stripe_session_id {
            self.by_session.insert(session.clone(), order_id.to_string());
        }
    }

    fn unindex_gateway_ids(&mut self, payment: &PaymentInfo) {
        if let Some(intent) = &payment.stripe_payment_intent_id {
            self.by_payment_intent.remove(intent);
        }
        if let Some(session) = &payment.stripe_session_id {
            self.by_session.remove(session);
        }
    }

    fn unindex_email(&mut self, email: &str, order_id: &str) {
        if let Some(ids) = self.by_email.get_mut(email) {
            ids.retain(|id| id != order_id);
            if ids.is_empty() {
                self.by_email.remove(email);
            }
        }
    }

    fn lookup(&self, index: &HashMap<String, String>, key: &str, what: &str) -> Result<Order, ServiceError> {
        index
            .get(key)
            .and_then(|id| self.orders.get(id))
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("No order found for {} {}", what, key)))
    }
}

fn newest_first(a: &Order, b: &Order) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Process-local store guarded by a single async read/write lock.
///
/// Every read hands out clones, so callers never alias stored state.
#[derive(Debug, Default)]
pub struct InMemoryPaymentStore {
    inner: RwLock<Inner>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_order(&self, mut order: Order) -> Result<Order, ServiceError> {
        validate_new_order(&order)?;

        let mut inner = self.inner.write().await;
        if inner.orders.contains_key(&order.id) {
            return Err(ServiceError::Conflict(format!(
                "Order {} already exists",
                order.id
            )));
        }
        if inner.by_tracking_id.contains_key(&order.tracking_id) {
            return Err(ServiceError::Conflict(format!(
                "Tracking id {} is already in use",
                order.tracking_id
            )));
        }
        inner.check_gateway_ids(&order.id, &order.payment)?;

        let at = now();
        order.created_at = at;
        order.updated_at = at;

        inner
            .by_tracking_id
            .insert(order.tracking_id.clone(), order.id.clone());
        inner
            .by_email
            .entry(order.customer_info.email.clone())
            .or_default()
            .push(order.id.clone());
        inner.index_gateway_ids(&order.id, &order.payment);
        inner.orders.insert(order.id.clone(), order.clone());

        counter!("payment_tracker_store.orders_created", 1);
        debug!("Order stored in memory");
        Ok(order)
    }

    async fn get_order(&self, id: &str) -> Result<Order, ServiceError> {
        self.inner.read().await.order(id).cloned()
    }

    async fn get_order_by_tracking_id(&self, tracking_id: &str) -> Result<Order, ServiceError> {
        let inner = self.inner.read().await;
        inner.lookup(&inner.by_tracking_id, tracking_id, "tracking id")
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn update_order(&self, order: Order) -> Result<Order, ServiceError> {
        let mut inner = self.inner.write().await;
        let existing = inner.order(&order.id)?.clone();
        inner.check_gateway_ids(&order.id, &order.payment)?;

        if existing.customer_info.email != order.customer_info.email {
            inner.unindex_email(&existing.customer_info.email, &order.id);
            inner
                .by_email
                .entry(order.customer_info.email.clone())
                .or_default()
                .push(order.id.clone());
        }
        inner.unindex_gateway_ids(&existing.payment);
        inner.index_gateway_ids(&order.id, &order.payment);

        let stored = inner.order_mut(&order.id)?;
        stored.customer_info = order.customer_info;
        stored.status = order.status;
        stored.metadata = order.metadata;
        stored.fulfilled_at = order.fulfilled_at;
        stored.payment = order.payment;
        stored.updated_at = now();

        Ok(stored.clone())
    }

    #[instrument(skip(self))]
    async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
    ) -> Result<Order, ServiceError> {
        let mut inner = self.inner.write().await;
        let order = inner.order_mut(id)?;
        order.apply_order_status(status, now());
        Ok(order.clone())
    }

    #[instrument(skip(self))]
    async fn update_payment_status(
        &self,
        id: &str,
        status: PaymentStatus,
    ) -> Result<Order, ServiceError> {
        let mut inner = self.inner.write().await;
        let order = inner.order_mut(id)?;
        order.apply_payment_status(status, now());
        Ok(order.clone())
    }

    async fn get_customer_orders(&self, email: &str) -> Result<Vec<Order>, ServiceError> {
        let inner = self.inner.read().await;
        let mut orders: Vec<Order> = inner
            .by_email
            .get(email)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.orders.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        orders.sort_by(newest_first);
        Ok(orders)
    }

    async fn get_all_orders(
        &self,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<OrderSummary>, ServiceError> {
        let inner = self.inner.read().await;
        let mut orders: Vec<&Order> = inner.orders.values().collect();
        orders.sort_by(|a, b| newest_first(a, b));

        let (start, end) = page_bounds(orders.len(), limit, offset);
        Ok(orders[start..end]
            .iter()
            .map(|order| OrderSummary::from(*order))
            .collect())
    }

    #[instrument(skip(self, event), fields(order_id = %event.order_id, event_type = %event.event_type))]
    async fn add_payment_event(
        &self,
        event: NewPaymentEvent,
    ) -> Result<PaymentEvent, ServiceError> {
        let mut inner = self.inner.write().await;
        inner.order(&event.order_id)?;

        let event = event.into_event();
        inner
            .events
            .entry(event.order_id.clone())
            .or_default()
            .push(event.clone());

        counter!("payment_tracker_store.events_recorded", 1);
        Ok(event)
    }

    async fn get_payment_events(&self, order_id: &str) -> Result<Vec<PaymentEvent>, ServiceError> {
        let mut events = self
            .inner
            .read()
            .await
            .events
            .get(order_id)
            .cloned()
            .unwrap_or_default();
        events.sort_by_key(|event| event.created_at);
        Ok(events)
    }

    async fn get_payment_stats(&self) -> Result<PaymentStats, ServiceError> {
        let inner = self.inner.read().await;
        Ok(PaymentStats::compute(
            inner.orders.values().map(OrderFigures::from),
            Local::now(),
        ))
    }

    async fn find_order_by_payment_intent_id(
        &self,
        payment_intent_id: &str,
    ) -> Result<Order, ServiceError> {
        let inner = self.inner.read().await;
        inner.lookup(&inner.by_payment_intent, payment_intent_id, "payment intent")
    }

    async fn find_order_by_session_id(&self, session_id: &str) -> Result<Order, ServiceError> {
        let inner = self.inner.read().await;
        inner.lookup(&inner.by_session, session_id, "checkout session")
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "in-memory"
    }
}
