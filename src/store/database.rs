use async_trait::async_trait;
use chrono::Local;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
    TransactionTrait,
};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::{validate_new_order, PaymentStore};
use crate::entities::{order, order_item, payment, payment_event};
use crate::errors::ServiceError;
use crate::models::{
    now, CustomerInfo, EventData, NewPaymentEvent, Order, OrderFigures, OrderItem, OrderStatus,
    OrderSummary, PaymentEvent, PaymentInfo, PaymentStats, PaymentStatus,
};

/// Relational store built on sea-orm. Works against SQLite and PostgreSQL.
#[derive(Debug, Clone)]
pub struct DatabasePaymentStore {
    db: Arc<DatabaseConnection>,
}

impl DatabasePaymentStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn insert_error(err: DbErr) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(detail)) => ServiceError::Conflict(detail),
        Some(SqlErr::ForeignKeyConstraintViolation(detail)) => ServiceError::NotFound(detail),
        _ => ServiceError::DatabaseError(err),
    }
}

fn order_row(order: &Order) -> Result<order::ActiveModel, ServiceError> {
    Ok(order::ActiveModel {
        id: Set(order.id.clone()),
        tracking_id: Set(order.tracking_id.clone()),
        customer_email: Set(order.customer_info.email.clone()),
        customer_name: Set(order.customer_info.name.clone()),
        customer_phone: Set(order.customer_info.phone.clone()),
        customer_ip_address: Set(order.customer_info.ip_address.clone()),
        status: Set(order.status),
        metadata: Set(serde_json::to_string(&order.metadata)?),
        created_at: Set(order.created_at),
        updated_at: Set(order.updated_at),
        fulfilled_at: Set(order.fulfilled_at),
    })
}

fn item_rows(order_id: &str, items: &[OrderItem]) -> Vec<order_item::ActiveModel> {
    items
        .iter()
        .enumerate()
        .map(|(position, item)| order_item::ActiveModel {
            id: NotSet,
            order_id: Set(order_id.to_string()),
            position: Set(position as i32),
            product_id: Set(item.product_id.clone()),
            product_name: Set(item.product_name.clone()),
            file_type: Set(item.file_type.clone()),
            price: Set(item.price.normalize().to_string()),
            quantity: Set(item.quantity),
            download_url: Set(item.download_url.clone()),
        })
        .collect()
}

fn payment_row(order_id: &str, payment: &PaymentInfo) -> payment::ActiveModel {
    payment::ActiveModel {
        order_id: Set(order_id.to_string()),
        stripe_payment_intent_id: Set(payment.stripe_payment_intent_id.clone()),
        stripe_session_id: Set(payment.stripe_session_id.clone()),
        amount: Set(payment.amount),
        currency: Set(payment.currency.clone()),
        status: Set(payment.status),
        method: Set(payment.method),
        processed_at: Set(payment.processed_at),
        refunded_at: Set(payment.refunded_at),
    }
}

fn item_from_row(row: order_item::Model) -> Result<OrderItem, ServiceError> {
    let price = Decimal::from_str(&row.price).map_err(|e| {
        ServiceError::InternalError(format!("Stored price {:?} is not a decimal: {}", row.price, e))
    })?;
    Ok(OrderItem {
        product_id: row.product_id,
        product_name: row.product_name,
        file_type: row.file_type,
        price,
        quantity: row.quantity,
        download_url: row.download_url,
    })
}

fn assemble(
    row: order::Model,
    items: Vec<order_item::Model>,
    payment: Option<payment::Model>,
) -> Result<Order, ServiceError> {
    let payment = payment.ok_or_else(|| {
        ServiceError::InternalError(format!("Order {} has no payment record", row.id))
    })?;
    let metadata: BTreeMap<String, String> = if row.metadata.is_empty() {
        BTreeMap::new()
    } else {
        serde_json::from_str(&row.metadata)?
    };
    let items = items
        .into_iter()
        .map(item_from_row)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Order {
        id: row.id,
        tracking_id: row.tracking_id,
        customer_info: CustomerInfo {
            email: row.customer_email,
            name: row.customer_name,
            phone: row.customer_phone,
            ip_address: row.customer_ip_address,
        },
        items,
        payment: PaymentInfo {
            stripe_payment_intent_id: payment.stripe_payment_intent_id,
            stripe_session_id: payment.stripe_session_id,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
            method: payment.method,
            processed_at: payment.processed_at,
            refunded_at: payment.refunded_at,
        },
        status: row.status,
        metadata,
        created_at: row.created_at,
        updated_at: row.updated_at,
        fulfilled_at: row.fulfilled_at,
    })
}

fn event_from_row(row: payment_event::Model) -> Result<PaymentEvent, ServiceError> {
    let value = serde_json::from_str(&row.data)?;
    Ok(PaymentEvent {
        data: EventData::from_parts(&row.event_type, value),
        id: row.id,
        order_id: row.order_id,
        event_type: row.event_type,
        status: row.status,
        created_at: row.created_at,
    })
}

async fn load_order<C: ConnectionTrait>(conn: &C, id: &str) -> Result<Order, ServiceError> {
    let row = order::Entity::find_by_id(id.to_string())
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::order_not_found(id))?;
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(id))
        .order_by_asc(order_item::Column::Position)
        .all(conn)
        .await?;
    let payment = payment::Entity::find_by_id(id.to_string()).one(conn).await?;
    assemble(row, items, payment)
}

/// Loads items and payments for a batch of order rows with two `IN` queries,
/// preserving the row order.
async fn load_orders<C: ConnectionTrait>(
    conn: &C,
    rows: Vec<order::Model>,
) -> Result<Vec<Order>, ServiceError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<String> = rows.iter().map(|row| row.id.clone()).collect();

    let mut items: HashMap<String, Vec<order_item::Model>> = HashMap::new();
    for item in order_item::Entity::find()
        .filter(order_item::Column::OrderId.is_in(ids.clone()))
        .order_by_asc(order_item::Column::OrderId)
        .order_by_asc(order_item::Column::Position)
        .all(conn)
        .await?
    {
        items.entry(item.order_id.clone()).or_default().push(item);
    }

    let mut payments: HashMap<String, payment::Model> = payment::Entity::find()
        .filter(payment::Column::OrderId.is_in(ids))
        .all(conn)
        .await?
        .into_iter()
        .map(|p| (p.order_id.clone(), p))
        .collect();

    rows.into_iter()
        .map(|row| {
            let order_items = items.remove(&row.id).unwrap_or_default();
            let payment = payments.remove(&row.id);
            assemble(row, order_items, payment)
        })
        .collect()
}

/// Writes every mutable column of the order and its payment record.
async fn write_order<C: ConnectionTrait>(conn: &C, order: &Order) -> Result<(), ServiceError> {
    let mut row = order_row(order)?;
    row.created_at = NotSet;
    row.tracking_id = NotSet;
    order::Entity::update(row)
        .exec(conn)
        .await
        .map_err(insert_error)?;
    payment::Entity::update(payment_row(&order.id, &order.payment))
        .exec(conn)
        .await
        .map_err(insert_error)?;
    Ok(())
}

/// Fails when a gateway id in `payment` already belongs to a different order.
async fn check_gateway_ids<C: ConnectionTrait>(
    conn: &C,
    order_id: &str,
    payment: &PaymentInfo,
) -> Result<(), ServiceError> {
    if let Some(intent) = &payment.stripe_payment_intent_id {
        let taken = payment::Entity::find()
            .filter(payment::Column::StripePaymentIntentId.eq(intent.as_str()))
            .filter(payment::Column::OrderId.ne(order_id))
            .count(conn)
            .await?;
        if taken > 0 {
            return Err(ServiceError::Conflict(
                "payment intent is already linked to another order".to_string(),
            ));
        }
    }
    if let Some(session) = &payment.stripe_session_id {
        let taken = payment::Entity::find()
            .filter(payment::Column::StripeSessionId.eq(session.as_str()))
            .filter(payment::Column::OrderId.ne(order_id))
            .count(conn)
            .await?;
        if taken > 0 {
            return Err(ServiceError::Conflict(
                "checkout session is already linked to another order".to_string(),
            ));
        }
    }
    Ok(())
}

impl DatabasePaymentStore {
    async fn find_by_payment_column(
        &self,
        column: payment::Column,
        value: &str,
        what: &str,
    ) -> Result<Order, ServiceError> {
        let payment = payment::Entity::find()
            .filter(column.eq(value))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("No order found for {} {}", what, value)))?;
        load_order(self.db.as_ref(), &payment.order_id).await
    }
}

#[async_trait]
impl PaymentStore for DatabasePaymentStore {
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_order(&self, mut order: Order) -> Result<Order, ServiceError> {
        validate_new_order(&order)?;

        let at = now();
        order.created_at = at;
        order.updated_at = at;

        let txn = self.db.begin().await?;

        if order::Entity::find_by_id(order.id.clone())
            .one(&txn)
            .await?
            .is_some()
        {
            return Err(ServiceError::Conflict(format!(
                "Order {} already exists",
                order.id
            )));
        }
        let tracking_taken = order::Entity::find()
            .filter(order::Column::TrackingId.eq(order.tracking_id.as_str()))
            .count(&txn)
            .await?;
        if tracking_taken > 0 {
            return Err(ServiceError::Conflict(format!(
                "Tracking id {} is already in use",
                order.tracking_id
            )));
        }
        check_gateway_ids(&txn, &order.id, &order.payment).await?;

        order::Entity::insert(order_row(&order)?)
            .exec_without_returning(&txn)
            .await
            .map_err(insert_error)?;
        let items = item_rows(&order.id, &order.items);
        if !items.is_empty() {
            order_item::Entity::insert_many(items)
                .exec_without_returning(&txn)
                .await
                .map_err(insert_error)?;
        }
        payment::Entity::insert(payment_row(&order.id, &order.payment))
            .exec_without_returning(&txn)
            .await
            .map_err(insert_error)?;

        txn.commit().await?;

        counter!("payment_tracker_store.orders_created", 1);
        debug!("Order persisted");
        Ok(order)
    }

    async fn get_order(&self, id: &str) -> Result<Order, ServiceError> {
        load_order(self.db.as_ref(), id).await
    }

    async fn get_order_by_tracking_id(&self, tracking_id: &str) -> Result<Order, ServiceError> {
        let row = order::Entity::find()
            .filter(order::Column::TrackingId.eq(tracking_id))
            .one(self.db.as_ref())
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No order found for tracking id {}", tracking_id))
            })?;
        load_order(self.db.as_ref(), &row.id).await
    }

    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn update_order(&self, order: Order) -> Result<Order, ServiceError> {
        let txn = self.db.begin().await?;

        let mut stored = load_order(&txn, &order.id).await?;
        check_gateway_ids(&txn, &order.id, &order.payment).await?;

        stored.customer_info = order.customer_info;
        stored.status = order.status;
        stored.metadata = order.metadata;
        stored.fulfilled_at = order.fulfilled_at;
        stored.payment = order.payment;
        stored.updated_at = now();

        write_order(&txn, &stored).await?;
        txn.commit().await?;
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
    ) -> Result<Order, ServiceError> {
        let txn = self.db.begin().await?;
        let mut order = load_order(&txn, id).await?;
        order.apply_order_status(status, now());
        write_order(&txn, &order).await?;
        txn.commit().await?;
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn update_payment_status(
        &self,
        id: &str,
        status: PaymentStatus,
    ) -> Result<Order, ServiceError> {
        let txn = self.db.begin().await?;
        let mut order = load_order(&txn, id).await?;
        order.apply_payment_status(status, now());
        write_order(&txn, &order).await?;
        txn.commit().await?;
        Ok(order)
    }

    async fn get_customer_orders(&self, email: &str) -> Result<Vec<Order>, ServiceError> {
        let rows = order::Entity::find()
            .filter(order::Column::CustomerEmail.eq(email))
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .all(self.db.as_ref())
            .await?;
        load_orders(self.db.as_ref(), rows).await
    }

    async fn get_all_orders(
        &self,
        limit: u64,
        offset: u64,
    ) -> Result<Vec<OrderSummary>, ServiceError> {
        // Bound parameters are signed 64-bit on every backend
        let max = i64::MAX as u64;
        let rows = order::Entity::find()
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .limit(limit.min(max))
            .offset(offset.min(max))
            .all(self.db.as_ref())
            .await?;
        let orders = load_orders(self.db.as_ref(), rows).await?;
        Ok(orders.iter().map(OrderSummary::from).collect())
    }

    #[instrument(skip(self, event), fields(order_id = %event.order_id, event_type = %event.event_type))]
    async fn add_payment_event(
        &self,
        event: NewPaymentEvent,
    ) -> Result<PaymentEvent, ServiceError> {
        let exists = order::Entity::find_by_id(event.order_id.clone())
            .count(self.db.as_ref())
            .await?;
        if exists == 0 {
            return Err(ServiceError::order_not_found(&event.order_id));
        }

        let event = event.into_event();
        payment_event::Entity::insert(payment_event::ActiveModel {
            seq: NotSet,
            id: Set(event.id.clone()),
            order_id: Set(event.order_id.clone()),
            event_type: Set(event.event_type.clone()),
            status: Set(event.status),
            data: Set(event.data.to_json()?.to_string()),
            created_at: Set(event.created_at),
        })
        .exec_without_returning(self.db.as_ref())
        .await
        .map_err(insert_error)?;

        counter!("payment_tracker_store.events_recorded", 1);
        Ok(event)
    }

    async fn get_payment_events(&self, order_id: &str) -> Result<Vec<PaymentEvent>, ServiceError> {
        let mut events = payment_event::Entity::find()
            .filter(payment_event::Column::OrderId.eq(order_id))
            .order_by_asc(payment_event::Column::CreatedAt)
            .order_by_asc(payment_event::Column::Seq)
            .all(self.db.as_ref())
            .await?
            .into_iter()
            .map(event_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        events.sort_by_key(|event| event.created_at);
        Ok(events)
    }

    async fn get_payment_stats(&self) -> Result<PaymentStats, ServiceError> {
        let rows: Vec<(OrderStatus, chrono::DateTime<chrono::Utc>, i64)> = order::Entity::find()
            .select_only()
            .column(order::Column::Status)
            .column(order::Column::CreatedAt)
            .column(payment::Column::Amount)
            .inner_join(payment::Entity)
            .into_tuple()
            .all(self.db.as_ref())
            .await?;

        Ok(PaymentStats::compute(
            rows.into_iter()
                .map(|(status, created_at, amount)| OrderFigures {
                    status,
                    amount,
                    created_at,
                }),
            Local::now(),
        ))
    }

    async fn find_order_by_payment_intent_id(
        &self,
        payment_intent_id: &str,
    ) -> Result<Order, ServiceError> {
        self.find_by_payment_column(
            payment::Column::StripePaymentIntentId,
            payment_intent_id,
            "payment intent",
        )
        .await
    }

    async fn find_order_by_session_id(&self, session_id: &str) -> Result<Order, ServiceError> {
        self.find_by_payment_column(payment::Column::StripeSessionId, session_id, "checkout session")
            .await
    }

    async fn health_check(&self) -> Result<(), ServiceError> {
        crate::db::check_connection(&self.db).await
    }

    fn backend_name(&self) -> &'static str {
        "database"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{establish_connection_with_config, run_migrations, DbConfig};
    use rust_decimal_macros::dec;
    use serde_json::json;

    async fn store() -> DatabasePaymentStore {
        let cfg = DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let db = establish_connection_with_config(&cfg).await.unwrap();
        run_migrations(&db).await.unwrap();
        DatabasePaymentStore::new(Arc::new(db))
    }

    fn order(id: &str, tracking: &str) -> Order {
        Order::new(
            id,
            tracking,
            CustomerInfo {
                email: "buyer@example.com".into(),
                name: Some("Ada".into()),
                ..Default::default()
            },
            vec![
                OrderItem {
                    product_id: "p1".into(),
                    product_name: "Drum Samples".into(),
                    file_type: "wav".into(),
                    price: dec!(19.99),
                    quantity: 2,
                    download_url: Some("https://cdn.example.com/p1".into()),
                },
                OrderItem {
                    product_id: "p2".into(),
                    product_name: "Preset Bank".into(),
                    file_type: "zip".into(),
                    price: dec!(0.125),
                    quantity: 1,
                    download_url: None,
                },
            ],
            "usd",
        )
        .expect("valid order")
    }

    #[tokio::test]
    async fn prices_and_item_order_survive_storage() {
        let store = store().await;
        store.create_order(order("ORD1", "TRK1")).await.unwrap();

        let loaded = store.get_order("ORD1").await.unwrap();
        assert_eq!(loaded.items[0].price, dec!(19.99));
        assert_eq!(loaded.items[1].price, dec!(0.125));
        assert_eq!(loaded.items[0].product_id, "p1");
        assert_eq!(loaded.customer_info.name.as_deref(), Some("Ada"));
    }

    #[tokio::test]
    async fn metadata_round_trips() {
        let store = store().await;
        let mut created = order("ORD1", "TRK1");
        created.metadata.insert("campaign".into(), "spring".into());
        store.create_order(created).await.unwrap();

        let loaded = store.get_order("ORD1").await.unwrap();
        assert_eq!(loaded.metadata.get("campaign").map(String::as_str), Some("spring"));
    }

    #[tokio::test]
    async fn events_for_missing_orders_are_rejected() {
        let store = store().await;
        let result = store
            .add_payment_event(NewPaymentEvent::new(
                "ORD404",
                PaymentStatus::Pending,
                EventData::Other(json!({})),
            ))
            .await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn typed_event_payloads_are_rebuilt_from_storage() {
        let store = store().await;
        store.create_order(order("ORD1", "TRK1")).await.unwrap();
        store
            .add_payment_event(NewPaymentEvent::new(
                "ORD1",
                PaymentStatus::Pending,
                EventData::OrderCreated(crate::models::event::OrderCreatedData {
                    payment_intent_id: "pi_1".into(),
                }),
            ))
            .await
            .unwrap();

        let events = store.get_payment_events("ORD1").await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].data, EventData::OrderCreated(_)));
    }
}
