use sea_orm_migration::prelude::*;

pub struct Migrator;

// Value sets frozen with the schema; the wire enums must stay within them
const ORDER_STATUSES: [&str; 6] = ["created", "pending", "paid", "fulfilled", "canceled", "refunded"];
const PAYMENT_STATUSES: [&str; 5] = ["pending", "succeeded", "failed", "canceled", "refunded"];
const PAYMENT_METHODS: [&str; 4] = ["card", "paypal", "apple_pay", "google_pay"];

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240101_000001_create_orders_table::Migration),
            Box::new(m20240101_000002_create_order_items_table::Migration),
            Box::new(m20240101_000003_create_payments_table::Migration),
            Box::new(m20240101_000004_create_payment_events_table::Migration),
        ]
    }
}

mod m20240101_000001_create_orders_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000001_create_orders_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Orders::Id).string().not_null().primary_key())
                        .col(ColumnDef::new(Orders::TrackingId).string().not_null())
                        .col(ColumnDef::new(Orders::CustomerEmail).string().not_null())
                        .col(ColumnDef::new(Orders::CustomerName).string().null())
                        .col(ColumnDef::new(Orders::CustomerPhone).string().null())
                        .col(ColumnDef::new(Orders::CustomerIpAddress).string().null())
                        .col(
                            ColumnDef::new(Orders::Status)
                                .string_len(32)
                                .not_null()
                                .check(Expr::col(Orders::Status).is_in(super::ORDER_STATUSES)),
                        )
                        .col(
                            ColumnDef::new(Orders::Metadata)
                                .text()
                                .not_null()
                                .default("{}"),
                        )
                        .col(
                            ColumnDef::new(Orders::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Orders::FulfilledAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_tracking_id")
                        .table(Orders::Table)
                        .col(Orders::TrackingId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_customer_email")
                        .table(Orders::Table)
                        .col(Orders::CustomerEmail)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_created_at")
                        .table(Orders::Table)
                        .col(Orders::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(crate) enum Orders {
        Table,
        Id,
        TrackingId,
        CustomerEmail,
        CustomerName,
        CustomerPhone,
        CustomerIpAddress,
        Status,
        Metadata,
        CreatedAt,
        UpdatedAt,
        FulfilledAt,
    }
}

mod m20240101_000002_create_order_items_table {

    use super::m20240101_000001_create_orders_table::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000002_create_order_items_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(OrderItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderItems::Id)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(OrderItems::OrderId).string().not_null())
                        .col(ColumnDef::new(OrderItems::Position).integer().not_null())
                        .col(ColumnDef::new(OrderItems::ProductId).string().not_null())
                        .col(ColumnDef::new(OrderItems::ProductName).string().not_null())
                        .col(
                            ColumnDef::new(OrderItems::FileType)
                                .string()
                                .not_null()
                                .default(""),
                        )
                        // Decimal text keeps prices exact on every backend
                        .col(ColumnDef::new(OrderItems::Price).string().not_null())
                        .col(ColumnDef::new(OrderItems::Quantity).integer().not_null())
                        .col(ColumnDef::new(OrderItems::DownloadUrl).string().null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_items_order_id")
                                .from(OrderItems::Table, OrderItems::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_items_order_position")
                        .table(OrderItems::Table)
                        .col(OrderItems::OrderId)
                        .col(OrderItems::Position)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(OrderItems::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum OrderItems {
        Table,
        Id,
        OrderId,
        Position,
        ProductId,
        ProductName,
        FileType,
        Price,
        Quantity,
        DownloadUrl,
    }
}

mod m20240101_000003_create_payments_table {

    use super::m20240101_000001_create_orders_table::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000003_create_payments_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Payments::OrderId)
                                .string()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Payments::StripePaymentIntentId).string().null())
                        .col(ColumnDef::new(Payments::StripeSessionId).string().null())
                        .col(ColumnDef::new(Payments::Amount).big_integer().not_null())
                        .col(ColumnDef::new(Payments::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(Payments::Status)
                                .string_len(32)
                                .not_null()
                                .check(Expr::col(Payments::Status).is_in(super::PAYMENT_STATUSES)),
                        )
                        .col(
                            ColumnDef::new(Payments::Method)
                                .string_len(32)
                                .null()
                                .check(Expr::col(Payments::Method).is_in(super::PAYMENT_METHODS)),
                        )
                        .col(
                            ColumnDef::new(Payments::ProcessedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Payments::RefundedAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_order_id")
                                .from(Payments::Table, Payments::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_stripe_payment_intent_id")
                        .table(Payments::Table)
                        .col(Payments::StripePaymentIntentId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_stripe_session_id")
                        .table(Payments::Table)
                        .col(Payments::StripeSessionId)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        OrderId,
        StripePaymentIntentId,
        StripeSessionId,
        Amount,
        Currency,
        Status,
        Method,
        ProcessedAt,
        RefundedAt,
    }
}

mod m20240101_000004_create_payment_events_table {

    use super::m20240101_000001_create_orders_table::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240101_000004_create_payment_events_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentEvents::Table)
                        .if_not_exists()
                        // Insertion sequence breaks ties between equal timestamps
                        .col(
                            ColumnDef::new(PaymentEvents::Seq)
                                .integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(PaymentEvents::Id)
                                .string()
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(PaymentEvents::OrderId).string().not_null())
                        .col(ColumnDef::new(PaymentEvents::EventType).string().not_null())
                        .col(
                            ColumnDef::new(PaymentEvents::Status)
                                .string_len(32)
                                .not_null()
                                .check(
                                    Expr::col(PaymentEvents::Status)
                                        .is_in(super::PAYMENT_STATUSES),
                                ),
                        )
                        .col(
                            ColumnDef::new(PaymentEvents::Data)
                                .text()
                                .not_null()
                                .default("{}"),
                        )
                        .col(
                            ColumnDef::new(PaymentEvents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payment_events_order_id")
                                .from(PaymentEvents::Table, PaymentEvents::OrderId)
                                .to(Orders::Table, Orders::Id)
                                .on_delete(ForeignKeyAction::Cascade)
                                .on_update(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_events_order_id")
                        .table(PaymentEvents::Table)
                        .col(PaymentEvents::OrderId)
                        .col(PaymentEvents::CreatedAt)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentEvents::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentEvents {
        Table,
        Seq,
        Id,
        OrderId,
        EventType,
        Status,
        Data,
        CreatedAt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, PaymentMethod, PaymentStatus};
    use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, Iterable};

    async fn migrated_sqlite() -> DatabaseConnection {
        let mut opt = ConnectOptions::new("sqlite::memory:");
        opt.max_connections(1);
        let db = Database::connect(opt).await.unwrap();
        Migrator::up(&db, None).await.unwrap();
        db
    }

    fn insert_order(id: &str, status: &str) -> String {
        format!(
            "INSERT INTO orders (id, tracking_id, customer_email, status, created_at, updated_at) \
             VALUES ('{id}', 'TRK-{id}', 'a@example.com', '{status}', \
             '2024-01-01T00:00:00Z', '2024-01-01T00:00:00Z')"
        )
    }

    fn insert_payment(order_id: &str, status: &str, method: &str) -> String {
        format!(
            "INSERT INTO payments (order_id, amount, currency, status, method) \
             VALUES ('{order_id}', 999, 'usd', '{status}', {method})"
        )
    }

    fn insert_event(id: &str, order_id: &str, status: &str) -> String {
        format!(
            "INSERT INTO payment_events (id, order_id, event_type, status, created_at) \
             VALUES ('{id}', '{order_id}', 'note', '{status}', '2024-01-01T00:00:00Z')"
        )
    }

    #[test]
    fn migrations_are_ordered_by_name() {
        let names: Vec<String> = Migrator::migrations()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 4);
    }

    #[test]
    fn frozen_value_sets_cover_every_enum_variant() {
        for status in OrderStatus::iter() {
            assert!(ORDER_STATUSES.contains(&status.as_str()), "{:?}", status);
        }
        for status in PaymentStatus::iter() {
            assert!(PAYMENT_STATUSES.contains(&status.as_str()), "{:?}", status);
        }
        for method in PaymentMethod::iter() {
            assert!(PAYMENT_METHODS.contains(&method.as_str()), "{:?}", method);
        }
    }

    #[tokio::test]
    async fn migrations_apply_to_fresh_sqlite() {
        let db = migrated_sqlite().await;
        assert!(db.ping().await.is_ok());
    }

    #[tokio::test]
    async fn status_columns_reject_values_outside_their_sets() {
        let db = migrated_sqlite().await;

        for (n, status) in ORDER_STATUSES.iter().enumerate() {
            db.execute_unprepared(&insert_order(&format!("ORD{}", n), status))
                .await
                .unwrap();
        }
        assert!(db.execute_unprepared(&insert_order("ORDX", "bogus")).await.is_err());

        db.execute_unprepared(&insert_payment("ORD0", "pending", "'card'"))
            .await
            .unwrap();
        db.execute_unprepared(&insert_payment("ORD1", "succeeded", "NULL"))
            .await
            .unwrap();
        assert!(db
            .execute_unprepared(&insert_payment("ORD2", "bogus", "NULL"))
            .await
            .is_err());
        assert!(db
            .execute_unprepared(&insert_payment("ORD3", "pending", "'bitcoin'"))
            .await
            .is_err());

        db.execute_unprepared(&insert_event("evt_1", "ORD0", "refunded"))
            .await
            .unwrap();
        assert!(db
            .execute_unprepared(&insert_event("evt_2", "ORD0", "bogus"))
            .await
            .is_err());
    }
}
