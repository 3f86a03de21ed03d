//! sea-orm entities backing [`DatabasePaymentStore`](crate::store::DatabasePaymentStore).

pub mod order;
pub mod order_item;
pub mod payment;
pub mod payment_event;
