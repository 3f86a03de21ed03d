//! Domain model shared by the stores, the webhook dispatcher and the HTTP layer.

pub mod event;
pub mod order;
pub mod stats;

pub use event::{EventData, NewPaymentEvent, PaymentEvent};
pub use order::{
    cents_to_major, generate_order_id, generate_tracking_id, now, total_amount_cents,
    CustomerInfo, Order, OrderItem, OrderStatus, PaymentInfo, PaymentMethod, PaymentStatus,
};
pub use stats::{OrderFigures, OrderSummary, PaymentStats};
