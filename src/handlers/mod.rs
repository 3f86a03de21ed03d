pub mod common;
pub mod payment_webhooks;
pub mod payments;
pub mod products;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

pub use payments::payment_routes;
pub use products::product_routes;
