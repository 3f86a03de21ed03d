#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::{self, Body},
    http::{header, Method, Request},
    response::Response,
    Router,
};
use mockall::mock;
use rust_decimal::Decimal;
use serde_json::Value;
use tower::ServiceExt;

use payment_tracker::{
    app_router,
    config::AppConfig,
    db::{establish_connection_with_config, run_migrations, DbConfig},
    errors::ServiceError,
    gateway::{
        validate_object_id, CheckoutRequest, CheckoutSession, PaymentGateway, PaymentIntent,
        Product,
    },
    models::{
        CustomerInfo, NewPaymentEvent, Order, OrderItem, OrderStatus, OrderSummary, PaymentEvent,
        PaymentStats, PaymentStatus,
    },
    store::{DatabasePaymentStore, InMemoryPaymentStore, PaymentStore},
    webhooks::{sign_payload, SIGNATURE_HEADER},
    AppState,
};

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Which store implementation a test runs against.
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    InMemory,
    Sqlite,
}

/// A fresh store for `backend`. SQLite runs in memory on a single pooled connection
/// so every query sees the same database.
pub async fn store_for(backend: Backend) -> Arc<dyn PaymentStore> {
    match backend {
        Backend::InMemory => Arc::new(InMemoryPaymentStore::new()),
        Backend::Sqlite => Arc::new(sqlite_store().await),
    }
}

pub async fn sqlite_store() -> DatabasePaymentStore {
    let cfg = DbConfig {
        url: "sqlite::memory:".into(),
        max_connections: 1,
        min_connections: 1,
        ..Default::default()
    };
    let db = establish_connection_with_config(&cfg)
        .await
        .expect("sqlite connection");
    run_migrations(&db).await.expect("migrations");
    DatabasePaymentStore::new(Arc::new(db))
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "127.0.0.1".to_string(),
        18_080,
        "test".to_string(),
    );
    cfg.stripe_secret_key = "sk_test_123".to_string();
    cfg.stripe_webhook_secret = Some(WEBHOOK_SECRET.to_string());
    cfg
}

pub fn item(product_id: &str, price: Decimal, quantity: i32) -> OrderItem {
    OrderItem {
        product_id: product_id.to_string(),
        product_name: format!("Product {}", product_id),
        file_type: "wav".to_string(),
        price,
        quantity,
        download_url: None,
    }
}

pub fn sample_order(id: &str, tracking_id: &str, email: &str, items: Vec<OrderItem>) -> Order {
    Order::new(
        id,
        tracking_id,
        CustomerInfo {
            email: email.to_string(),
            name: Some("Test Buyer".to_string()),
            phone: None,
            ip_address: Some("203.0.113.7".to_string()),
        },
        items,
        "usd",
    )
    .expect("valid order")
}

/// Gateway double that keeps intents in memory and hands out sequential ids.
#[derive(Default)]
pub struct StubGateway {
    next_id: AtomicUsize,
    fail: AtomicBool,
    intents: Mutex<HashMap<String, PaymentIntent>>,
    metadata: Mutex<Vec<BTreeMap<String, String>>>,
    checkouts: Mutex<Vec<CheckoutRequest>>,
    products: Mutex<Vec<Product>>,
    product_limits: Mutex<Vec<u64>>,
}

impl StubGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent call fails with a gateway error.
    pub fn fail_requests(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Changes the status the processor reports for an intent.
    pub fn set_intent_status(&self, id: &str, status: &str) {
        if let Some(intent) = self.intents.lock().unwrap().get_mut(id) {
            intent.status = status.to_string();
        }
    }

    /// Metadata sent with each created intent, in call order.
    pub fn intent_metadata(&self) -> Vec<BTreeMap<String, String>> {
        self.metadata.lock().unwrap().clone()
    }

    pub fn checkout_requests(&self) -> Vec<CheckoutRequest> {
        self.checkouts.lock().unwrap().clone()
    }

    /// Adds an active product to the catalogue.
    pub fn add_product(&self, id: &str, name: &str) {
        self.products.lock().unwrap().push(Product {
            id: id.to_string(),
            name: name.to_string(),
            description: Some(format!("{} description", name)),
            images: vec![format!("https://files.example.com/{}.png", id)],
            metadata: BTreeMap::new(),
        });
    }

    /// Page sizes requested from the catalogue, in call order.
    pub fn product_limits(&self) -> Vec<u64> {
        self.product_limits.lock().unwrap().clone()
    }

    fn check_available(&self) -> Result<(), ServiceError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(ServiceError::ExternalServiceError(
                "Stripe API error (status: 500): stub failure".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn next(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    async fn create_payment_intent(
        &self,
        amount: i64,
        currency: &str,
        _description: Option<&str>,
        metadata: &BTreeMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError> {
        self.check_available()?;
        let id = format!("pi_test_{}", self.next());
        let intent = PaymentIntent {
            client_secret: Some(format!("{}_secret", id)),
            id: id.clone(),
            status: "requires_payment_method".to_string(),
            amount,
            currency: currency.to_string(),
        };
        self.intents.lock().unwrap().insert(id, intent.clone());
        self.metadata.lock().unwrap().push(metadata.clone());
        Ok(intent)
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ServiceError> {
        validate_object_id("payment", id)?;
        self.check_available()?;
        self.intents
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| {
                ServiceError::ExternalServiceError(format!("No such payment_intent: '{}'", id))
            })
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession, ServiceError> {
        self.check_available()?;
        self.checkouts.lock().unwrap().push(request.clone());
        let id = format!("cs_test_{}", self.next());
        Ok(CheckoutSession {
            url: Some(format!("https://checkout.stripe.com/c/pay/{}", id)),
            id,
        })
    }

    async fn list_products(&self, limit: u64) -> Result<Vec<Product>, ServiceError> {
        self.check_available()?;
        self.product_limits.lock().unwrap().push(limit);
        Ok(self
            .products
            .lock()
            .unwrap()
            .iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get_product(&self, id: &str) -> Result<Product, ServiceError> {
        validate_object_id("product", id)?;
        self.check_available()?;
        self.products
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| ServiceError::ExternalServiceError(format!("No such product: '{}'", id)))
    }
}

mock! {
    pub Store {}

    #[async_trait]
    impl PaymentStore for Store {
        async fn create_order(&self, order: Order) -> Result<Order, ServiceError>;
        async fn get_order(&self, id: &str) -> Result<Order, ServiceError>;
        async fn get_order_by_tracking_id(&self, tracking_id: &str) -> Result<Order, ServiceError>;
        async fn update_order(&self, order: Order) -> Result<Order, ServiceError>;
        async fn update_order_status(&self, id: &str, status: OrderStatus) -> Result<Order, ServiceError>;
        async fn update_payment_status(&self, id: &str, status: PaymentStatus) -> Result<Order, ServiceError>;
        async fn get_customer_orders(&self, email: &str) -> Result<Vec<Order>, ServiceError>;
        async fn get_all_orders(&self, limit: u64, offset: u64) -> Result<Vec<OrderSummary>, ServiceError>;
        async fn add_payment_event(&self, event: NewPaymentEvent) -> Result<PaymentEvent, ServiceError>;
        async fn get_payment_events(&self, order_id: &str) -> Result<Vec<PaymentEvent>, ServiceError>;
        async fn get_payment_stats(&self) -> Result<PaymentStats, ServiceError>;
        async fn find_order_by_payment_intent_id(&self, payment_intent_id: &str) -> Result<Order, ServiceError>;
        async fn find_order_by_session_id(&self, session_id: &str) -> Result<Order, ServiceError>;
        async fn health_check(&self) -> Result<(), ServiceError>;
        fn backend_name(&self) -> &'static str;
    }
}

/// Router plus handles on its store and gateway.
pub struct TestApp {
    router: Router,
    pub store: Arc<dyn PaymentStore>,
    pub gateway: Arc<StubGateway>,
    pub config: AppConfig,
}

impl TestApp {
    /// Application over the in-memory store.
    pub async fn new() -> Self {
        Self::with_store(Arc::new(InMemoryPaymentStore::new()))
    }

    /// Application over an in-memory SQLite database.
    pub async fn with_database() -> Self {
        Self::with_store(Arc::new(sqlite_store().await))
    }

    pub fn with_store(store: Arc<dyn PaymentStore>) -> Self {
        Self::with_parts(store, test_config())
    }

    pub fn with_parts(store: Arc<dyn PaymentStore>, config: AppConfig) -> Self {
        let gateway = Arc::new(StubGateway::new());
        let state = AppState::new(store.clone(), gateway.clone(), config.clone());
        Self {
            router: app_router(state),
            store,
            gateway,
            config,
        }
    }

    pub async fn request(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        self.router
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("router response")
    }

    pub async fn get(&self, uri: &str) -> Response {
        self.request(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> Response {
        self.request(Method::POST, uri, Some(body)).await
    }

    pub async fn post_empty(&self, uri: &str) -> Response {
        self.request(Method::POST, uri, None).await
    }

    /// Sends a raw webhook body with an optional `Stripe-Signature` header.
    pub async fn post_webhook_raw(&self, body: Vec<u8>, signature: Option<String>) -> Response {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/api/payments/webhook")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        self.router
            .clone()
            .oneshot(builder.body(Body::from(body)).expect("request"))
            .await
            .expect("router response")
    }

    /// Sends `event` signed with the configured secret at the current time.
    pub async fn post_webhook(&self, event: &Value) -> Response {
        let body = event.to_string().into_bytes();
        let signature = sign_payload(&body, WEBHOOK_SECRET, chrono::Utc::now().timestamp())
            .expect("signature");
        self.post_webhook_raw(body, Some(signature)).await
    }

    /// Creates an order through the API and returns the response body.
    pub async fn create_order(&self, email: &str, items: Value) -> Value {
        let response = self
            .post(
                "/api/payments/create-order",
                serde_json::json!({
                    "customer_info": {"email": email, "name": "Test Buyer"},
                    "items": items,
                }),
            )
            .await;
        assert_eq!(response.status(), 201, "order creation should succeed");
        response_json(response).await
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
