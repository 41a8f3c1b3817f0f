#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{Method, Request},
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use tokio::{sync::mpsc, task::JoinHandle};
use tower::ServiceExt;
use uuid::Uuid;

use checkout_payments::{
    config::{AppConfig, GatewayMode},
    db,
    entities::product,
    events::{self, EventSender},
    gateway::{self, PaymentGateway},
    handlers::AppServices,
    AppState,
};

pub const TEST_INTEGRITY_SECRET: &str = "test_integrity_secret";

/// Card whose last digit is even; the simulated gateway approves it.
pub const APPROVED_CARD: &str = "4242424242424242";
/// Card whose last digit is odd; the simulated gateway declines it.
pub const DECLINED_CARD: &str = "4111111111111111";

/// Test application harness that wires the full router against an in-memory
/// SQLite database.
pub struct TestApp {
    router: Router,
    pub state: AppState,
    _event_task: JoinHandle<()>,
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new(
        "sqlite::memory:".to_string(),
        "127.0.0.1".to_string(),
        0,
        "test".to_string(),
    );
    cfg.gateway.integrity_secret = TEST_INTEGRITY_SECRET.to_string();
    cfg.gateway.public_key = "pub_test_key".to_string();
    cfg.gateway.private_key = "prv_test_key".to_string();
    cfg
}

impl TestApp {
    /// Full stack with the simulated gateway.
    pub async fn new() -> Self {
        let mut cfg = test_config();
        cfg.gateway.mode = GatewayMode::Simulated;
        let gateway = gateway::from_config(&cfg.gateway).expect("simulated gateway");
        Self::with_gateway(cfg, gateway).await
    }

    /// Full stack with the HTTP gateway pointed at `base_url`.
    pub async fn with_processor(base_url: &str) -> Self {
        let mut cfg = test_config();
        cfg.gateway.mode = GatewayMode::Live;
        cfg.gateway.base_url = base_url.to_string();
        cfg.gateway.request_timeout_secs = 2;
        let gateway = gateway::from_config(&cfg.gateway).expect("http gateway");
        Self::with_gateway(cfg, gateway).await
    }

    pub async fn with_gateway(cfg: AppConfig, gateway: Arc<dyn PaymentGateway>) -> Self {
        let pool = db::establish_connection(&cfg.database_url)
            .await
            .expect("failed to connect to sqlite");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations");
        let db_arc = Arc::new(pool);

        let (event_tx, event_rx) = mpsc::channel(64);
        let event_sender = EventSender::new(event_tx);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let services = AppServices::new(
            db_arc.clone(),
            Arc::new(event_sender),
            gateway.clone(),
            &cfg,
        );

        let state = AppState {
            db: db_arc,
            config: cfg,
            services,
            gateway,
        };

        Self {
            router: checkout_payments::app_router(state.clone()),
            state,
            _event_task: event_task,
        }
    }

    /// Send a request against the router with optional extra headers.
    pub async fn request_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Body>,
        headers: &[(&str, &str)],
    ) -> axum::response::Response {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder
            .body(body.unwrap_or_else(Body::empty))
            .expect("failed to build request");
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router error during test request")
    }

    /// JSON request helper.
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> axum::response::Response {
        match body {
            Some(json) => {
                let bytes = serde_json::to_vec(&json).expect("failed to serialize json body");
                self.request_with_headers(
                    method,
                    uri,
                    Some(Body::from(bytes)),
                    &[("content-type", "application/json")],
                )
                .await
            }
            None => self.request_with_headers(method, uri, None, &[]).await,
        }
    }

    pub async fn seed_product(&self, name: &str, stock: i32, price: Decimal) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            description: Set(None),
            price: Set(price),
            stock: Set(stock),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product for tests")
    }

    pub async fn stock_of(&self, product_id: Uuid) -> i32 {
        product::Entity::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("query product")
            .expect("product exists")
            .stock
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self._event_task.abort();
    }
}

pub async fn response_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read response body");
    serde_json::from_slice(&bytes).expect("response body is json")
}

pub fn customer() -> Value {
    json!({ "name": "Ana Gómez", "email": "ana@example.com", "phone": "+573001234567" })
}

pub fn line_item(product_id: Uuid, quantity: i32, unit_price: &str) -> Value {
    json!({ "product_id": product_id, "quantity": quantity, "unit_price": unit_price })
}

pub fn card(number: &str) -> Value {
    json!({
        "number": number,
        "expiry": "08/29",
        "cvc": "123",
        "card_holder": "ANA GOMEZ"
    })
}

pub fn checkout_body(items: Vec<Value>, total: &str, card_number: &str) -> Value {
    json!({
        "line_items": items,
        "customer_info": customer(),
        "total_amount": total,
        "currency": "COP",
        "credit_card": card(card_number),
    })
}
