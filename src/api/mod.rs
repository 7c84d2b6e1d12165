mod auth;
mod cart;
mod extract;
mod lots;
mod middleware;
mod orders;
mod payments;
mod products;
mod users;

pub use auth::{Actor, MaybeActor, PROFILE_HEADER};
pub use extract::{ApiJson, ApiPath, ApiQuery};
pub use middleware::{request_id, RequestId};

use axum::{
    extract::State,
    http::{header, HeaderName, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::cache::QueryCache;
use crate::checkout::CheckoutService;
use crate::config::AppConfig;
use crate::payments::{PaymentTracker, SimulatedGateway};
use crate::publisher::EventPublisher;
use crate::store::Store;
use crate::StoreError;

pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub cache: QueryCache,
    pub publisher: EventPublisher,
    pub checkout: Arc<CheckoutService>,
    pub tracker: Arc<PaymentTracker>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Wires the services around `store` from `config`.
    pub fn new(store: Arc<dyn Store>, config: AppConfig, publisher: EventPublisher) -> Self {
        let cache = QueryCache::new(config.query_cache_ttl, config.query_cache_max_entries);
        let tracker = Arc::new(PaymentTracker::new(config.payment_settle_delay));
        let gateway = Arc::new(SimulatedGateway::new(config.payment_approval_rate, config.gateways.clone()));
        let checkout = Arc::new(CheckoutService::new(
            store.clone(),
            cache.clone(),
            publisher.clone(),
            gateway,
            tracker.clone(),
            config.tax_rate,
            config.currency.clone(),
        ));
        Self { store, cache, publisher, checkout, tracker, config: Arc::new(config) }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: T,
    pub meta: ResponseMeta,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn new(request_id: &RequestId, data: T) -> Json<Self> {
        Json(Self { data, meta: ResponseMeta::new(request_id.0.clone()) })
    }
}

#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ResponseMeta {
    fn new(request_id: String) -> Self {
        Self { request_id, timestamp: Utc::now() }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: ErrorBody,
    pub meta: ResponseMeta,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(request_id: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody { code: code.into(), message: message.into() },
            meta: ResponseMeta::new(request_id.into()),
        }
    }

    /// Maps a crate error onto the wire. Storage failures are logged and
    /// reported without their details.
    pub fn from_store(request_id: &RequestId, error: StoreError) -> Self {
        let rid = request_id.0.as_str();
        match error {
            StoreError::NotFound(_) => Self::new(rid, "not_found", error.to_string()),
            StoreError::InsufficientStock { .. } => Self::new(rid, "insufficient_stock", error.to_string()),
            StoreError::Validation(msg) => Self::new(rid, "validation_error", msg),
            StoreError::Conflict(msg) => Self::new(rid, "conflict", msg),
            StoreError::SaleNumberTaken(_) => Self::new(rid, "conflict", error.to_string()),
            StoreError::Unauthorized => Self::new(rid, "unauthorized", error.to_string()),
            StoreError::Forbidden(_) => Self::new(rid, "forbidden", error.to_string()),
            StoreError::PaymentDeclined(_) => Self::new(rid, "payment_declined", error.to_string()),
            StoreError::Corrupt(_) | StoreError::Database(_) | StoreError::Migration(_) => {
                tracing::error!(request_id = %rid, error = %error, "storage operation failed");
                Self::new(rid, "internal_error", "storage operation failed")
            }
        }
    }
}

/// `.map_err(fail(&rid))?` for handlers.
pub(crate) fn fail(request_id: &RequestId) -> impl FnOnce(StoreError) -> ApiError + '_ {
    move |e| ApiError::from_store(request_id, e)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self.error.code.as_str() {
            "not_found" => StatusCode::NOT_FOUND,
            "unauthorized" => StatusCode::UNAUTHORIZED,
            "forbidden" => StatusCode::FORBIDDEN,
            "validation_error" | "payment_declined" => StatusCode::BAD_REQUEST,
            "conflict" | "insufficient_stock" => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

fn build_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static(PROFILE_HEADER),
            HeaderName::from_static(IDEMPOTENCY_HEADER),
        ])
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/products", get(products::list_products).post(products::create_product))
        .route(
            "/api/products/:id",
            get(products::get_product).put(products::update_product).delete(products::deactivate_product),
        )
        .route("/api/products/:id/lots", get(lots::list_lots).post(lots::receive_lot))
        .route("/api/orders", get(orders::list_orders).post(orders::create_order))
        .route("/api/orders/:id", get(orders::get_order))
        .route("/api/orders/:id/status", put(orders::update_status))
        .route("/api/cart/:session", get(cart::get_cart).delete(cart::clear_cart))
        .route("/api/cart/:session/items", post(cart::add_item))
        .route("/api/cart/:session/items/:product_id", put(cart::update_item).delete(cart::remove_item))
        .route("/api/cart/:session/reconcile", post(cart::reconcile))
        .route("/api/payments/methods", get(payments::list_methods))
        .route("/api/payment", post(payments::pay).put(payments::confirm))
        .route("/api/payments/status/:payment_id", get(payments::status))
        .route("/api/users", get(users::list_users).post(users::create_user))
        .route("/api/users/:id", get(users::get_user))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(build_cors())
                .layer(axum::middleware::from_fn(request_id)),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthData {
    status: &'static str,
    service: &'static str,
    store: &'static str,
    events: &'static str,
}

async fn health(State(state): State<AppState>, Extension(rid): Extension<RequestId>) -> impl IntoResponse {
    let events = if state.publisher.is_connected() { "nats" } else { "log" };
    match state.store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            ApiResponse::new(&rid, HealthData { status: "healthy", service: "qualipharm-store", store: "ok", events }),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "health check: store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                ApiResponse::new(&rid, HealthData { status: "degraded", service: "qualipharm-store", store: "unavailable", events }),
            )
        }
    }
}
