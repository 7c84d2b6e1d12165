use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{fail, Actor, ApiError, ApiJson, ApiPath, ApiQuery, ApiResponse, AppState, RequestId, IDEMPOTENCY_HEADER};
use crate::domain::aggregates::{DraftLine, Order, OrderDraft, OrderStatus, Permission};
use crate::store::{OrderFilter, Page, Pagination, Placement};
use crate::StoreError;

#[derive(Debug, Deserialize)]
pub(in crate::api) struct ListOrdersParams {
    pub customer_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize, Validate)]
pub(in crate::api) struct CreateOrderRequest {
    /// Defaults to the caller.
    pub customer_id: Option<Uuid>,
    #[validate(length(min = 1, message = "an order needs at least one item"))]
    pub items: Vec<OrderItemRequest>,
    #[serde(default)]
    pub discount: Decimal,
    pub payment_method: Option<String>,
    #[validate(length(max = 500))]
    pub delivery_address: Option<String>,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(in crate::api) struct OrderItemRequest {
    pub product_id: Uuid,
    pub quantity: u32,
    pub unit_price: Decimal,
}

#[derive(Debug, Deserialize)]
pub(in crate::api) struct UpdateStatusRequest {
    pub status: OrderStatus,
}

/// GET /api/orders: callers without the view-all permission see only their own orders.
pub(in crate::api) async fn list_orders(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiQuery(params): ApiQuery<ListOrdersParams>,
) -> Result<Json<ApiResponse<Page<Order>>>, ApiError> {
    let customer_id = if actor.can(Permission::ViewAllOrders) { params.customer_id } else { Some(actor.id()) };
    let filter = OrderFilter {
        customer_id,
        status: params.status,
        date_from: params.date_from,
        date_to: params.date_to,
        pagination: Pagination::new(params.page, params.limit),
    };
    let page = state.store.list_orders(&filter).await.map_err(fail(&rid))?;
    Ok(ApiResponse::new(&rid, page))
}

pub(in crate::api) async fn get_order(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    let order = load_visible(&state, &rid, &actor, id).await?;
    Ok(ApiResponse::new(&rid, order))
}

/// POST /api/orders: 201 when the order is placed, 200 when the
/// `Idempotency-Key` matched an earlier order.
pub(in crate::api) async fn create_order(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    headers: HeaderMap,
    ApiJson(body): ApiJson<CreateOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Order>>), ApiError> {
    body.validate().map_err(|e| ApiError::from_store(&rid, e.into()))?;

    let customer_id = body.customer_id.unwrap_or(actor.id());
    if customer_id != actor.id() {
        actor.require(Permission::Sell).map_err(fail(&rid))?;
    }
    let idempotency_key = match headers.get(IDEMPOTENCY_HEADER) {
        None => None,
        Some(raw) => {
            let key = raw.to_str().map(str::trim).unwrap_or_default();
            if key.is_empty() || key.len() > 255 {
                return Err(ApiError::new(rid.0.as_str(), "validation_error", "Idempotency-Key must be 1-255 visible characters"));
            }
            Some(key.to_string())
        }
    };

    let draft = OrderDraft {
        customer_id,
        lines: body
            .items
            .iter()
            .map(|i| DraftLine { product_id: i.product_id, quantity: i.quantity, unit_price: i.unit_price })
            .collect(),
        discount: body.discount,
        payment_method: body.payment_method,
        delivery_address: body.delivery_address,
        notes: body.notes,
        idempotency_key,
    };

    match state.checkout.place_order(draft).await.map_err(fail(&rid))? {
        Placement::Created(order) => Ok((StatusCode::CREATED, ApiResponse::new(&rid, order))),
        Placement::Replayed(order) => Ok((StatusCode::OK, ApiResponse::new(&rid, order))),
    }
}

/// PUT /api/orders/:id/status: staff move orders along; customers may only
/// cancel their own.
pub(in crate::api) async fn update_status(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<UpdateStatusRequest>,
) -> Result<Json<ApiResponse<Order>>, ApiError> {
    if !actor.can(Permission::ManageOrders) {
        let order = load_visible(&state, &rid, &actor, id).await?;
        let own_cancel = body.status == OrderStatus::Cancelled && order.customer_id() == actor.id();
        if !own_cancel {
            return Err(ApiError::from_store(&rid, StoreError::Forbidden(actor.0.role)));
        }
    }
    let order = state.checkout.transition(id, body.status).await.map_err(fail(&rid))?;
    Ok(ApiResponse::new(&rid, order))
}

/// Orders outside the caller's reach look like missing ones.
async fn load_visible(state: &AppState, rid: &RequestId, actor: &Actor, id: Uuid) -> Result<Order, ApiError> {
    match state.store.get_order(id).await.map_err(fail(rid))? {
        Some(order) if actor.can(Permission::ViewAllOrders) || order.customer_id() == actor.id() => Ok(order),
        _ => Err(ApiError::from_store(rid, StoreError::order_not_found(id))),
    }
}
