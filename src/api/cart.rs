use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{fail, ApiError, ApiJson, ApiPath, ApiResponse, AppState, RequestId};
use crate::domain::aggregates::{Cart, CartAdjustment, CartItem, CartProduct};
use crate::StoreError;

const MAX_SESSION_LEN: usize = 128;

#[derive(Debug, Serialize)]
pub(in crate::api) struct CartView {
    pub session_id: String,
    pub items: Vec<CartItem>,
    pub item_count: u32,
    pub total: Decimal,
    pub currency: String,
}

impl CartView {
    fn of(cart: &Cart) -> Self {
        let total = cart.total();
        Self {
            session_id: cart.session_id().to_string(),
            items: cart.items().to_vec(),
            item_count: cart.item_count(),
            total: total.amount(),
            currency: total.currency().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(in crate::api) struct ReconcileView {
    pub cart: CartView,
    pub adjustments: Vec<CartAdjustment>,
}

#[derive(Debug, Deserialize)]
pub(in crate::api) struct AddItemRequest {
    pub product_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub(in crate::api) struct UpdateItemRequest {
    /// Zero or less removes the line.
    pub quantity: i64,
}

fn check_session(rid: &RequestId, session: &str) -> Result<(), ApiError> {
    if session.trim().is_empty() || session.len() > MAX_SESSION_LEN {
        return Err(ApiError::new(rid.0.as_str(), "validation_error", format!("session id must be 1-{MAX_SESSION_LEN} characters")));
    }
    Ok(())
}

async fn load(state: &AppState, rid: &RequestId, session: &str) -> Result<Cart, ApiError> {
    check_session(rid, session)?;
    let cart = state.store.load_cart(session).await.map_err(fail(rid))?;
    Ok(cart.unwrap_or_else(|| Cart::new(session, &state.config.currency)))
}

pub(in crate::api) async fn get_cart(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiPath(session): ApiPath<String>,
) -> Result<Json<ApiResponse<CartView>>, ApiError> {
    let cart = load(&state, &rid, &session).await?;
    Ok(ApiResponse::new(&rid, CartView::of(&cart)))
}

/// POST /api/cart/:session/items: adds one unit, refusing to pass the stock
/// the product had when it entered the cart.
pub(in crate::api) async fn add_item(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiPath(session): ApiPath<String>,
    ApiJson(body): ApiJson<AddItemRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CartView>>), ApiError> {
    let mut cart = load(&state, &rid, &session).await?;
    let product = state
        .store
        .get_product(body.product_id)
        .await
        .map_err(fail(&rid))?
        .ok_or_else(|| ApiError::from_store(&rid, StoreError::product_not_found(body.product_id)))?;
    if !product.active {
        return Err(ApiError::from_store(&rid, StoreError::Conflict(format!("product {} is no longer sold", product.id))));
    }

    let quantity = cart.add_item(CartProduct::from(&product)).map_err(|e| ApiError::from_store(&rid, e.into()))?;
    state.store.save_cart(&cart).await.map_err(fail(&rid))?;
    tracing::debug!(%session, product_id = %product.id, quantity, "item added to cart");
    Ok((StatusCode::CREATED, ApiResponse::new(&rid, CartView::of(&cart))))
}

pub(in crate::api) async fn update_item(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiPath((session, product_id)): ApiPath<(String, Uuid)>,
    ApiJson(body): ApiJson<UpdateItemRequest>,
) -> Result<Json<ApiResponse<CartView>>, ApiError> {
    let mut cart = load(&state, &rid, &session).await?;
    cart.update_quantity(product_id, body.quantity).map_err(|e| ApiError::from_store(&rid, e.into()))?;
    state.store.save_cart(&cart).await.map_err(fail(&rid))?;
    Ok(ApiResponse::new(&rid, CartView::of(&cart)))
}

pub(in crate::api) async fn remove_item(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiPath((session, product_id)): ApiPath<(String, Uuid)>,
) -> Result<Json<ApiResponse<CartView>>, ApiError> {
    let mut cart = load(&state, &rid, &session).await?;
    cart.remove_item(product_id).map_err(|e| ApiError::from_store(&rid, e.into()))?;
    state.store.save_cart(&cart).await.map_err(fail(&rid))?;
    Ok(ApiResponse::new(&rid, CartView::of(&cart)))
}

pub(in crate::api) async fn clear_cart(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiPath(session): ApiPath<String>,
) -> Result<StatusCode, ApiError> {
    check_session(&rid, &session)?;
    state.store.delete_cart(&session).await.map_err(fail(&rid))?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/cart/:session/reconcile: refreshes prices and stock ceilings from
/// the catalog and reports what changed.
pub(in crate::api) async fn reconcile(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiPath(session): ApiPath<String>,
) -> Result<Json<ApiResponse<ReconcileView>>, ApiError> {
    check_session(&rid, &session)?;
    let (cart, report) = state.checkout.reconcile_cart(&session).await.map_err(fail(&rid))?;
    Ok(ApiResponse::new(&rid, ReconcileView { cart: CartView::of(&cart), adjustments: report.adjustments }))
}
