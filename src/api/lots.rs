use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::{fail, Actor, ApiError, ApiJson, ApiPath, ApiResponse, AppState, RequestId};
use crate::domain::aggregates::{Lot, Permission};
use crate::domain::events::{DomainEvent, ProductEvent};
use crate::store::LotReceipt;

#[derive(Debug, Deserialize, Validate)]
pub(in crate::api) struct ReceiveLotRequest {
    #[validate(length(min = 1, max = 100))]
    pub lot_number: Option<String>,
    #[validate(range(min = 1))]
    pub quantity: u32,
    pub purchase_price: Option<Decimal>,
    /// `YYYY-MM-DD`
    pub expires_on: NaiveDate,
}

pub(in crate::api) async fn list_lots(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiPath(product_id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<Vec<Lot>>>, ApiError> {
    actor.require(Permission::ManageInventory).map_err(fail(&rid))?;
    let lots = state.store.list_lots(product_id).await.map_err(fail(&rid))?;
    Ok(ApiResponse::new(&rid, lots))
}

/// POST /api/products/:id/lots: stock enters the catalog only through lots.
pub(in crate::api) async fn receive_lot(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiPath(product_id): ApiPath<Uuid>,
    ApiJson(body): ApiJson<ReceiveLotRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Lot>>), ApiError> {
    actor.require(Permission::ManageInventory).map_err(fail(&rid))?;
    body.validate().map_err(|e| ApiError::from_store(&rid, e.into()))?;

    let receipt = LotReceipt {
        lot_number: body.lot_number.map(|n| n.trim().to_string()),
        quantity: body.quantity,
        purchase_price: body.purchase_price,
        expires_on: body.expires_on,
    };
    let lot = state.store.receive_lot(product_id, receipt).await.map_err(fail(&rid))?;
    state.cache.invalidate();
    state
        .publisher
        .publish(&DomainEvent::Product(ProductEvent::LotReceived { product_id, lot_id: lot.id, quantity: lot.initial_quantity }))
        .await;
    tracing::info!(%product_id, lot = %lot.lot_number, quantity = lot.initial_quantity, expires_on = %lot.expires_on, "lot received");
    Ok((StatusCode::CREATED, ApiResponse::new(&rid, lot)))
}
