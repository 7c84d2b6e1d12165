use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::{fail, ApiError, ApiJson, ApiPath, ApiQuery, ApiResponse, AppState, RequestId};
use crate::checkout::{CheckoutItem, CheckoutReceipt, CheckoutRequest, CheckoutStatus};
use crate::payments::{enabled_methods, FeeQuote, MethodInfo, PaymentMethod, PaymentStatus};
use crate::StoreError;

#[derive(Debug, Deserialize)]
pub(in crate::api) struct MethodsParams {
    /// Quote each method's fee for paying this amount.
    pub amount: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub(in crate::api) struct MethodView {
    #[serde(flatten)]
    pub method: MethodInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quote: Option<FeeQuote>,
}

#[derive(Debug, Serialize)]
pub(in crate::api) struct MethodsView {
    pub methods: Vec<MethodView>,
    pub currency: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub(in crate::api) struct PayRequest {
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub items: Vec<PayItem>,
    /// Check out this cart session instead of `items`.
    pub cart_session: Option<String>,
    #[validate(email)]
    pub customer_email: Option<String>,
    #[validate(length(max = 200))]
    pub customer_name: Option<String>,
    #[validate(length(max = 50))]
    pub customer_phone: Option<String>,
    #[validate(length(max = 500))]
    pub shipping_address: Option<String>,
    #[validate(length(max = 100))]
    pub shipping_city: Option<String>,
    #[validate(length(max = 1000))]
    pub shipping_notes: Option<String>,
    #[serde(alias = "userId")]
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    pub discount: Decimal,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(in crate::api) struct PayItem {
    pub product_id: Uuid,
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(in crate::api) struct ConfirmRequest {
    #[serde(alias = "paymentIntentId")]
    pub payment_id: String,
}

pub(in crate::api) async fn list_methods(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiQuery(params): ApiQuery<MethodsParams>,
) -> Result<Json<ApiResponse<MethodsView>>, ApiError> {
    if let Some(amount) = params.amount {
        if amount < Decimal::ZERO || amount.round_dp(2) != amount {
            return Err(ApiError::from_store(&rid, StoreError::Validation(format!("amount {amount} must be a non-negative amount in cents"))));
        }
    }
    let methods = enabled_methods(&state.config.gateways)
        .into_iter()
        .map(|method| MethodView { quote: params.amount.map(|amount| method.quote(amount)), method })
        .collect();
    Ok(ApiResponse::new(&rid, MethodsView { methods, currency: state.config.currency.clone() }))
}

/// POST /api/payment: charges, then places the order and records the sale.
/// Card payments answer 202 with a client secret and finish on PUT.
pub(in crate::api) async fn pay(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiJson(body): ApiJson<PayRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CheckoutReceipt>>), ApiError> {
    body.validate().map_err(|e| ApiError::from_store(&rid, e.into()))?;

    let request = CheckoutRequest {
        method: body.payment_method,
        customer_id: body.customer_id,
        customer_email: body.customer_email,
        customer_name: body.customer_name,
        customer_phone: body.customer_phone,
        shipping_address: body.shipping_address,
        shipping_city: body.shipping_city,
        shipping_notes: body.shipping_notes,
        items: body.items.iter().map(|i| CheckoutItem { product_id: i.product_id, quantity: i.quantity }).collect(),
        cart_session: body.cart_session,
        discount: body.discount,
    };
    let receipt = state.checkout.pay_and_checkout(request).await.map_err(fail(&rid))?;
    let status = match receipt.status {
        CheckoutStatus::Completed => StatusCode::CREATED,
        CheckoutStatus::RequiresConfirmation => StatusCode::ACCEPTED,
    };
    Ok((status, ApiResponse::new(&rid, receipt)))
}

/// PUT /api/payment: confirms an authorised card payment.
pub(in crate::api) async fn confirm(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiJson(body): ApiJson<ConfirmRequest>,
) -> Result<Json<ApiResponse<CheckoutReceipt>>, ApiError> {
    let receipt = state.checkout.confirm_card_payment(body.payment_id.trim()).await.map_err(fail(&rid))?;
    Ok(ApiResponse::new(&rid, receipt))
}

pub(in crate::api) async fn status(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiPath(payment_id): ApiPath<String>,
) -> Json<ApiResponse<PaymentStatus>> {
    ApiResponse::new(&rid, state.tracker.status(&payment_id).await)
}
