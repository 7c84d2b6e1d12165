use axum::{
    extract::State,
    http::StatusCode,
    Extension, Json,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;
use validator::Validate;

use super::{fail, Actor, ApiError, ApiJson, ApiPath, ApiQuery, ApiResponse, AppState, MaybeActor, RequestId};
use crate::domain::aggregates::{Permission, Product, ProductDraft, ProductUpdate};
use crate::domain::events::{DomainEvent, ProductEvent};
use crate::domain::value_objects::ProductCode;
use crate::store::{Page, Pagination, ProductFilter};
use crate::StoreError;

#[derive(Debug, Deserialize)]
pub(in crate::api) struct ListProductsParams {
    pub search: Option<String>,
    pub category_id: Option<Uuid>,
    pub brand: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl From<ListProductsParams> for ProductFilter {
    fn from(p: ListProductsParams) -> Self {
        let trimmed = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        Self {
            search: trimmed(p.search),
            category_id: p.category_id,
            brand: trimmed(p.brand),
            min_price: p.min_price,
            max_price: p.max_price,
            pagination: Pagination::new(p.page, p.limit),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub(in crate::api) struct CreateProductRequest {
    #[validate(length(min = 1, max = 50))]
    pub code: String,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub description: Option<String>,
    #[validate(length(max = 100))]
    pub brand: Option<String>,
    pub category_id: Option<Uuid>,
    pub supplier_id: Option<Uuid>,
    pub purchase_price: Option<Decimal>,
    pub sale_price: Decimal,
    #[serde(default)]
    pub min_stock: u32,
    pub max_stock: Option<u32>,
    #[validate(url)]
    pub image_url: Option<String>,
}

/// GET /api/products: active products, served from the listing cache when fresh.
pub(in crate::api) async fn list_products(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    ApiQuery(params): ApiQuery<ListProductsParams>,
) -> Result<Json<ApiResponse<Page<Product>>>, ApiError> {
    let filter = ProductFilter::from(params);
    if let Some(page) = state.cache.product_page(&filter).await {
        return Ok(ApiResponse::new(&rid, page));
    }
    let page = state.store.list_products(&filter).await.map_err(fail(&rid))?;
    state.cache.store_product_page(&filter, page.clone()).await;
    Ok(ApiResponse::new(&rid, page))
}

/// GET /api/products/:id: inactive products are visible to catalog managers only.
pub(in crate::api) async fn get_product(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    MaybeActor(actor): MaybeActor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<Product>>, ApiError> {
    let product = state.store.get_product(id).await.map_err(fail(&rid))?;
    let manager = actor.is_some_and(|p| p.can(Permission::ManageCatalog));
    match product {
        Some(p) if p.active || manager => Ok(ApiResponse::new(&rid, p)),
        _ => Err(ApiError::from_store(&rid, StoreError::product_not_found(id))),
    }
}

pub(in crate::api) async fn create_product(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiJson(body): ApiJson<CreateProductRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Product>>), ApiError> {
    actor.require(Permission::ManageCatalog).map_err(fail(&rid))?;
    body.validate().map_err(|e| ApiError::from_store(&rid, e.into()))?;

    let code = ProductCode::new(body.code).map_err(|e| ApiError::from_store(&rid, e.into()))?;
    let product = Product::create(ProductDraft {
        code,
        name: body.name,
        description: body.description,
        brand: body.brand,
        category_id: body.category_id,
        supplier_id: body.supplier_id,
        purchase_price: body.purchase_price,
        sale_price: body.sale_price,
        min_stock: body.min_stock,
        max_stock: body.max_stock,
        image_url: body.image_url,
    })
    .map_err(|e| ApiError::from_store(&rid, e.into()))?;

    state.store.create_product(&product).await.map_err(fail(&rid))?;
    state.cache.invalidate();
    state
        .publisher
        .publish(&DomainEvent::Product(ProductEvent::Created { product_id: product.id, code: product.code.clone() }))
        .await;
    tracing::info!(product_id = %product.id, code = %product.code, by = %actor.id(), "product created");
    Ok((StatusCode::CREATED, ApiResponse::new(&rid, product)))
}

pub(in crate::api) async fn update_product(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
    ApiJson(update): ApiJson<ProductUpdate>,
) -> Result<Json<ApiResponse<Product>>, ApiError> {
    actor.require(Permission::ManageCatalog).map_err(fail(&rid))?;
    let mut product = load(&state, &rid, id).await?;
    let was_active = product.active;
    product.apply(update).map_err(|e| ApiError::from_store(&rid, e.into()))?;
    save(&state, &rid, &product, was_active).await?;
    Ok(ApiResponse::new(&rid, product))
}

/// DELETE /api/products/:id: products are never removed, only taken off sale.
pub(in crate::api) async fn deactivate_product(
    State(state): State<AppState>,
    Extension(rid): Extension<RequestId>,
    actor: Actor,
    ApiPath(id): ApiPath<Uuid>,
) -> Result<Json<ApiResponse<Product>>, ApiError> {
    actor.require(Permission::ManageCatalog).map_err(fail(&rid))?;
    let mut product = load(&state, &rid, id).await?;
    let was_active = product.active;
    product.deactivate();
    save(&state, &rid, &product, was_active).await?;
    Ok(ApiResponse::new(&rid, product))
}

async fn load(state: &AppState, rid: &RequestId, id: Uuid) -> Result<Product, ApiError> {
    state
        .store
        .get_product(id)
        .await
        .map_err(fail(rid))?
        .ok_or_else(|| ApiError::from_store(rid, StoreError::product_not_found(id)))
}

async fn save(state: &AppState, rid: &RequestId, product: &Product, was_active: bool) -> Result<(), ApiError> {
    state.store.update_product(product).await.map_err(fail(rid))?;
    state.cache.invalidate();
    if was_active && !product.active {
        state.publisher.publish(&DomainEvent::Product(ProductEvent::Deactivated { product_id: product.id })).await;
        tracing::info!(product_id = %product.id, "product deactivated");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_listing_params_are_ignored() {
        let params = ListProductsParams {
            search: Some("  ".into()),
            category_id: None,
            brand: Some(" Bayer ".into()),
            min_price: None,
            max_price: None,
            page: Some(0),
            limit: Some(500),
        };
        let filter = ProductFilter::from(params);
        assert_eq!(filter.search, None);
        assert_eq!(filter.brand.as_deref(), Some("Bayer"));
        assert_eq!(filter.pagination, Pagination { page: 1, limit: 100 });
    }
}
