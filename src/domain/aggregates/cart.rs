//! Cart Aggregate
//!
//! A shopping cart whose lines each carry the stock that was available when the
//! product was added. A line's quantity never exceeds that snapshot; before
//! checkout the cart is reconciled against live stock.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::aggregates::Product;
use crate::domain::value_objects::Money;

/// Name carts are persisted under; the session id is appended.
pub const CART_STORE_NAME: &str = "logicqp-cart";

pub fn cart_storage_key(session_id: &str) -> String {
    format!("{CART_STORE_NAME}:{session_id}")
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: Uuid,
    pub code: String,
    pub name: String,
    pub price: Decimal,
    pub quantity: u32,
    pub stock_available: u32,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
}

impl CartItem {
    pub fn line_total(&self) -> Decimal { self.price * Decimal::from(self.quantity) }
}

/// A product as offered to the cart: a line without its quantity.
#[derive(Clone, Debug, PartialEq)]
pub struct CartProduct {
    pub product_id: Uuid,
    pub code: String,
    pub name: String,
    pub price: Decimal,
    pub stock_available: u32,
    pub image_url: Option<String>,
    pub category: Option<String>,
    pub brand: Option<String>,
}

impl From<&Product> for CartProduct {
    fn from(p: &Product) -> Self {
        Self {
            product_id: p.id, code: p.code.to_string(), name: p.name.clone(), price: p.sale_price,
            stock_available: p.stock, image_url: p.image_url.clone(),
            category: p.category_id.map(|c| c.to_string()), brand: p.brand.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cart {
    session_id: String,
    currency: String,
    items: Vec<CartItem>,
    updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(session_id: impl Into<String>, currency: &str) -> Self {
        Self { session_id: session_id.into(), currency: currency.to_string(), items: vec![], updated_at: Utc::now() }
    }

    pub fn session_id(&self) -> &str { &self.session_id }
    pub fn items(&self) -> &[CartItem] { &self.items }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }
    pub fn item(&self, product_id: Uuid) -> Option<&CartItem> { self.items.iter().find(|i| i.product_id == product_id) }

    /// Adds one unit of `product`, appending a line if it is not in the cart yet.
    /// Returns the line's new quantity.
    pub fn add_item(&mut self, product: CartProduct) -> Result<u32, CartError> {
        let quantity = if let Some(existing) = self.items.iter_mut().find(|i| i.product_id == product.product_id) {
            let wanted = existing.quantity + 1;
            if wanted > existing.stock_available {
                tracing::warn!(product_id = %product.product_id, requested = wanted, available = existing.stock_available, "not enough stock to add to cart");
                return Err(CartError::StockExceeded { product_id: product.product_id, requested: wanted, available: existing.stock_available });
            }
            existing.quantity = wanted;
            wanted
        } else {
            if product.stock_available == 0 {
                tracing::warn!(product_id = %product.product_id, "product out of stock, not added to cart");
                return Err(CartError::StockExceeded { product_id: product.product_id, requested: 1, available: 0 });
            }
            self.items.push(CartItem {
                product_id: product.product_id, code: product.code, name: product.name, price: product.price,
                quantity: 1, stock_available: product.stock_available, image_url: product.image_url,
                category: product.category, brand: product.brand,
            });
            1
        };
        self.touch();
        Ok(quantity)
    }

    pub fn remove_item(&mut self, product_id: Uuid) -> Result<(), CartError> {
        let before = self.items.len();
        self.items.retain(|i| i.product_id != product_id);
        if self.items.len() == before { return Err(CartError::ItemNotFound(product_id)); }
        self.touch();
        Ok(())
    }

    /// Sets a line's quantity; zero or less removes the line.
    pub fn update_quantity(&mut self, product_id: Uuid, quantity: i64) -> Result<(), CartError> {
        let item = self.items.iter_mut().find(|i| i.product_id == product_id).ok_or(CartError::ItemNotFound(product_id))?;
        if quantity > i64::from(item.stock_available) {
            tracing::warn!(product_id = %product_id, requested = quantity, available = item.stock_available, "cart quantity exceeds available stock");
            return Err(CartError::StockExceeded {
                product_id,
                requested: u32::try_from(quantity).unwrap_or(u32::MAX),
                available: item.stock_available,
            });
        }
        if quantity <= 0 {
            self.items.retain(|i| i.product_id != product_id);
        } else {
            // bounded above by stock_available, so it fits in u32
            item.quantity = quantity as u32;
        }
        self.touch();
        Ok(())
    }

    pub fn clear(&mut self) { self.items.clear(); self.touch(); }

    pub fn total(&self) -> Money {
        Money::new(self.items.iter().map(CartItem::line_total).sum(), &self.currency)
    }

    pub fn item_count(&self) -> u32 { self.items.iter().map(|i| i.quantity).sum() }

    /// Re-validates every line against `live` products keyed by id. Lines for
    /// missing, inactive or sold-out products are dropped; the rest get fresh
    /// prices and snapshots, with quantities clamped to live stock.
    pub fn reconcile(&mut self, live: &HashMap<Uuid, Product>) -> ReconcileReport {
        let mut adjustments = Vec::new();
        self.items.retain_mut(|item| {
            let Some(product) = live.get(&item.product_id) else {
                adjustments.push(CartAdjustment::Removed { product_id: item.product_id, reason: RemovalReason::NotFound });
                return false;
            };
            if !product.active {
                adjustments.push(CartAdjustment::Removed { product_id: item.product_id, reason: RemovalReason::Inactive });
                return false;
            }
            if product.stock == 0 {
                adjustments.push(CartAdjustment::Removed { product_id: item.product_id, reason: RemovalReason::OutOfStock });
                return false;
            }
            if item.quantity > product.stock {
                adjustments.push(CartAdjustment::QuantityClamped { product_id: item.product_id, from: item.quantity, to: product.stock });
                item.quantity = product.stock;
            }
            if item.price != product.sale_price {
                adjustments.push(CartAdjustment::PriceChanged { product_id: item.product_id, from: item.price, to: product.sale_price });
                item.price = product.sale_price;
            }
            item.stock_available = product.stock;
            true
        });
        if !adjustments.is_empty() {
            tracing::info!(session = %self.session_id, changes = adjustments.len(), "cart reconciled against live stock");
        }
        self.touch();
        ReconcileReport { adjustments }
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason { NotFound, Inactive, OutOfStock }

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CartAdjustment {
    Removed { product_id: Uuid, reason: RemovalReason },
    QuantityClamped { product_id: Uuid, from: u32, to: u32 },
    PriceChanged { product_id: Uuid, from: Decimal, to: Decimal },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub adjustments: Vec<CartAdjustment>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool { self.adjustments.is_empty() }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartError {
    #[error("product {0} is not in the cart")]
    ItemNotFound(Uuid),
    #[error("not enough stock for product {product_id}: requested {requested}, available {available}")]
    StockExceeded { product_id: Uuid, requested: u32, available: u32 },
}
