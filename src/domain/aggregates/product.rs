//! Product Aggregate and its lot ledger

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use crate::domain::value_objects::ProductCode;

/// A catalog product. `stock` is derived from the product's sellable lots and is
/// filled in by the store when the product is read.
#[derive(Clone, Debug, Serialize)]
pub struct Product {
    pub id: Uuid,
    pub code: ProductCode,
    pub name: String,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub category_id: Option<Uuid>,
    pub supplier_id: Option<Uuid>,
    pub purchase_price: Option<Decimal>,
    pub sale_price: Decimal,
    pub min_stock: u32,
    pub max_stock: Option<u32>,
    pub image_url: Option<String>,
    pub active: bool,
    pub stock: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields accepted when a product is created.
#[derive(Clone, Debug)]
pub struct ProductDraft {
    pub code: ProductCode,
    pub name: String,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub category_id: Option<Uuid>,
    pub supplier_id: Option<Uuid>,
    pub purchase_price: Option<Decimal>,
    pub sale_price: Decimal,
    pub min_stock: u32,
    pub max_stock: Option<u32>,
    pub image_url: Option<String>,
}

/// Partial update; `None` leaves the field untouched.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ProductUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub category_id: Option<Uuid>,
    pub supplier_id: Option<Uuid>,
    pub purchase_price: Option<Decimal>,
    pub sale_price: Option<Decimal>,
    pub min_stock: Option<u32>,
    pub max_stock: Option<u32>,
    pub image_url: Option<String>,
    pub active: Option<bool>,
}

impl Product {
    pub fn create(draft: ProductDraft) -> Result<Self, ProductError> {
        if draft.name.trim().is_empty() { return Err(ProductError::MissingName); }
        if !valid_price(draft.sale_price) { return Err(ProductError::InvalidPrice); }
        if let Some(max) = draft.max_stock {
            if max < draft.min_stock { return Err(ProductError::InvalidStockBounds); }
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(), code: draft.code, name: draft.name.trim().to_string(),
            description: draft.description, brand: draft.brand, category_id: draft.category_id,
            supplier_id: draft.supplier_id, purchase_price: draft.purchase_price,
            sale_price: draft.sale_price, min_stock: draft.min_stock, max_stock: draft.max_stock,
            image_url: draft.image_url, active: true, stock: 0, created_at: now, updated_at: now,
        })
    }

    /// Applies `update` all or nothing.
    pub fn apply(&mut self, update: ProductUpdate) -> Result<(), ProductError> {
        let mut next = self.clone();
        if let Some(name) = update.name {
            if name.trim().is_empty() { return Err(ProductError::MissingName); }
            next.name = name.trim().to_string();
        }
        if let Some(price) = update.sale_price {
            if !valid_price(price) { return Err(ProductError::InvalidPrice); }
            next.sale_price = price;
        }
        if update.description.is_some() { next.description = update.description; }
        if update.brand.is_some() { next.brand = update.brand; }
        if update.category_id.is_some() { next.category_id = update.category_id; }
        if update.supplier_id.is_some() { next.supplier_id = update.supplier_id; }
        if update.purchase_price.is_some() { next.purchase_price = update.purchase_price; }
        if let Some(min) = update.min_stock { next.min_stock = min; }
        if update.max_stock.is_some() { next.max_stock = update.max_stock; }
        if update.image_url.is_some() { next.image_url = update.image_url; }
        if let Some(active) = update.active { next.active = active; }
        if let Some(max) = next.max_stock {
            if max < next.min_stock { return Err(ProductError::InvalidStockBounds); }
        }
        next.touch();
        *self = next;
        Ok(())
    }

    pub fn deactivate(&mut self) { self.active = false; self.touch(); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }
}

fn valid_price(price: Decimal) -> bool { price > Decimal::ZERO && price.round_dp(2) == price }

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProductError {
    #[error("product name is required")]
    MissingName,
    #[error("sale price must be greater than zero, in whole cents")]
    InvalidPrice,
    #[error("maximum stock is below minimum stock")]
    InvalidStockBounds,
}

/// A received batch of a product.
#[derive(Clone, Debug, Serialize)]
pub struct Lot {
    pub id: Uuid,
    pub product_id: Uuid,
    pub lot_number: String,
    pub initial_quantity: u32,
    pub available: u32,
    pub purchase_price: Option<Decimal>,
    pub expires_on: NaiveDate,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Lot {
    pub fn receive(product_id: Uuid, lot_number: impl Into<String>, quantity: u32, purchase_price: Option<Decimal>, expires_on: NaiveDate, today: NaiveDate) -> Result<Self, LotError> {
        if quantity == 0 { return Err(LotError::InvalidQuantity); }
        if expires_on < today { return Err(LotError::AlreadyExpired(expires_on)); }
        let lot_number = lot_number.into();
        if lot_number.trim().is_empty() { return Err(LotError::MissingLotNumber); }
        Ok(Self {
            id: Uuid::now_v7(), product_id, lot_number: lot_number.trim().to_string(),
            initial_quantity: quantity, available: quantity, purchase_price, expires_on,
            active: true, created_at: Utc::now(),
        })
    }

    /// Expired lots stay on the ledger but are never sold.
    pub fn is_sellable(&self, today: NaiveDate) -> bool {
        self.active && self.available > 0 && self.expires_on >= today
    }

    pub fn draw(&mut self, quantity: u32) -> Result<(), LotError> {
        if quantity > self.available {
            return Err(LotError::InsufficientStock { product_id: self.product_id, requested: quantity, available: self.available });
        }
        self.available -= quantity;
        Ok(())
    }

    /// Puts drawn units back, never above what the lot was received with.
    pub fn restore(&mut self, quantity: u32) {
        self.available = self.available.saturating_add(quantity).min(self.initial_quantity);
    }
}

/// Default lot number for the `seq`-th lot of a product, e.g. `LOTE-PARA-500-003`.
pub fn default_lot_number(code: &ProductCode, seq: usize) -> String {
    format!("LOTE-{}-{:03}", code, seq)
}

/// Units drawn from one lot to satisfy an order line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LotAllocation {
    pub lot_id: Uuid,
    pub product_id: Uuid,
    pub quantity: u32,
}

/// Sum of units that can still be sold from `lots`.
pub fn sellable_stock(lots: &[Lot], today: NaiveDate) -> u32 {
    lots.iter().filter(|l| l.is_sellable(today)).map(|l| l.available).sum()
}

/// Splits `requested` units across the sellable lots, soonest expiry first.
/// Lots with equal expiry are drawn in the order they were received.
pub fn allocate_fefo(lots: &[Lot], product_id: Uuid, requested: u32, today: NaiveDate) -> Result<Vec<LotAllocation>, LotError> {
    if requested == 0 { return Err(LotError::InvalidQuantity); }
    let mut candidates: Vec<&Lot> = lots.iter().filter(|l| l.product_id == product_id && l.is_sellable(today)).collect();
    candidates.sort_by(|a, b| a.expires_on.cmp(&b.expires_on).then(a.created_at.cmp(&b.created_at)));

    let available: u32 = candidates.iter().map(|l| l.available).sum();
    if available < requested {
        return Err(LotError::InsufficientStock { product_id, requested, available });
    }

    let mut remaining = requested;
    let mut allocations = Vec::new();
    for lot in candidates {
        if remaining == 0 { break; }
        let take = remaining.min(lot.available);
        allocations.push(LotAllocation { lot_id: lot.id, product_id, quantity: take });
        remaining -= take;
    }
    Ok(allocations)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LotError {
    #[error("quantity must be at least 1")]
    InvalidQuantity,
    #[error("lot number is required")]
    MissingLotNumber,
    #[error("lot expired on {0}")]
    AlreadyExpired(NaiveDate),
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock { product_id: Uuid, requested: u32, available: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn draft(name: &str) -> ProductDraft {
        ProductDraft {
            code: ProductCode::new("PARA-500").unwrap(), name: name.into(), description: None,
            brand: Some("Genfar".into()), category_id: None, supplier_id: None, purchase_price: None,
            sale_price: Decimal::new(350, 2), min_stock: 5, max_stock: Some(200), image_url: None,
        }
    }

    fn today() -> NaiveDate { NaiveDate::from_ymd_opt(2026, 3, 1).unwrap() }

    fn lot(product_id: Uuid, qty: u32, days: i64) -> Lot {
        Lot::receive(product_id, format!("L{days}"), qty, None, today() + Duration::days(days), today()).unwrap()
    }

    #[test]
    fn test_product_create() {
        let p = Product::create(draft("Paracetamol 500mg")).unwrap();
        assert_eq!(p.name, "Paracetamol 500mg");
        assert!(p.active);
        assert_eq!(p.stock, 0);
        assert!(matches!(Product::create(draft("  ")), Err(ProductError::MissingName)));
    }

    #[test]
    fn update_rejects_inverted_stock_bounds() {
        let mut p = Product::create(draft("Ibuprofeno")).unwrap();
        let err = p.apply(ProductUpdate { max_stock: Some(1), ..Default::default() }).unwrap_err();
        assert_eq!(err, ProductError::InvalidStockBounds);
        assert_eq!(p.max_stock, Some(200));
        p.apply(ProductUpdate { sale_price: Some(Decimal::new(499, 2)), ..Default::default() }).unwrap();
        assert_eq!(p.sale_price, Decimal::new(499, 2));
        let err = p.apply(ProductUpdate { sale_price: Some(Decimal::new(4_995, 3)), ..Default::default() }).unwrap_err();
        assert_eq!(err, ProductError::InvalidPrice);
    }

    #[test]
    fn fefo_draws_soonest_expiry_first() {
        let pid = Uuid::now_v7();
        let later = lot(pid, 10, 300);
        let sooner = lot(pid, 4, 30);
        let lots = vec![later.clone(), sooner.clone()];
        let allocations = allocate_fefo(&lots, pid, 6, today()).unwrap();
        assert_eq!(allocations, vec![
            LotAllocation { lot_id: sooner.id, product_id: pid, quantity: 4 },
            LotAllocation { lot_id: later.id, product_id: pid, quantity: 2 },
        ]);
    }

    #[test]
    fn fefo_skips_expired_lots() {
        let pid = Uuid::now_v7();
        let mut expired = lot(pid, 50, 1);
        expired.expires_on = today() - Duration::days(1);
        let fresh = lot(pid, 3, 90);
        let lots = vec![expired, fresh];
        assert_eq!(sellable_stock(&lots, today()), 3);
        let err = allocate_fefo(&lots, pid, 5, today()).unwrap_err();
        assert_eq!(err, LotError::InsufficientStock { product_id: pid, requested: 5, available: 3 });
    }

    #[test]
    fn lot_draw_and_restore_stay_within_bounds() {
        let pid = Uuid::now_v7();
        let mut l = lot(pid, 5, 10);
        l.draw(3).unwrap();
        assert_eq!(l.available, 2);
        assert!(l.draw(3).is_err());
        l.restore(10);
        assert_eq!(l.available, 5);
    }

    #[test]
    fn receiving_an_expired_lot_fails() {
        let err = Lot::receive(Uuid::nil(), "L1", 5, None, today() - Duration::days(1), today()).unwrap_err();
        assert!(matches!(err, LotError::AlreadyExpired(_)));
        assert_eq!(default_lot_number(&ProductCode::new("abc").unwrap(), 2), "LOTE-ABC-002");
    }
}
