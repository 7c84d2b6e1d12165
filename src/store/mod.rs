//! Persistence boundary.
//!
//! Every backend implements [`Store`]. Order placement and cancellation are the
//! only multi-row writes; backends must run each as one atomic unit.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::{allocate_fefo, Cart, Lot, LotAllocation, Order, OrderStatus, Product, Profile, ProfileStatus, Role, Sale};
use crate::{Result, StoreError};

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 100;

/// 1-based page request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
}

impl Pagination {
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Self {
        Self {
            page: page.unwrap_or(1).max(1),
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
        }
    }

    pub fn offset(&self) -> u64 { u64::from(self.page - 1) * u64::from(self.limit) }
}

impl Default for Pagination {
    fn default() -> Self { Self::new(None, None) }
}

#[derive(Clone, Debug, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, pagination: Pagination, total: u64) -> Self {
        Self {
            data,
            page: pagination.page,
            limit: pagination.limit,
            total,
            total_pages: total.div_ceil(u64::from(pagination.limit)),
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page { data: self.data.into_iter().map(f).collect(), page: self.page, limit: self.limit, total: self.total, total_pages: self.total_pages }
    }
}

/// Catalog listing filter. Only active products are listed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub struct ProductFilter {
    pub search: Option<String>,
    pub category_id: Option<Uuid>,
    pub brand: Option<String>,
    pub min_price: Option<Decimal>,
    pub max_price: Option<Decimal>,
    pub pagination: Pagination,
}

impl ProductFilter {
    pub fn matches(&self, p: &Product) -> bool {
        if !p.active { return false; }
        if let Some(search) = self.search.as_deref().map(str::to_lowercase) {
            let hit = p.name.to_lowercase().contains(&search)
                || p.code.as_str().to_lowercase().contains(&search)
                || p.description.as_deref().is_some_and(|d| d.to_lowercase().contains(&search));
            if !hit { return false; }
        }
        if self.category_id.is_some() && p.category_id != self.category_id { return false; }
        if self.brand.is_some() && p.brand != self.brand { return false; }
        if self.min_price.is_some_and(|min| p.sale_price < min) { return false; }
        if self.max_price.is_some_and(|max| p.sale_price > max) { return false; }
        true
    }
}

#[derive(Clone, Debug, Default)]
pub struct OrderFilter {
    pub customer_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    pub pagination: Pagination,
}

impl OrderFilter {
    pub fn matches(&self, o: &Order) -> bool {
        self.customer_id.map_or(true, |c| o.customer_id() == c)
            && self.status.map_or(true, |s| o.status() == s)
            && self.date_from.map_or(true, |from| o.created_at() >= from)
            && self.date_to.map_or(true, |to| o.created_at() <= to)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProfileFilter {
    pub search: Option<String>,
    pub role: Option<Role>,
    pub status: Option<ProfileStatus>,
    pub pagination: Pagination,
}

impl ProfileFilter {
    pub fn matches(&self, p: &Profile) -> bool {
        if let Some(search) = self.search.as_deref().map(str::to_lowercase) {
            let hit = [&p.first_name, &p.last_name, &p.email].iter().any(|f| f.to_lowercase().contains(&search));
            if !hit { return false; }
        }
        self.role.map_or(true, |r| p.role == r) && self.status.map_or(true, |s| p.status == s)
    }
}

/// A lot as submitted for receipt; the lot number defaults to
/// `LOTE-<code>-<seq>` when absent.
#[derive(Clone, Debug)]
pub struct LotReceipt {
    pub lot_number: Option<String>,
    pub quantity: u32,
    pub purchase_price: Option<Decimal>,
    pub expires_on: NaiveDate,
}

/// Result of storing an order.
#[derive(Debug)]
pub enum Placement {
    /// The order was stored and its stock drawn.
    Created(Order),
    /// An order with the same idempotency key already existed; nothing changed.
    Replayed(Order),
}

impl Placement {
    pub fn order(&self) -> &Order {
        match self { Self::Created(o) | Self::Replayed(o) => o }
    }

    pub fn into_order(self) -> Order {
        match self { Self::Created(o) | Self::Replayed(o) => o }
    }

    pub fn is_replay(&self) -> bool { matches!(self, Self::Replayed(_)) }
}

pub(crate) fn today() -> NaiveDate { Utc::now().date_naive() }

pub(crate) fn stale_status(order_id: Uuid, expected: OrderStatus, found: OrderStatus) -> StoreError {
    StoreError::Conflict(format!("order {order_id} is {found}, expected {expected}"))
}

pub(crate) fn cancellable(order_id: Uuid, stored: OrderStatus) -> Result<()> {
    match stored {
        OrderStatus::Pending | OrderStatus::Confirmed => Ok(()),
        other => Err(StoreError::Conflict(format!("order {order_id} is {other} and cannot be cancelled"))),
    }
}

/// Draws every line of `order` from `lots`, soonest expiry first. Lines for the
/// same product draw from the ledger as left by the previous line. On error
/// `lots` may be partially drawn, so callers pass a copy they can discard.
pub(crate) fn draw_order_lines(lots: &mut [Lot], order: &Order, today: NaiveDate) -> Result<Vec<LotAllocation>> {
    let mut allocations = Vec::new();
    for line in order.items() {
        let drawn = allocate_fefo(lots, line.product_id, line.quantity, today)?;
        for allocation in &drawn {
            let lot = lots
                .iter_mut()
                .find(|l| l.id == allocation.lot_id)
                .ok_or_else(|| StoreError::Corrupt(format!("allocated lot {} vanished", allocation.lot_id)))?;
            lot.draw(allocation.quantity)?;
        }
        allocations.extend(drawn);
    }
    Ok(allocations)
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn health_check(&self) -> Result<()>;

    // Catalog. Returned products carry their derived stock.
    async fn list_products(&self, filter: &ProductFilter) -> Result<Page<Product>>;
    async fn get_product(&self, id: Uuid) -> Result<Option<Product>>;
    async fn get_products(&self, ids: &[Uuid]) -> Result<Vec<Product>>;
    async fn create_product(&self, product: &Product) -> Result<()>;
    async fn update_product(&self, product: &Product) -> Result<()>;

    // Lots
    async fn list_lots(&self, product_id: Uuid) -> Result<Vec<Lot>>;
    async fn receive_lot(&self, product_id: Uuid, receipt: LotReceipt) -> Result<Lot>;

    // Orders
    async fn find_order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>>;
    /// Stores `order` and draws every line's quantity from the product's lots,
    /// soonest expiry first, all or nothing. A `sale` for the order is stored
    /// in the same unit; a taken sale number fails with
    /// [`StoreError::SaleNumberTaken`] and leaves nothing behind.
    async fn place_order(&self, order: Order, sale: Option<&Sale>) -> Result<Placement>;
    async fn list_orders(&self, filter: &OrderFilter) -> Result<Page<Order>>;
    async fn get_order(&self, id: Uuid) -> Result<Option<Order>>;
    /// Persists a non-cancelling status change, provided the stored status is
    /// still `from`. A concurrent change fails with a conflict.
    async fn save_order_status(&self, order: &Order, from: OrderStatus) -> Result<()>;
    /// Persists a cancellation, returns the stored allocations to their lots and
    /// voids the order's sales, all or nothing. Only a stored `pendiente` or
    /// `confirmada` order can be cancelled. Returns the restored allocations.
    async fn cancel_order(&self, order: &Order) -> Result<Vec<LotAllocation>>;

    // Sales
    async fn sales_for_order(&self, order_id: Uuid) -> Result<Vec<Sale>>;

    // Profiles
    async fn list_profiles(&self, filter: &ProfileFilter) -> Result<Page<Profile>>;
    async fn get_profile(&self, id: Uuid) -> Result<Option<Profile>>;
    async fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>>;
    async fn create_profile(&self, profile: &Profile) -> Result<()>;

    // Carts, keyed by session
    async fn load_cart(&self, session_id: &str) -> Result<Option<Cart>>;
    async fn save_cart(&self, cart: &Cart) -> Result<()>;
    async fn delete_cart(&self, session_id: &str) -> Result<()>;
}
