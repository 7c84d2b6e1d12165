//! Postgres store. Order placement locks the lots of every product involved
//! (`SELECT ... FOR UPDATE`) and writes the order, its items, the lot draws and
//! the allocation ledger in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use super::{cancellable, draw_order_lines, stale_status, today, LotReceipt, OrderFilter, Page, Placement, ProductFilter, ProfileFilter, Store};
use crate::domain::aggregates::{
    cart_storage_key, default_lot_number, Cart, Lot, LotAllocation, Order, OrderLine, OrderRecord, OrderStatus, Product, Profile, Sale, SaleItem,
};
use crate::domain::value_objects::ProductCode;
use crate::{Result, StoreError};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self { Self { pool } }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn hydrate_orders(&self, rows: Vec<OrderRow>) -> Result<Vec<Order>> {
        if rows.is_empty() { return Ok(vec![]); }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

        let items = sqlx::query_as::<_, OrderItemRow>(
            "SELECT id, order_id, product_id, quantity, unit_price, subtotal FROM order_items WHERE order_id = ANY($1) ORDER BY order_id, position",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let allocations = sqlx::query_as::<_, AllocationRow>(
            "SELECT order_id, lot_id, product_id, quantity FROM order_allocations WHERE order_id = ANY($1) ORDER BY order_id, position",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut items_by_order: HashMap<Uuid, Vec<OrderLine>> = HashMap::new();
        for row in items {
            let order_id = row.order_id;
            items_by_order.entry(order_id).or_default().push(row.try_into()?);
        }
        let mut allocations_by_order: HashMap<Uuid, Vec<LotAllocation>> = HashMap::new();
        for row in allocations {
            let order_id = row.order_id;
            allocations_by_order.entry(order_id).or_default().push(row.try_into()?);
        }

        rows.into_iter()
            .map(|row| {
                let items = items_by_order.remove(&row.id).unwrap_or_default();
                let allocations = allocations_by_order.remove(&row.id).unwrap_or_default();
                row.into_order(items, allocations)
            })
            .collect()
    }

    async fn hydrate_sales(&self, rows: Vec<SaleRow>) -> Result<Vec<Sale>> {
        if rows.is_empty() { return Ok(vec![]); }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let items = sqlx::query_as::<_, SaleItemRow>(
            "SELECT sale_id, product_id, product_name, quantity, unit_price, subtotal FROM sale_items WHERE sale_id = ANY($1) ORDER BY sale_id, position",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_sale: HashMap<Uuid, Vec<SaleItem>> = HashMap::new();
        for row in items {
            by_sale.entry(row.sale_id).or_default().push(SaleItem {
                product_id: row.product_id,
                product_name: row.product_name,
                quantity: to_u32(row.quantity.into(), "sale_items.quantity")?,
                unit_price: row.unit_price,
                subtotal: row.subtotal,
            });
        }
        rows.into_iter()
            .map(|row| {
                let items = by_sale.remove(&row.id).unwrap_or_default();
                row.into_sale(items)
            })
            .collect()
    }
}

// =============================================================================
// Row types
// =============================================================================

/// Product columns plus the stock derived from sellable lots as of `$1`.
const PRODUCT_SELECT: &str = "SELECT p.id, p.code, p.name, p.description, p.brand, p.category_id, p.supplier_id, \
     p.purchase_price, p.sale_price, p.min_stock, p.max_stock, p.image_url, p.active, p.created_at, p.updated_at, \
     COALESCE((SELECT SUM(l.available) FROM lots l \
               WHERE l.product_id = p.id AND l.active AND l.available > 0 AND l.expires_on >= $1), 0)::BIGINT AS stock \
     FROM products p";

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: Uuid,
    code: String,
    name: String,
    description: Option<String>,
    brand: Option<String>,
    category_id: Option<Uuid>,
    supplier_id: Option<Uuid>,
    purchase_price: Option<Decimal>,
    sale_price: Decimal,
    min_stock: i32,
    max_stock: Option<i32>,
    image_url: Option<String>,
    active: bool,
    stock: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProductRow> for Product {
    type Error = StoreError;

    fn try_from(row: ProductRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            code: ProductCode::new(row.code).map_err(|e| StoreError::Corrupt(e.to_string()))?,
            name: row.name,
            description: row.description,
            brand: row.brand,
            category_id: row.category_id,
            supplier_id: row.supplier_id,
            purchase_price: row.purchase_price,
            sale_price: row.sale_price,
            min_stock: to_u32(row.min_stock.into(), "products.min_stock")?,
            max_stock: row.max_stock.map(|m| to_u32(m.into(), "products.max_stock")).transpose()?,
            image_url: row.image_url,
            active: row.active,
            stock: to_u32(row.stock, "products.stock")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const LOT_COLUMNS: &str = "id, product_id, lot_number, initial_quantity, available, purchase_price, expires_on, active, created_at";

#[derive(sqlx::FromRow)]
struct LotRow {
    id: Uuid,
    product_id: Uuid,
    lot_number: String,
    initial_quantity: i32,
    available: i32,
    purchase_price: Option<Decimal>,
    expires_on: NaiveDate,
    active: bool,
    created_at: DateTime<Utc>,
}

impl TryFrom<LotRow> for Lot {
    type Error = StoreError;

    fn try_from(row: LotRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            product_id: row.product_id,
            lot_number: row.lot_number,
            initial_quantity: to_u32(row.initial_quantity.into(), "lots.initial_quantity")?,
            available: to_u32(row.available.into(), "lots.available")?,
            purchase_price: row.purchase_price,
            expires_on: row.expires_on,
            active: row.active,
            created_at: row.created_at,
        })
    }
}

const ORDER_COLUMNS: &str = "id, customer_id, status, payment_method, delivery_address, notes, subtotal, discount, total, currency, \
     idempotency_key, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    customer_id: Uuid,
    status: String,
    payment_method: Option<String>,
    delivery_address: Option<String>,
    notes: Option<String>,
    subtotal: Decimal,
    discount: Decimal,
    total: Decimal,
    currency: String,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrderRow {
    fn into_order(self, items: Vec<OrderLine>, allocations: Vec<LotAllocation>) -> Result<Order> {
        let status: OrderStatus = self.status.parse().map_err(|e: crate::domain::aggregates::OrderError| StoreError::Corrupt(e.to_string()))?;
        Ok(Order::from(OrderRecord {
            id: self.id,
            customer_id: self.customer_id,
            status,
            payment_method: self.payment_method,
            delivery_address: self.delivery_address,
            notes: self.notes,
            items,
            subtotal: self.subtotal,
            discount: self.discount,
            total: self.total,
            currency: self.currency,
            idempotency_key: self.idempotency_key,
            allocations,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }))
    }
}

#[derive(sqlx::FromRow)]
struct OrderItemRow {
    id: Uuid,
    order_id: Uuid,
    product_id: Uuid,
    quantity: i32,
    unit_price: Decimal,
    subtotal: Decimal,
}

impl TryFrom<OrderItemRow> for OrderLine {
    type Error = StoreError;

    fn try_from(row: OrderItemRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            product_id: row.product_id,
            quantity: to_u32(row.quantity.into(), "order_items.quantity")?,
            unit_price: row.unit_price,
            subtotal: row.subtotal,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AllocationRow {
    order_id: Uuid,
    lot_id: Uuid,
    product_id: Uuid,
    quantity: i32,
}

impl TryFrom<AllocationRow> for LotAllocation {
    type Error = StoreError;

    fn try_from(row: AllocationRow) -> Result<Self> {
        Ok(Self { lot_id: row.lot_id, product_id: row.product_id, quantity: to_u32(row.quantity.into(), "order_allocations.quantity")? })
    }
}

const SALE_COLUMNS: &str = "id, number, order_id, customer_name, customer_phone, customer_email, seller_id, seller_name, \
     subtotal, taxes, discount, total, currency, payment_method, status, created_at";

#[derive(sqlx::FromRow)]
struct SaleRow {
    id: Uuid,
    number: String,
    order_id: Option<Uuid>,
    customer_name: String,
    customer_phone: String,
    customer_email: Option<String>,
    seller_id: Option<Uuid>,
    seller_name: String,
    subtotal: Decimal,
    taxes: Decimal,
    discount: Decimal,
    total: Decimal,
    currency: String,
    payment_method: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl SaleRow {
    fn into_sale(self, items: Vec<SaleItem>) -> Result<Sale> {
        Ok(Sale {
            id: self.id,
            number: self.number,
            order_id: self.order_id,
            customer_name: self.customer_name,
            customer_phone: self.customer_phone,
            customer_email: self.customer_email,
            seller_id: self.seller_id,
            seller_name: self.seller_name,
            subtotal: self.subtotal,
            taxes: self.taxes,
            discount: self.discount,
            total: self.total,
            currency: self.currency,
            payment_method: self.payment_method,
            status: self.status.parse().map_err(|e: crate::domain::aggregates::SaleError| StoreError::Corrupt(e.to_string()))?,
            items,
            created_at: self.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SaleItemRow {
    sale_id: Uuid,
    product_id: Uuid,
    product_name: String,
    quantity: i32,
    unit_price: Decimal,
    subtotal: Decimal,
}

const PROFILE_COLUMNS: &str =
    "id, email, first_name, last_name, phone, address, company, role, status, email_verified, created_at, updated_at";

#[derive(sqlx::FromRow)]
struct ProfileRow {
    id: Uuid,
    email: String,
    first_name: String,
    last_name: String,
    phone: Option<String>,
    address: Option<String>,
    company: Option<String>,
    role: String,
    status: String,
    email_verified: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProfileRow> for Profile {
    type Error = StoreError;

    fn try_from(row: ProfileRow) -> Result<Self> {
        let corrupt = |e: crate::domain::aggregates::ProfileError| StoreError::Corrupt(e.to_string());
        Ok(Self {
            id: row.id,
            email: row.email,
            first_name: row.first_name,
            last_name: row.last_name,
            phone: row.phone,
            address: row.address,
            company: row.company,
            role: row.role.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            email_verified: row.email_verified,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn to_u32(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} holds out-of-range value {value}")))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Validation(format!("quantity {value} is too large")))
}

fn to_i64(value: u64) -> i64 { i64::try_from(value).unwrap_or(i64::MAX) }

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn like_pattern(search: Option<&str>) -> Option<String> {
    search.map(str::trim).filter(|s| !s.is_empty()).map(|s| {
        let escaped = s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        format!("%{escaped}%")
    })
}

async fn insert_order_rows(tx: &mut Transaction<'_, Postgres>, order: &Order) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO orders (id, customer_id, status, payment_method, delivery_address, notes, subtotal, discount, total, currency, \
         idempotency_key, created_at, updated_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
    )
    .bind(order.id())
    .bind(order.customer_id())
    .bind(order.status().as_str())
    .bind(order.payment_method())
    .bind(order.delivery_address())
    .bind(order.notes())
    .bind(order.subtotal().amount())
    .bind(order.discount().amount())
    .bind(order.total().amount())
    .bind(order.total().currency())
    .bind(order.idempotency_key())
    .bind(order.created_at())
    .bind(order.updated_at())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_sale_rows(tx: &mut Transaction<'_, Postgres>, sale: &Sale) -> Result<()> {
    let inserted = sqlx::query(&format!(
        "INSERT INTO sales ({SALE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
    ))
    .bind(sale.id)
    .bind(&sale.number)
    .bind(sale.order_id)
    .bind(&sale.customer_name)
    .bind(&sale.customer_phone)
    .bind(&sale.customer_email)
    .bind(sale.seller_id)
    .bind(&sale.seller_name)
    .bind(sale.subtotal)
    .bind(sale.taxes)
    .bind(sale.discount)
    .bind(sale.total)
    .bind(&sale.currency)
    .bind(&sale.payment_method)
    .bind(sale.status.as_str())
    .bind(sale.created_at)
    .execute(&mut **tx)
    .await;
    match inserted {
        Ok(_) => {}
        Err(e) if is_unique_violation(&e) => return Err(StoreError::SaleNumberTaken(sale.number.clone())),
        Err(e) => return Err(e.into()),
    }

    for (position, item) in sale.items.iter().enumerate() {
        sqlx::query(
            "INSERT INTO sale_items (sale_id, position, product_id, product_name, quantity, unit_price, subtotal) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(sale.id)
        .bind(to_i32(u32::try_from(position).unwrap_or(u32::MAX))?)
        .bind(item.product_id)
        .bind(&item.product_name)
        .bind(to_i32(item.quantity)?)
        .bind(item.unit_price)
        .bind(item.subtotal)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn list_products(&self, filter: &ProductFilter) -> Result<Page<Product>> {
        const WHERE: &str = "WHERE p.active \
             AND ($2::TEXT IS NULL OR p.name ILIKE $2 OR p.code ILIKE $2 OR p.description ILIKE $2) \
             AND ($3::UUID IS NULL OR p.category_id = $3) \
             AND ($4::TEXT IS NULL OR p.brand = $4) \
             AND ($5::NUMERIC IS NULL OR p.sale_price >= $5) \
             AND ($6::NUMERIC IS NULL OR p.sale_price <= $6)";
        let search = like_pattern(filter.search.as_deref());
        let today = today();

        let rows = sqlx::query_as::<_, ProductRow>(&format!("{PRODUCT_SELECT} {WHERE} ORDER BY p.name LIMIT $7 OFFSET $8"))
            .bind(today)
            .bind(&search)
            .bind(filter.category_id)
            .bind(&filter.brand)
            .bind(filter.min_price)
            .bind(filter.max_price)
            .bind(i64::from(filter.pagination.limit))
            .bind(to_i64(filter.pagination.offset()))
            .fetch_all(&self.pool)
            .await?;
        // $1 is unused by the count but keeps the placeholder numbering shared
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM products p {WHERE} AND $1::DATE IS NOT NULL"))
            .bind(today)
            .bind(&search)
            .bind(filter.category_id)
            .bind(&filter.brand)
            .bind(filter.min_price)
            .bind(filter.max_price)
            .fetch_one(&self.pool)
            .await?;

        let products = rows.into_iter().map(Product::try_from).collect::<Result<Vec<_>>>()?;
        Ok(Page::new(products, filter.pagination, u64::try_from(total).unwrap_or_default()))
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>> {
        sqlx::query_as::<_, ProductRow>(&format!("{PRODUCT_SELECT} WHERE p.id = $2"))
            .bind(today())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Product::try_from)
            .transpose()
    }

    async fn get_products(&self, ids: &[Uuid]) -> Result<Vec<Product>> {
        sqlx::query_as::<_, ProductRow>(&format!("{PRODUCT_SELECT} WHERE p.id = ANY($2)"))
            .bind(today())
            .bind(ids)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Product::try_from)
            .collect()
    }

    async fn create_product(&self, product: &Product) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO products (id, code, name, description, brand, category_id, supplier_id, purchase_price, sale_price, \
             min_stock, max_stock, image_url, active, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(product.id)
        .bind(product.code.as_str())
        .bind(&product.name)
        .bind(&product.description)
        .bind(&product.brand)
        .bind(product.category_id)
        .bind(product.supplier_id)
        .bind(product.purchase_price)
        .bind(product.sale_price)
        .bind(to_i32(product.min_stock)?)
        .bind(product.max_stock.map(to_i32).transpose()?)
        .bind(&product.image_url)
        .bind(product.active)
        .bind(product.created_at)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!("product code {} already exists", product.code))),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_product(&self, product: &Product) -> Result<()> {
        let result = sqlx::query(
            "UPDATE products SET name = $2, description = $3, brand = $4, category_id = $5, supplier_id = $6, purchase_price = $7, \
             sale_price = $8, min_stock = $9, max_stock = $10, image_url = $11, active = $12, updated_at = $13 WHERE id = $1",
        )
        .bind(product.id)
        .bind(&product.name)
        .bind(&product.description)
        .bind(&product.brand)
        .bind(product.category_id)
        .bind(product.supplier_id)
        .bind(product.purchase_price)
        .bind(product.sale_price)
        .bind(to_i32(product.min_stock)?)
        .bind(product.max_stock.map(to_i32).transpose()?)
        .bind(&product.image_url)
        .bind(product.active)
        .bind(product.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::product_not_found(product.id));
        }
        Ok(())
    }

    async fn list_lots(&self, product_id: Uuid) -> Result<Vec<Lot>> {
        sqlx::query_as::<_, LotRow>(&format!("SELECT {LOT_COLUMNS} FROM lots WHERE product_id = $1 ORDER BY expires_on, created_at"))
            .bind(product_id)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Lot::try_from)
            .collect()
    }

    async fn receive_lot(&self, product_id: Uuid, receipt: LotReceipt) -> Result<Lot> {
        let mut tx = self.pool.begin().await?;

        // the product row lock serialises lot numbering per product
        let code: Option<String> = sqlx::query_scalar("SELECT code FROM products WHERE id = $1 FOR UPDATE")
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await?;
        let code = code.ok_or_else(|| StoreError::product_not_found(product_id))?;
        let code = ProductCode::new(code).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lots WHERE product_id = $1")
            .bind(product_id)
            .fetch_one(&mut *tx)
            .await?;
        let seq = usize::try_from(existing).unwrap_or_default() + 1;

        let lot_number = receipt.lot_number.unwrap_or_else(|| default_lot_number(&code, seq));
        let lot = Lot::receive(product_id, lot_number, receipt.quantity, receipt.purchase_price, receipt.expires_on, today())?;

        let inserted = sqlx::query(&format!("INSERT INTO lots ({LOT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"))
            .bind(lot.id)
            .bind(lot.product_id)
            .bind(&lot.lot_number)
            .bind(to_i32(lot.initial_quantity)?)
            .bind(to_i32(lot.available)?)
            .bind(lot.purchase_price)
            .bind(lot.expires_on)
            .bind(lot.active)
            .bind(lot.created_at)
            .execute(&mut *tx)
            .await;
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict(format!("lot {} already exists for product {product_id}", lot.lot_number)));
            }
            Err(e) => return Err(e.into()),
        }

        tx.commit().await?;
        Ok(lot)
    }

    async fn find_order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE idempotency_key = $1"))
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(self.hydrate_orders(rows).await?.into_iter().next())
    }

    async fn place_order(&self, mut order: Order, sale: Option<&Sale>) -> Result<Placement> {
        if let Some(key) = order.idempotency_key() {
            if let Some(existing) = self.find_order_by_idempotency_key(key).await? {
                return Ok(Placement::Replayed(existing));
            }
        }

        let mut tx = self.pool.begin().await?;

        let mut product_ids: Vec<Uuid> = order.items().iter().map(|l| l.product_id).collect();
        product_ids.sort_unstable();
        product_ids.dedup();

        let active: Vec<(Uuid, bool)> = sqlx::query_as("SELECT id, active FROM products WHERE id = ANY($1)")
            .bind(&product_ids)
            .fetch_all(&mut *tx)
            .await?;
        let active: HashMap<Uuid, bool> = active.into_iter().collect();
        for id in &product_ids {
            match active.get(id) {
                None => return Err(StoreError::product_not_found(*id)),
                Some(false) => return Err(StoreError::Conflict(format!("product {id} is no longer sold"))),
                Some(true) => {}
            }
        }

        // lock in a stable order so concurrent checkouts cannot deadlock
        let mut lots = sqlx::query_as::<_, LotRow>(&format!(
            "SELECT {LOT_COLUMNS} FROM lots WHERE product_id = ANY($1) ORDER BY product_id, id FOR UPDATE"
        ))
        .bind(&product_ids)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(Lot::try_from)
        .collect::<Result<Vec<_>>>()?;

        let allocations = draw_order_lines(&mut lots, &order, today())?;

        if let Err(e) = insert_order_rows(&mut tx, &order).await {
            if is_unique_violation(&e) {
                // a concurrent request with the same key committed first
                drop(tx);
                if let Some(key) = order.idempotency_key() {
                    if let Some(existing) = self.find_order_by_idempotency_key(key).await? {
                        return Ok(Placement::Replayed(existing));
                    }
                }
            }
            return Err(e.into());
        }

        for (position, line) in order.items().iter().enumerate() {
            sqlx::query(
                "INSERT INTO order_items (id, order_id, position, product_id, quantity, unit_price, subtotal) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(line.id)
            .bind(order.id())
            .bind(to_i32(u32::try_from(position).unwrap_or(u32::MAX))?)
            .bind(line.product_id)
            .bind(to_i32(line.quantity)?)
            .bind(line.unit_price)
            .bind(line.subtotal)
            .execute(&mut *tx)
            .await?;
        }

        for (position, allocation) in allocations.iter().enumerate() {
            let drawn = sqlx::query("UPDATE lots SET available = available - $2 WHERE id = $1 AND available >= $2")
                .bind(allocation.lot_id)
                .bind(to_i32(allocation.quantity)?)
                .execute(&mut *tx)
                .await?;
            if drawn.rows_affected() != 1 {
                return Err(StoreError::Corrupt(format!("lot {} changed while locked", allocation.lot_id)));
            }
            sqlx::query("INSERT INTO order_allocations (order_id, position, lot_id, product_id, quantity) VALUES ($1, $2, $3, $4, $5)")
                .bind(order.id())
                .bind(to_i32(u32::try_from(position).unwrap_or(u32::MAX))?)
                .bind(allocation.lot_id)
                .bind(allocation.product_id)
                .bind(to_i32(allocation.quantity)?)
                .execute(&mut *tx)
                .await?;
        }

        if let Some(sale) = sale {
            insert_sale_rows(&mut tx, sale).await?;
        }

        tx.commit().await?;
        order.record_allocations(allocations);
        Ok(Placement::Created(order))
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Page<Order>> {
        const WHERE: &str = "WHERE ($1::UUID IS NULL OR customer_id = $1) \
             AND ($2::TEXT IS NULL OR status = $2) \
             AND ($3::TIMESTAMPTZ IS NULL OR created_at >= $3) \
             AND ($4::TIMESTAMPTZ IS NULL OR created_at <= $4)";
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query_as::<_, OrderRow>(&format!("SELECT {ORDER_COLUMNS} FROM orders {WHERE} ORDER BY created_at DESC LIMIT $5 OFFSET $6"))
            .bind(filter.customer_id)
            .bind(status)
            .bind(filter.date_from)
            .bind(filter.date_to)
            .bind(i64::from(filter.pagination.limit))
            .bind(to_i64(filter.pagination.offset()))
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM orders {WHERE}"))
            .bind(filter.customer_id)
            .bind(status)
            .bind(filter.date_from)
            .bind(filter.date_to)
            .fetch_one(&self.pool)
            .await?;

        let orders = self.hydrate_orders(rows).await?;
        Ok(Page::new(orders, filter.pagination, u64::try_from(total).unwrap_or_default()))
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        let rows = sqlx::query_as::<_, OrderRow>(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"))
            .bind(id)
            .fetch_all(&self.pool)
            .await?;
        Ok(self.hydrate_orders(rows).await?.into_iter().next())
    }

    async fn save_order_status(&self, order: &Order, from: OrderStatus) -> Result<()> {
        let result = sqlx::query("UPDATE orders SET status = $2, updated_at = $3 WHERE id = $1 AND status = $4")
            .bind(order.id())
            .bind(order.status().as_str())
            .bind(order.updated_at())
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        let current: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1")
            .bind(order.id())
            .fetch_optional(&self.pool)
            .await?;
        match current {
            None => Err(StoreError::order_not_found(order.id())),
            Some(found) => Err(stale_status(order.id(), from, found.parse()?)),
        }
    }

    async fn cancel_order(&self, order: &Order) -> Result<Vec<LotAllocation>> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> = sqlx::query_scalar("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order.id())
            .fetch_optional(&mut *tx)
            .await?;
        let current: OrderStatus = current.ok_or_else(|| StoreError::order_not_found(order.id()))?.parse()?;
        cancellable(order.id(), current)?;

        let allocations = sqlx::query_as::<_, AllocationRow>(
            "SELECT order_id, lot_id, product_id, quantity FROM order_allocations WHERE order_id = $1 ORDER BY position",
        )
        .bind(order.id())
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(LotAllocation::try_from)
        .collect::<Result<Vec<_>>>()?;

        for allocation in &allocations {
            sqlx::query("UPDATE lots SET available = LEAST(available + $2, initial_quantity) WHERE id = $1")
                .bind(allocation.lot_id)
                .bind(to_i32(allocation.quantity)?)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("UPDATE sales SET status = 'voided' WHERE order_id = $1")
            .bind(order.id())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE orders SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(order.id())
            .bind(order.status().as_str())
            .bind(order.updated_at())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(allocations)
    }

    async fn sales_for_order(&self, order_id: Uuid) -> Result<Vec<Sale>> {
        let rows = sqlx::query_as::<_, SaleRow>(&format!("SELECT {SALE_COLUMNS} FROM sales WHERE order_id = $1 ORDER BY created_at"))
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;
        self.hydrate_sales(rows).await
    }

    async fn list_profiles(&self, filter: &ProfileFilter) -> Result<Page<Profile>> {
        const WHERE: &str = "WHERE ($1::TEXT IS NULL OR first_name ILIKE $1 OR last_name ILIKE $1 OR email ILIKE $1) \
             AND ($2::TEXT IS NULL OR role = $2) \
             AND ($3::TEXT IS NULL OR status = $3)";
        let search = like_pattern(filter.search.as_deref());
        let role = filter.role.map(|r| r.as_str());
        let status = filter.status.map(|s| s.as_str());

        let rows = sqlx::query_as::<_, ProfileRow>(&format!("SELECT {PROFILE_COLUMNS} FROM profiles {WHERE} ORDER BY created_at DESC LIMIT $4 OFFSET $5"))
            .bind(&search)
            .bind(role)
            .bind(status)
            .bind(i64::from(filter.pagination.limit))
            .bind(to_i64(filter.pagination.offset()))
            .fetch_all(&self.pool)
            .await?;
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM profiles {WHERE}"))
            .bind(&search)
            .bind(role)
            .bind(status)
            .fetch_one(&self.pool)
            .await?;

        let profiles = rows.into_iter().map(Profile::try_from).collect::<Result<Vec<_>>>()?;
        Ok(Page::new(profiles, filter.pagination, u64::try_from(total).unwrap_or_default()))
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<Profile>> {
        sqlx::query_as::<_, ProfileRow>(&format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Profile::try_from)
            .transpose()
    }

    async fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        sqlx::query_as::<_, ProfileRow>(&format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE email = $1"))
            .bind(email.trim().to_lowercase())
            .fetch_optional(&self.pool)
            .await?
            .map(Profile::try_from)
            .transpose()
    }

    async fn create_profile(&self, profile: &Profile) -> Result<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO profiles ({PROFILE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(profile.id)
        .bind(&profile.email)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.phone)
        .bind(&profile.address)
        .bind(&profile.company)
        .bind(profile.role.as_str())
        .bind(profile.status.as_str())
        .bind(profile.email_verified)
        .bind(profile.created_at)
        .bind(profile.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!("a profile with email {} already exists", profile.email))),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_cart(&self, session_id: &str) -> Result<Option<Cart>> {
        let payload: Option<Json<Cart>> = sqlx::query_scalar("SELECT payload FROM carts WHERE storage_key = $1")
            .bind(cart_storage_key(session_id))
            .fetch_optional(&self.pool)
            .await?;
        Ok(payload.map(|Json(cart)| cart))
    }

    async fn save_cart(&self, cart: &Cart) -> Result<()> {
        sqlx::query(
            "INSERT INTO carts (storage_key, payload, updated_at) VALUES ($1, $2, $3) \
             ON CONFLICT (storage_key) DO UPDATE SET payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at",
        )
        .bind(cart_storage_key(cart.session_id()))
        .bind(Json(cart))
        .bind(cart.updated_at())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_cart(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM carts WHERE storage_key = $1")
            .bind(cart_storage_key(session_id))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
