//! Integration tests for `PgStore` using `#[sqlx::test]`.
//!
//! Each test gets a fresh database migrated from `./migrations`. They need a
//! Postgres server in `DATABASE_URL` and run with `cargo test -- --ignored`.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use qualipharm_store::domain::aggregates::{
    Cart, CartProduct, DraftLine, Order, OrderDraft, OrderStatus, Product, ProductDraft, Sale, SaleDraft, SaleItem, SaleStatus,
};
use qualipharm_store::domain::value_objects::{ProductCode, TaxRate};
use qualipharm_store::store::{LotReceipt, OrderFilter, PgStore, Store};
use qualipharm_store::StoreError;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Creates a product at 2.50 with one lot per `(quantity, days to expiry)`.
async fn stocked(store: &PgStore, code: &str, lots: &[(u32, i64)]) -> Uuid {
    let product = Product::create(ProductDraft {
        code: ProductCode::new(code).expect("product code"),
        name: format!("Product {code}"),
        description: None,
        brand: None,
        category_id: None,
        supplier_id: None,
        purchase_price: None,
        sale_price: Decimal::new(250, 2),
        min_stock: 0,
        max_stock: None,
        image_url: None,
    })
    .expect("product");
    store.create_product(&product).await.expect("create_product failed");
    for &(quantity, days) in lots {
        let receipt = LotReceipt { lot_number: None, quantity, purchase_price: None, expires_on: Utc::now().date_naive() + Duration::days(days) };
        store.receive_lot(product.id, receipt).await.expect("receive_lot failed");
    }
    product.id
}

/// Receiving refuses expired lots, so write one straight to the table.
async fn insert_expired_lot(pool: &PgPool, product_id: Uuid, quantity: i32) {
    sqlx::query(
        "INSERT INTO lots (id, product_id, lot_number, initial_quantity, available, expires_on) \
         VALUES ($1, $2, $3, $4, $4, $5)",
    )
    .bind(Uuid::now_v7())
    .bind(product_id)
    .bind(format!("LOTE-EXP-{quantity}"))
    .bind(quantity)
    .bind(Utc::now().date_naive() - Duration::days(1))
    .execute(pool)
    .await
    .unwrap_or_else(|e| panic!("insert_expired_lot failed for product {product_id}: {e}"));
}

async fn stock_of(store: &PgStore, id: Uuid) -> u32 {
    store.get_product(id).await.expect("get_product failed").expect("product exists").stock
}

fn order_for(lines: &[(Uuid, u32)], key: Option<&str>) -> Order {
    Order::place(
        OrderDraft {
            customer_id: Uuid::now_v7(),
            lines: lines.iter().map(|&(product_id, quantity)| DraftLine { product_id, quantity, unit_price: Decimal::new(250, 2) }).collect(),
            idempotency_key: key.map(str::to_string),
            ..Default::default()
        },
        "USD",
    )
    .expect("order")
}

fn sale_for(order: &Order, product_id: Uuid) -> Sale {
    let quantity = order.items().iter().map(|l| l.quantity).sum::<u32>();
    Sale::record(
        SaleDraft {
            order_id: Some(order.id()),
            customer_name: Some("Ana Torres".into()),
            payment_method: "cash".into(),
            items: vec![SaleItem {
                product_id,
                product_name: "Product".into(),
                quantity,
                unit_price: Decimal::new(250, 2),
                subtotal: Decimal::new(250, 2) * Decimal::from(quantity),
            }],
            ..Default::default()
        },
        TaxRate::default(),
        "USD",
    )
    .expect("sale")
}

// ---------------------------------------------------------------------------
// Placement
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs a Postgres server in DATABASE_URL"]
async fn place_order_draws_earliest_expiry_first(pool: PgPool) {
    let store = PgStore::new(pool);
    let id = stocked(&store, "IBU", &[(10, 300), (4, 30)]).await;

    let placed = store.place_order(order_for(&[(id, 6)], None), None).await.expect("place_order failed");
    assert!(!placed.is_replay());
    let allocations = placed.order().allocations();
    assert_eq!(allocations.iter().map(|a| a.quantity).collect::<Vec<_>>(), [4, 2]);
    assert_eq!(stock_of(&store, id).await, 8);

    let lots = store.list_lots(id).await.expect("list_lots failed");
    let near = lots.iter().find(|l| l.id == allocations[0].lot_id).expect("near lot");
    assert_eq!(near.available, 0);

    let saved = store.get_order(placed.order().id()).await.expect("get_order failed").expect("order stored");
    assert_eq!(saved.status(), OrderStatus::Pending);
    assert_eq!(saved.allocations().len(), 2);
    assert_eq!(saved.total().amount(), Decimal::new(1500, 2));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs a Postgres server in DATABASE_URL"]
async fn repeated_key_replays_the_first_order(pool: PgPool) {
    let store = PgStore::new(pool);
    let id = stocked(&store, "AMOX", &[(10, 60)]).await;

    let first = store.place_order(order_for(&[(id, 3)], Some("pay-1")), None).await.expect("first placement");
    let again = store.place_order(order_for(&[(id, 3)], Some("pay-1")), None).await.expect("replayed placement");
    assert!(again.is_replay());
    assert_eq!(again.order().id(), first.order().id());
    assert_eq!(stock_of(&store, id).await, 7);

    let found = store.find_order_by_idempotency_key("pay-1").await.expect("lookup failed").expect("order by key");
    assert_eq!(found.id(), first.order().id());
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs a Postgres server in DATABASE_URL"]
async fn insufficient_stock_rolls_back_every_line(pool: PgPool) {
    let store = PgStore::new(pool);
    let plenty = stocked(&store, "A", &[(5, 30)]).await;
    let scarce = stocked(&store, "B", &[(1, 30)]).await;

    let err = store.place_order(order_for(&[(plenty, 3), (scarce, 2)], None), None).await.unwrap_err();
    assert!(matches!(err, StoreError::InsufficientStock { product_id, requested: 2, available: 1 } if product_id == scarce));
    assert_eq!(stock_of(&store, plenty).await, 5);
    assert_eq!(stock_of(&store, scarce).await, 1);
    assert_eq!(store.list_orders(&OrderFilter::default()).await.expect("list_orders failed").total, 0);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs a Postgres server in DATABASE_URL"]
async fn expired_lots_are_not_drawn(pool: PgPool) {
    let store = PgStore::new(pool.clone());
    let id = stocked(&store, "JER", &[(2, 30)]).await;
    insert_expired_lot(&pool, id, 5).await;

    let err = store.place_order(order_for(&[(id, 3)], None), None).await.unwrap_err();
    assert!(matches!(err, StoreError::InsufficientStock { available: 2, .. }));
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs a Postgres server in DATABASE_URL"]
async fn sale_is_stored_with_its_order(pool: PgPool) {
    let store = PgStore::new(pool);
    let id = stocked(&store, "LORA", &[(10, 30)]).await;
    let order = order_for(&[(id, 2)], Some("pay-1"));
    let sale = sale_for(&order, id);

    let placed = store.place_order(order, Some(&sale)).await.expect("place_order failed");
    let sales = store.sales_for_order(placed.order().id()).await.expect("sales_for_order failed");
    assert_eq!(sales.len(), 1);
    assert_eq!(sales[0].number, sale.number);
    assert_eq!(sales[0].total, sale.total);
    assert_eq!(sales[0].items.len(), 1);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs a Postgres server in DATABASE_URL"]
async fn taken_sale_number_rolls_back_the_order(pool: PgPool) {
    let store = PgStore::new(pool);
    let id = stocked(&store, "CETI", &[(10, 30)]).await;
    let first = order_for(&[(id, 2)], None);
    let sale = sale_for(&first, id);
    store.place_order(first, Some(&sale)).await.expect("first placement");

    let second = order_for(&[(id, 3)], Some("pay-2"));
    let mut clash = sale_for(&second, id);
    clash.number = sale.number.clone();
    let err = store.place_order(second, Some(&clash)).await.unwrap_err();
    assert!(matches!(err, StoreError::SaleNumberTaken(ref n) if *n == sale.number));

    assert_eq!(stock_of(&store, id).await, 8);
    assert!(store.find_order_by_idempotency_key("pay-2").await.expect("lookup failed").is_none());
    assert_eq!(store.list_orders(&OrderFilter::default()).await.expect("list_orders failed").total, 1);
}

// ---------------------------------------------------------------------------
// Status changes
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs a Postgres server in DATABASE_URL"]
async fn cancel_restores_lots_once_and_voids_sales(pool: PgPool) {
    let store = PgStore::new(pool);
    let id = stocked(&store, "OMEP", &[(4, 30), (4, 90)]).await;
    let order = order_for(&[(id, 6)], None);
    let sale = sale_for(&order, id);
    let placed = store.place_order(order, Some(&sale)).await.expect("place_order failed").into_order();
    assert_eq!(stock_of(&store, id).await, 2);

    let mut cancelled = placed.clone();
    cancelled.cancel().expect("cancel");
    let restored = store.cancel_order(&cancelled).await.expect("cancel_order failed");
    assert_eq!(restored.iter().map(|a| a.quantity).sum::<u32>(), 6);
    assert_eq!(stock_of(&store, id).await, 8);

    let saved = store.get_order(placed.id()).await.expect("get_order failed").expect("order stored");
    assert_eq!(saved.status(), OrderStatus::Cancelled);
    assert_eq!(store.sales_for_order(placed.id()).await.expect("sales_for_order failed")[0].status, SaleStatus::Voided);

    let mut stale = placed;
    stale.cancel().expect("cancel stale copy");
    assert!(matches!(store.cancel_order(&stale).await, Err(StoreError::Conflict(_))));
    assert_eq!(stock_of(&store, id).await, 8);
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs a Postgres server in DATABASE_URL"]
async fn status_writes_require_the_stored_status(pool: PgPool) {
    let store = PgStore::new(pool);
    let id = stocked(&store, "SUERO", &[(5, 30)]).await;
    let placed = store.place_order(order_for(&[(id, 2)], None), None).await.expect("place_order failed").into_order();

    let mut confirmed = placed.clone();
    confirmed.confirm().expect("confirm");
    store.save_order_status(&confirmed, OrderStatus::Pending).await.expect("pending to confirmed");

    let mut stale = placed.clone();
    stale.confirm().expect("confirm stale copy");
    assert!(matches!(store.save_order_status(&stale, OrderStatus::Pending).await, Err(StoreError::Conflict(_))));

    let mut shipped = confirmed;
    shipped.ship().expect("ship");
    store.save_order_status(&shipped, OrderStatus::Confirmed).await.expect("confirmed to shipped");
    let saved = store.get_order(placed.id()).await.expect("get_order failed").expect("order stored");
    assert_eq!(saved.status(), OrderStatus::Shipped);
    assert_eq!(stock_of(&store, id).await, 3);

    let mut missing = order_for(&[(id, 1)], None);
    missing.confirm().expect("confirm unsaved order");
    assert!(matches!(store.save_order_status(&missing, OrderStatus::Pending).await, Err(StoreError::NotFound(_))));
}

// ---------------------------------------------------------------------------
// Carts
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "./migrations")]
#[ignore = "needs a Postgres server in DATABASE_URL"]
async fn carts_round_trip_through_jsonb(pool: PgPool) {
    let store = PgStore::new(pool);
    let product_id = Uuid::now_v7();
    let mut cart = Cart::new("session-1", "USD");
    let offer = CartProduct {
        product_id,
        code: "VITC".into(),
        name: "Vitamina C".into(),
        price: Decimal::new(999, 2),
        stock_available: 3,
        image_url: None,
        category: None,
        brand: None,
    };
    cart.add_item(offer.clone()).expect("first unit");
    cart.add_item(offer).expect("second unit");
    store.save_cart(&cart).await.expect("save_cart failed");

    let loaded = store.load_cart("session-1").await.expect("load_cart failed").expect("cart stored");
    assert_eq!(loaded.item_count(), 2);
    assert_eq!(loaded.total().amount(), Decimal::new(1998, 2));

    store.delete_cart("session-1").await.expect("delete_cart failed");
    assert!(store.load_cart("session-1").await.expect("load_cart failed").is_none());
}
