//! In-process store for local runs and tests. A single async mutex serialises
//! every operation, which makes order placement trivially atomic.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{cancellable, draw_order_lines, stale_status, today, LotReceipt, OrderFilter, Page, Pagination, Placement, ProductFilter, ProfileFilter, Store};
use crate::domain::aggregates::{
    cart_storage_key, default_lot_number, sellable_stock, Cart, Lot, LotAllocation, Order, OrderStatus, Product, Profile, Sale, SaleStatus,
};
use crate::{Result, StoreError};

#[derive(Default)]
struct State {
    products: HashMap<Uuid, Product>,
    // kept in receipt order
    lots: Vec<Lot>,
    orders: Vec<Order>,
    sales: Vec<Sale>,
    profiles: HashMap<Uuid, Profile>,
    carts: HashMap<String, Cart>,
}

impl State {
    fn with_stock(&self, product: &Product) -> Product {
        let lots: Vec<Lot> = self.lots.iter().filter(|l| l.product_id == product.id).cloned().collect();
        let mut product = product.clone();
        product.stock = sellable_stock(&lots, today());
        product
    }

    fn lot_mut(&mut self, lot_id: Uuid) -> Result<&mut Lot> {
        self.lots.iter_mut().find(|l| l.id == lot_id).ok_or_else(|| StoreError::Corrupt(format!("allocation references missing lot {lot_id}")))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
}

fn paginate<T: Clone>(items: Vec<T>, pagination: Pagination) -> Page<T> {
    let total = items.len() as u64;
    let data = items
        .into_iter()
        .skip(usize::try_from(pagination.offset()).unwrap_or(usize::MAX))
        .take(pagination.limit as usize)
        .collect();
    Page::new(data, pagination, total)
}

fn stored(order: &Order) -> Order {
    let mut copy = order.clone();
    copy.take_events();
    copy
}

fn plan_allocations(state: &State, order: &Order) -> Result<(Vec<Lot>, Vec<LotAllocation>)> {
    for line in order.items() {
        let product = state.products.get(&line.product_id).ok_or_else(|| StoreError::product_not_found(line.product_id))?;
        if !product.active {
            return Err(StoreError::Conflict(format!("product {} is no longer sold", product.id)));
        }
    }
    let mut scratch = state.lots.clone();
    let allocations = draw_order_lines(&mut scratch, order, today())?;
    Ok((scratch, allocations))
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<()> { Ok(()) }

    async fn list_products(&self, filter: &ProductFilter) -> Result<Page<Product>> {
        let state = self.state.lock().await;
        let mut products: Vec<Product> = state.products.values().filter(|p| filter.matches(p)).map(|p| state.with_stock(p)).collect();
        products.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(paginate(products, filter.pagination))
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>> {
        let state = self.state.lock().await;
        Ok(state.products.get(&id).map(|p| state.with_stock(p)))
    }

    async fn get_products(&self, ids: &[Uuid]) -> Result<Vec<Product>> {
        let state = self.state.lock().await;
        Ok(ids.iter().filter_map(|id| state.products.get(id)).map(|p| state.with_stock(p)).collect())
    }

    async fn create_product(&self, product: &Product) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.products.values().any(|p| p.code == product.code) {
            return Err(StoreError::Conflict(format!("product code {} already exists", product.code)));
        }
        state.products.insert(product.id, product.clone());
        Ok(())
    }

    async fn update_product(&self, product: &Product) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state.products.get_mut(&product.id).ok_or_else(|| StoreError::product_not_found(product.id))?;
        *slot = product.clone();
        Ok(())
    }

    async fn list_lots(&self, product_id: Uuid) -> Result<Vec<Lot>> {
        let state = self.state.lock().await;
        let mut lots: Vec<Lot> = state.lots.iter().filter(|l| l.product_id == product_id).cloned().collect();
        lots.sort_by_key(|l| l.expires_on);
        Ok(lots)
    }

    async fn receive_lot(&self, product_id: Uuid, receipt: LotReceipt) -> Result<Lot> {
        let mut state = self.state.lock().await;
        let product = state.products.get(&product_id).ok_or_else(|| StoreError::product_not_found(product_id))?;
        let seq = state.lots.iter().filter(|l| l.product_id == product_id).count() + 1;
        let lot_number = receipt.lot_number.unwrap_or_else(|| default_lot_number(&product.code, seq));
        let lot = Lot::receive(product_id, lot_number, receipt.quantity, receipt.purchase_price, receipt.expires_on, today())?;
        if state.lots.iter().any(|l| l.product_id == product_id && l.lot_number == lot.lot_number) {
            return Err(StoreError::Conflict(format!("lot {} already exists for product {product_id}", lot.lot_number)));
        }
        state.lots.push(lot.clone());
        Ok(lot)
    }

    async fn find_order_by_idempotency_key(&self, key: &str) -> Result<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.iter().find(|o| o.idempotency_key() == Some(key)).cloned())
    }

    async fn place_order(&self, mut order: Order, sale: Option<&Sale>) -> Result<Placement> {
        let mut state = self.state.lock().await;
        if let Some(key) = order.idempotency_key() {
            if let Some(existing) = state.orders.iter().find(|o| o.idempotency_key() == Some(key)) {
                return Ok(Placement::Replayed(existing.clone()));
            }
        }
        if let Some(sale) = sale {
            if state.sales.iter().any(|s| s.number == sale.number) {
                return Err(StoreError::SaleNumberTaken(sale.number.clone()));
            }
        }
        let (lots, allocations) = plan_allocations(&state, &order)?;
        state.lots = lots;
        order.record_allocations(allocations);
        state.orders.push(stored(&order));
        if let Some(sale) = sale {
            state.sales.push(sale.clone());
        }
        Ok(Placement::Created(order))
    }

    async fn list_orders(&self, filter: &OrderFilter) -> Result<Page<Order>> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state.orders.iter().filter(|o| filter.matches(o)).cloned().collect();
        orders.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
        Ok(paginate(orders, filter.pagination))
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<Order>> {
        let state = self.state.lock().await;
        Ok(state.orders.iter().find(|o| o.id() == id).cloned())
    }

    async fn save_order_status(&self, order: &Order, from: OrderStatus) -> Result<()> {
        let mut state = self.state.lock().await;
        let slot = state.orders.iter_mut().find(|o| o.id() == order.id()).ok_or_else(|| StoreError::order_not_found(order.id()))?;
        if slot.status() != from {
            return Err(stale_status(order.id(), from, slot.status()));
        }
        let allocations = slot.allocations().to_vec();
        *slot = stored(order);
        slot.record_allocations(allocations);
        Ok(())
    }

    async fn cancel_order(&self, order: &Order) -> Result<Vec<LotAllocation>> {
        let mut state = self.state.lock().await;
        let index = state.orders.iter().position(|o| o.id() == order.id()).ok_or_else(|| StoreError::order_not_found(order.id()))?;
        cancellable(order.id(), state.orders[index].status())?;

        let allocations = state.orders[index].allocations().to_vec();
        for allocation in &allocations {
            state.lot_mut(allocation.lot_id)?.restore(allocation.quantity);
        }
        for sale in state.sales.iter_mut().filter(|s| s.order_id == Some(order.id())) {
            sale.status = SaleStatus::Voided;
        }
        let mut cancelled = stored(order);
        cancelled.record_allocations(allocations.clone());
        state.orders[index] = cancelled;
        Ok(allocations)
    }

    async fn sales_for_order(&self, order_id: Uuid) -> Result<Vec<Sale>> {
        let state = self.state.lock().await;
        Ok(state.sales.iter().filter(|s| s.order_id == Some(order_id)).cloned().collect())
    }

    async fn list_profiles(&self, filter: &ProfileFilter) -> Result<Page<Profile>> {
        let state = self.state.lock().await;
        let mut profiles: Vec<Profile> = state.profiles.values().filter(|p| filter.matches(p)).cloned().collect();
        profiles.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(paginate(profiles, filter.pagination))
    }

    async fn get_profile(&self, id: Uuid) -> Result<Option<Profile>> {
        Ok(self.state.lock().await.profiles.get(&id).cloned())
    }

    async fn find_profile_by_email(&self, email: &str) -> Result<Option<Profile>> {
        let email = email.trim().to_lowercase();
        Ok(self.state.lock().await.profiles.values().find(|p| p.email == email).cloned())
    }

    async fn create_profile(&self, profile: &Profile) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.profiles.values().any(|p| p.email == profile.email) {
            return Err(StoreError::Conflict(format!("a profile with email {} already exists", profile.email)));
        }
        state.profiles.insert(profile.id, profile.clone());
        Ok(())
    }

    async fn load_cart(&self, session_id: &str) -> Result<Option<Cart>> {
        Ok(self.state.lock().await.carts.get(&cart_storage_key(session_id)).cloned())
    }

    async fn save_cart(&self, cart: &Cart) -> Result<()> {
        self.state.lock().await.carts.insert(cart_storage_key(cart.session_id()), cart.clone());
        Ok(())
    }

    async fn delete_cart(&self, session_id: &str) -> Result<()> {
        self.state.lock().await.carts.remove(&cart_storage_key(session_id));
        Ok(())
    }
}
