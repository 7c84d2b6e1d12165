//! Order placement and payment-backed checkout.
//!
//! Orders are validated, then handed to the store, which stores them and draws
//! their stock as one unit. A repeated idempotency key returns the stored order
//! untouched. Payment-backed checkout charges first and uses the payment id as
//! the order's idempotency key, so confirming a payment twice never sells twice.

use chrono::Utc;
use moka::future::Cache;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::QueryCache;
use crate::domain::aggregates::{
    sale::sale_number, Cart, DraftLine, Order, OrderDraft, OrderStatus, Product, Profile, ReconcileReport, Sale, SaleDraft, SaleItem,
};
use crate::domain::events::{DomainEvent, StockEvent};
use crate::domain::value_objects::{Money, TaxRate};
use crate::payments::{PaymentGateway, PaymentMethod, PaymentOutcome, PaymentRequest, PaymentTracker, CONFIRMATION_WINDOW};
use crate::publisher::EventPublisher;
use crate::store::{Placement, Store};
use crate::{Result, StoreError};

const SALE_NUMBER_ATTEMPTS: usize = 3;
const PENDING_CHECKOUTS: u64 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckoutItem {
    pub product_id: Uuid,
    pub quantity: u32,
}

#[derive(Clone, Debug)]
pub struct CheckoutRequest {
    pub method: PaymentMethod,
    pub customer_id: Option<Uuid>,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub shipping_address: Option<String>,
    pub shipping_city: Option<String>,
    pub shipping_notes: Option<String>,
    /// Items to buy; ignored when `cart_session` is set.
    pub items: Vec<CheckoutItem>,
    /// Check out a persisted cart instead of `items`.
    pub cart_session: Option<String>,
    pub discount: Decimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStatus { Completed, RequiresConfirmation }

#[derive(Debug, Serialize)]
pub struct CheckoutReceipt {
    pub payment_id: String,
    pub status: CheckoutStatus,
    pub client_secret: Option<String>,
    pub order: Option<Order>,
    pub sale: Option<Sale>,
    /// True when the order already existed for this payment.
    pub replayed: bool,
}

#[derive(Clone)]
struct PendingCheckout {
    order: OrderDraft,
    sale: SaleDraft,
    cart_session: Option<String>,
}

pub struct CheckoutService {
    store: Arc<dyn Store>,
    cache: QueryCache,
    publisher: EventPublisher,
    gateway: Arc<dyn PaymentGateway>,
    tracker: Arc<PaymentTracker>,
    tax_rate: TaxRate,
    currency: String,
    awaiting_confirmation: Cache<String, PendingCheckout>,
    /// One lock per payment id so concurrent confirmations run one at a time.
    confirming: Cache<String, Arc<Mutex<()>>>,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: QueryCache,
        publisher: EventPublisher,
        gateway: Arc<dyn PaymentGateway>,
        tracker: Arc<PaymentTracker>,
        tax_rate: TaxRate,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            gateway,
            tracker,
            tax_rate,
            currency: currency.into(),
            awaiting_confirmation: Cache::builder().max_capacity(PENDING_CHECKOUTS).time_to_live(CONFIRMATION_WINDOW).build(),
            confirming: Cache::builder().max_capacity(PENDING_CHECKOUTS).time_to_live(CONFIRMATION_WINDOW).build(),
        }
    }

    pub fn currency(&self) -> &str { &self.currency }
    pub fn tax_rate(&self) -> TaxRate { self.tax_rate }

    /// Places an order from `draft`. Stock for every line is drawn atomically;
    /// insufficient stock on any line fails the whole order.
    pub async fn place_order(&self, draft: OrderDraft) -> Result<Placement> {
        let order = self.build_order(draft)?;
        self.store_order(order, None).await
    }

    fn build_order(&self, draft: OrderDraft) -> Result<Order> {
        if draft.customer_id.is_nil() {
            return Err(StoreError::Validation("customer id is required".to_string()));
        }
        Ok(Order::place(draft, &self.currency)?)
    }

    async fn store_order(&self, order: Order, sale: Option<&Sale>) -> Result<Placement> {
        let placement = match self.store.place_order(order, sale).await {
            Ok(placement) => placement,
            Err(e @ StoreError::InsufficientStock { .. }) => {
                tracing::warn!(error = %e, "order rejected");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        match placement {
            Placement::Created(mut order) => {
                let mut events = order.take_events();
                events.extend(order.allocations().iter().map(|a| {
                    DomainEvent::Stock(StockEvent::Decremented { product_id: a.product_id, lot_id: a.lot_id, quantity: a.quantity, order_id: order.id() })
                }));
                self.publisher.publish_all(&events).await;
                self.cache.invalidate();
                tracing::info!(order_id = %order.id(), total = %order.total().amount(), lines = order.items().len(), "order placed");
                Ok(Placement::Created(order))
            }
            Placement::Replayed(order) => {
                tracing::info!(order_id = %order.id(), key = ?order.idempotency_key(), "order request replayed, stock untouched");
                Ok(Placement::Replayed(order))
            }
        }
    }

    /// Moves an order to `target`. Cancelling returns every drawn unit to the
    /// lot it came from and voids the order's sales.
    pub async fn transition(&self, order_id: Uuid, target: OrderStatus) -> Result<Order> {
        let mut order = self.store.get_order(order_id).await?.ok_or_else(|| StoreError::order_not_found(order_id))?;
        let from = order.status();
        order.transition_to(target)?;
        let mut events = order.take_events();

        if target == OrderStatus::Cancelled {
            let restored = self.store.cancel_order(&order).await?;
            events.extend(restored.iter().map(|a| {
                DomainEvent::Stock(StockEvent::Restored { product_id: a.product_id, lot_id: a.lot_id, quantity: a.quantity, order_id })
            }));
            self.cache.invalidate();
        } else {
            self.store.save_order_status(&order, from).await?;
        }

        self.publisher.publish_all(&events).await;
        tracing::info!(%order_id, %from, to = %target, "order status changed");
        Ok(order)
    }

    /// Re-validates a persisted cart against live products and saves the result.
    pub async fn reconcile_cart(&self, session_id: &str) -> Result<(Cart, ReconcileReport)> {
        let mut cart = self.store.load_cart(session_id).await?.unwrap_or_else(|| Cart::new(session_id, &self.currency));
        let ids: Vec<Uuid> = cart.items().iter().map(|i| i.product_id).collect();
        let live: HashMap<Uuid, Product> = self.store.get_products(&ids).await?.into_iter().map(|p| (p.id, p)).collect();
        let report = cart.reconcile(&live);
        self.store.save_cart(&cart).await?;
        Ok((cart, report))
    }

    /// Charges the customer and, once the payment is captured, places the order
    /// and records the sale. Card payments stop after authorisation and finish
    /// in [`confirm_card_payment`](Self::confirm_card_payment).
    pub async fn pay_and_checkout(&self, request: CheckoutRequest) -> Result<CheckoutReceipt> {
        let customer = self.resolve_customer(&request).await?;

        let items = match request.cart_session.as_deref() {
            Some(session) => self.items_from_cart(session).await?,
            None => request.items.clone(),
        };
        if items.is_empty() {
            return Err(StoreError::Validation("checkout needs at least one item".to_string()));
        }
        let priced = self.price_items(&items).await?;

        let order = OrderDraft {
            customer_id: customer.id,
            lines: priced.iter().map(|(p, qty)| DraftLine { product_id: p.id, quantity: *qty, unit_price: p.sale_price }).collect(),
            discount: request.discount,
            payment_method: Some(request.method.as_str().to_string()),
            delivery_address: delivery_address(request.shipping_address.as_deref(), request.shipping_city.as_deref()),
            notes: request.shipping_notes.clone(),
            idempotency_key: None,
        };
        // fail on a bad discount before any money moves
        Order::place(order.clone(), &self.currency)?;

        let sale = SaleDraft {
            order_id: None,
            customer_name: request.customer_name.clone().or_else(|| Some(customer.full_name())),
            customer_phone: request.customer_phone.clone().or_else(|| customer.phone.clone()),
            customer_email: request.customer_email.clone().or_else(|| Some(customer.email.clone())),
            seller_id: None,
            seller_name: None,
            discount: request.discount,
            payment_method: request.method.as_str().to_string(),
            items: priced
                .iter()
                .map(|(p, qty)| SaleItem {
                    product_id: p.id,
                    product_name: p.name.clone(),
                    quantity: *qty,
                    unit_price: p.sale_price,
                    subtotal: p.sale_price * Decimal::from(*qty),
                })
                .collect(),
        };
        let preview = Sale::record(sale.clone(), self.tax_rate, &self.currency)?;

        let outcome = self
            .gateway
            .charge(&PaymentRequest {
                method: request.method,
                amount: Money::new(preview.total, &self.currency),
                customer_email: preview.customer_email.clone(),
                description: format!("{} item(s) for {}", priced.len(), customer.email),
            })
            .await?;
        self.tracker.track(outcome.payment_id()).await;

        let pending = PendingCheckout { order, sale, cart_session: request.cart_session };
        match outcome {
            PaymentOutcome::Approved { payment_id } => self.complete(payment_id, pending).await,
            PaymentOutcome::RequiresConfirmation { payment_id, client_secret } => {
                self.awaiting_confirmation.insert(payment_id.clone(), pending).await;
                tracing::info!(%payment_id, "card payment awaiting confirmation");
                Ok(CheckoutReceipt {
                    payment_id,
                    status: CheckoutStatus::RequiresConfirmation,
                    client_secret: Some(client_secret),
                    order: None,
                    sale: None,
                    replayed: false,
                })
            }
        }
    }

    /// Captures an authorised card payment and completes its checkout. Repeating
    /// the confirmation returns the order placed the first time.
    pub async fn confirm_card_payment(&self, payment_id: &str) -> Result<CheckoutReceipt> {
        let lock = self.confirming.get_with(payment_id.to_string(), async { Arc::new(Mutex::new(())) }).await;
        let _confirming = lock.lock().await;

        if let Some(receipt) = self.completed_receipt(payment_id).await? {
            return Ok(receipt);
        }

        let Some(pending) = self.awaiting_confirmation.get(payment_id).await else {
            return Err(StoreError::NotFound(format!("pending payment {payment_id}")));
        };
        if let Err(e) = self.gateway.confirm(payment_id).await {
            // a concurrent confirmation may have captured it first
            if let Some(receipt) = self.completed_receipt(payment_id).await? {
                return Ok(receipt);
            }
            return Err(e);
        }
        self.awaiting_confirmation.invalidate(payment_id).await;
        self.complete(payment_id.to_string(), pending).await
    }

    async fn completed_receipt(&self, payment_id: &str) -> Result<Option<CheckoutReceipt>> {
        let Some(order) = self.store.find_order_by_idempotency_key(payment_id).await? else {
            return Ok(None);
        };
        let sale = self.store.sales_for_order(order.id()).await?.into_iter().next();
        Ok(Some(CheckoutReceipt {
            payment_id: payment_id.to_string(),
            status: CheckoutStatus::Completed,
            client_secret: None,
            order: Some(order),
            sale,
            replayed: true,
        }))
    }

    /// Places the order and records its sale in one store write. Anything that
    /// keeps the order from being stored refunds the captured payment.
    async fn complete(&self, payment_id: String, pending: PendingCheckout) -> Result<CheckoutReceipt> {
        let mut draft = pending.order;
        draft.idempotency_key = Some(payment_id.clone());

        let placed = match self.place_with_sale(draft, pending.sale).await {
            Ok(placed) => placed,
            Err(e) => {
                tracing::error!(%payment_id, error = %e, "order failed after payment was captured, refunding");
                if let Err(refund_error) = self.gateway.refund(&payment_id).await {
                    tracing::error!(%payment_id, error = %refund_error, "refund failed");
                }
                return Err(e);
            }
        };

        let (order, sale, replayed) = match placed {
            (Placement::Created(order), sale) => {
                tracing::info!(sale = %sale.number, order_id = %order.id(), total = %sale.total, "sale recorded");
                (order, Some(sale), false)
            }
            (Placement::Replayed(order), _) => {
                let sale = self.store.sales_for_order(order.id()).await?.into_iter().next();
                (order, sale, true)
            }
        };

        if let Some(session) = pending.cart_session.as_deref() {
            if let Err(e) = self.store.delete_cart(session).await {
                tracing::warn!(%session, error = %e, "cart not cleared after checkout");
            }
        }

        Ok(CheckoutReceipt { payment_id, status: CheckoutStatus::Completed, client_secret: None, order: Some(order), sale, replayed })
    }

    /// Sale numbers are millisecond timestamps; on a collision wait a tick and renumber.
    async fn place_with_sale(&self, draft: OrderDraft, sale_draft: SaleDraft) -> Result<(Placement, Sale)> {
        let order = self.build_order(draft)?;
        let mut sale_draft = sale_draft;
        sale_draft.order_id = Some(order.id());
        let mut sale = Sale::record(sale_draft, self.tax_rate, &self.currency)?;

        let mut attempt = 1;
        loop {
            match self.store_order(order.clone(), Some(&sale)).await {
                Ok(placement) => return Ok((placement, sale)),
                Err(StoreError::SaleNumberTaken(_)) if attempt < SALE_NUMBER_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    sale.number = sale_number(Utc::now());
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn resolve_customer(&self, request: &CheckoutRequest) -> Result<Profile> {
        if let Some(id) = request.customer_id {
            return self.store.get_profile(id).await?.ok_or_else(|| StoreError::profile_not_found(id));
        }
        if let Some(email) = request.customer_email.as_deref() {
            if let Some(profile) = self.store.find_profile_by_email(email).await? {
                return Ok(profile);
            }
        }
        Err(StoreError::Validation("checkout requires a registered customer: pass customer_id or a known customer_email".to_string()))
    }

    async fn items_from_cart(&self, session_id: &str) -> Result<Vec<CheckoutItem>> {
        let (cart, report) = self.reconcile_cart(session_id).await?;
        if !report.is_clean() {
            return Err(StoreError::Conflict(format!(
                "cart changed while checking stock ({} adjustment(s)); review it before paying",
                report.adjustments.len()
            )));
        }
        Ok(cart.items().iter().map(|i| CheckoutItem { product_id: i.product_id, quantity: i.quantity }).collect())
    }

    /// Pairs each item with its live product, refusing anything that cannot be sold.
    async fn price_items(&self, items: &[CheckoutItem]) -> Result<Vec<(Product, u32)>> {
        let ids: Vec<Uuid> = items.iter().map(|i| i.product_id).collect();
        let live: HashMap<Uuid, Product> = self.store.get_products(&ids).await?.into_iter().map(|p| (p.id, p)).collect();

        let mut requested: HashMap<Uuid, u32> = HashMap::new();
        let mut priced = Vec::with_capacity(items.len());
        for item in items {
            if item.quantity == 0 {
                return Err(StoreError::Validation(format!("quantity for product {} must be at least 1", item.product_id)));
            }
            let product = live.get(&item.product_id).ok_or_else(|| StoreError::product_not_found(item.product_id))?;
            if !product.active {
                return Err(StoreError::Conflict(format!("product {} is no longer sold", product.id)));
            }
            let total = requested.entry(product.id).or_default();
            *total += item.quantity;
            if *total > product.stock {
                return Err(StoreError::InsufficientStock { product_id: product.id, requested: *total, available: product.stock });
            }
            priced.push((product.clone(), item.quantity));
        }
        Ok(priced)
    }
}

fn delivery_address(address: Option<&str>, city: Option<&str>) -> Option<String> {
    match (address.map(str::trim).filter(|a| !a.is_empty()), city.map(str::trim).filter(|c| !c.is_empty())) {
        (Some(a), Some(c)) => Some(format!("{a}, {c}")),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(c)) => Some(c.to_string()),
        (None, None) => None,
    }
}
