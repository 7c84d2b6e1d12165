//! Order Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::aggregates::LotAllocation;
use crate::domain::value_objects::Money;
use crate::domain::events::{DomainEvent, OrderEvent};

#[derive(Clone, Debug, Serialize)]
pub struct Order {
    id: Uuid,
    customer_id: Uuid,
    status: OrderStatus,
    payment_method: Option<String>,
    delivery_address: Option<String>,
    notes: Option<String>,
    items: Vec<OrderLine>,
    subtotal: Money,
    discount: Money,
    total: Money,
    idempotency_key: Option<String>,
    allocations: Vec<LotAllocation>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    events: Vec<DomainEvent>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrderLine { pub id: Uuid, pub product_id: Uuid, pub quantity: u32, pub unit_price: Decimal, pub subtotal: Decimal }

/// Everything needed to place an order.
#[derive(Clone, Debug, Default)]
pub struct OrderDraft {
    pub customer_id: Uuid,
    pub lines: Vec<DraftLine>,
    pub discount: Decimal,
    pub payment_method: Option<String>,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DraftLine { pub product_id: Uuid, pub quantity: u32, pub unit_price: Decimal }

/// Persisted shape of an order, used to rehydrate the aggregate.
#[derive(Clone, Debug)]
pub struct OrderRecord {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub payment_method: Option<String>,
    pub delivery_address: Option<String>,
    pub notes: Option<String>,
    pub items: Vec<OrderLine>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub idempotency_key: Option<String>,
    pub allocations: Vec<LotAllocation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    #[default]
    #[serde(rename = "pendiente")] Pending,
    #[serde(rename = "confirmada")] Confirmed,
    #[serde(rename = "enviada")] Shipped,
    #[serde(rename = "entregada")] Delivered,
    #[serde(rename = "cancelada")] Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pendiente",
            Self::Confirmed => "confirmada",
            Self::Shipped => "enviada",
            Self::Delivered => "entregada",
            Self::Cancelled => "cancelada",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for OrderStatus {
    type Err = OrderError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pendiente" => Ok(Self::Pending),
            "confirmada" => Ok(Self::Confirmed),
            "enviada" => Ok(Self::Shipped),
            "entregada" => Ok(Self::Delivered),
            "cancelada" => Ok(Self::Cancelled),
            other => Err(OrderError::UnknownStatus(other.to_string())),
        }
    }
}

impl Order {
    /// Builds a pending order from `draft`. `total = subtotal - discount`, with the
    /// discount bounded by the subtotal.
    pub fn place(draft: OrderDraft, currency: &str) -> Result<Self, OrderError> {
        if draft.lines.is_empty() { return Err(OrderError::NoItems); }
        let mut items = Vec::with_capacity(draft.lines.len());
        for line in &draft.lines {
            if line.quantity == 0 { return Err(OrderError::InvalidQuantity(line.product_id)); }
            if line.unit_price < Decimal::ZERO { return Err(OrderError::InvalidPrice(line.product_id)); }
            if !Money::new(line.unit_price, currency).is_whole_cents() { return Err(OrderError::SubCentAmount(line.unit_price)); }
            items.push(OrderLine {
                id: Uuid::now_v7(), product_id: line.product_id, quantity: line.quantity,
                unit_price: line.unit_price, subtotal: line.unit_price * Decimal::from(line.quantity),
            });
        }
        let subtotal = Money::new(items.iter().map(|i| i.subtotal).sum(), currency);
        if draft.discount < Decimal::ZERO || draft.discount > subtotal.amount() {
            return Err(OrderError::InvalidDiscount { discount: draft.discount, subtotal: subtotal.amount() });
        }
        let discount = Money::new(draft.discount, currency);
        if !discount.is_whole_cents() { return Err(OrderError::SubCentAmount(draft.discount)); }
        let total = subtotal.subtract(&discount).map_err(|_| OrderError::InvalidDiscount { discount: draft.discount, subtotal: subtotal.amount() })?;

        let now = Utc::now();
        let id = Uuid::now_v7();
        let mut order = Self {
            id, customer_id: draft.customer_id, status: OrderStatus::Pending,
            payment_method: draft.payment_method, delivery_address: draft.delivery_address, notes: draft.notes,
            items, subtotal, discount, total, idempotency_key: draft.idempotency_key,
            allocations: vec![], created_at: now, updated_at: now, events: vec![],
        };
        order.raise_event(DomainEvent::Order(OrderEvent::Created { order_id: id, customer_id: order.customer_id, total: order.total.amount() }));
        Ok(order)
    }

    pub fn id(&self) -> Uuid { self.id }
    pub fn customer_id(&self) -> Uuid { self.customer_id }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn payment_method(&self) -> Option<&str> { self.payment_method.as_deref() }
    pub fn delivery_address(&self) -> Option<&str> { self.delivery_address.as_deref() }
    pub fn notes(&self) -> Option<&str> { self.notes.as_deref() }
    pub fn items(&self) -> &[OrderLine] { &self.items }
    pub fn subtotal(&self) -> &Money { &self.subtotal }
    pub fn discount(&self) -> &Money { &self.discount }
    pub fn total(&self) -> &Money { &self.total }
    pub fn idempotency_key(&self) -> Option<&str> { self.idempotency_key.as_deref() }
    pub fn allocations(&self) -> &[LotAllocation] { &self.allocations }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    /// Records the lot draws made for this order when it was stored.
    pub fn record_allocations(&mut self, allocations: Vec<LotAllocation>) { self.allocations = allocations; }

    pub fn confirm(&mut self) -> Result<(), OrderError> {
        self.guard(OrderStatus::Pending, OrderStatus::Confirmed)?;
        self.status = OrderStatus::Confirmed;
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Confirmed { order_id: self.id }));
        Ok(())
    }

    pub fn ship(&mut self) -> Result<(), OrderError> {
        self.guard(OrderStatus::Confirmed, OrderStatus::Shipped)?;
        self.status = OrderStatus::Shipped;
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Shipped { order_id: self.id }));
        Ok(())
    }

    pub fn deliver(&mut self) -> Result<(), OrderError> {
        self.guard(OrderStatus::Shipped, OrderStatus::Delivered)?;
        self.status = OrderStatus::Delivered;
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Delivered { order_id: self.id }));
        Ok(())
    }

    /// Only orders that have not left the warehouse can be cancelled.
    pub fn cancel(&mut self) -> Result<(), OrderError> {
        if !matches!(self.status, OrderStatus::Pending | OrderStatus::Confirmed) {
            return Err(OrderError::InvalidTransition { from: self.status, to: OrderStatus::Cancelled });
        }
        self.status = OrderStatus::Cancelled;
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Cancelled { order_id: self.id }));
        Ok(())
    }

    pub fn transition_to(&mut self, target: OrderStatus) -> Result<(), OrderError> {
        match target {
            OrderStatus::Confirmed => self.confirm(),
            OrderStatus::Shipped => self.ship(),
            OrderStatus::Delivered => self.deliver(),
            OrderStatus::Cancelled => self.cancel(),
            OrderStatus::Pending => Err(OrderError::InvalidTransition { from: self.status, to: target }),
        }
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> { std::mem::take(&mut self.events) }
    fn raise_event(&mut self, e: DomainEvent) { self.events.push(e); }
    fn touch(&mut self) { self.updated_at = Utc::now(); }

    fn guard(&self, expected: OrderStatus, to: OrderStatus) -> Result<(), OrderError> {
        if self.status != expected { return Err(OrderError::InvalidTransition { from: self.status, to }); }
        Ok(())
    }
}

impl From<OrderRecord> for Order {
    fn from(r: OrderRecord) -> Self {
        Self {
            id: r.id, customer_id: r.customer_id, status: r.status, payment_method: r.payment_method,
            delivery_address: r.delivery_address, notes: r.notes, items: r.items,
            subtotal: Money::new(r.subtotal, &r.currency), discount: Money::new(r.discount, &r.currency),
            total: Money::new(r.total, &r.currency), idempotency_key: r.idempotency_key,
            allocations: r.allocations, created_at: r.created_at, updated_at: r.updated_at, events: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("an order needs at least one item")]
    NoItems,
    #[error("quantity for product {0} must be at least 1")]
    InvalidQuantity(Uuid),
    #[error("price for product {0} cannot be negative")]
    InvalidPrice(Uuid),
    #[error("amount {0} has a fraction of a cent")]
    SubCentAmount(Decimal),
    #[error("discount {discount} must be between 0 and the subtotal {subtotal}")]
    InvalidDiscount { discount: Decimal, subtotal: Decimal },
    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("unknown order status '{0}'")]
    UnknownStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(lines: Vec<DraftLine>, discount: Decimal) -> OrderDraft {
        OrderDraft { customer_id: Uuid::now_v7(), lines, discount, ..Default::default() }
    }

    fn line(qty: u32, price: i64) -> DraftLine {
        DraftLine { product_id: Uuid::now_v7(), quantity: qty, unit_price: Decimal::new(price, 2) }
    }

    #[test]
    fn test_order_workflow() {
        let mut order = Order::place(draft(vec![line(2, 1000)], Decimal::ZERO), "USD").unwrap();
        order.confirm().unwrap();
        assert_eq!(order.status(), OrderStatus::Confirmed);
        order.ship().unwrap();
        assert_eq!(order.status(), OrderStatus::Shipped);
        assert!(order.cancel().is_err());
        order.deliver().unwrap();
        assert_eq!(order.take_events().len(), 4);
    }

    #[test]
    fn total_is_subtotal_minus_discount() {
        let order = Order::place(draft(vec![line(2, 1050), line(1, 399)], Decimal::new(500, 2)), "USD").unwrap();
        assert_eq!(order.subtotal().amount(), Decimal::new(2499, 2));
        assert_eq!(order.total().amount(), order.subtotal().amount() - order.discount().amount());
        assert_eq!(order.total().amount(), Decimal::new(1999, 2));
    }

    #[test]
    fn rejects_invalid_drafts() {
        assert_eq!(Order::place(draft(vec![], Decimal::ZERO), "USD").unwrap_err(), OrderError::NoItems);
        assert!(matches!(Order::place(draft(vec![line(0, 100)], Decimal::ZERO), "USD"), Err(OrderError::InvalidQuantity(_))));
        assert!(matches!(Order::place(draft(vec![line(1, 100)], Decimal::new(2, 0)), "USD"), Err(OrderError::InvalidDiscount { .. })));
        assert!(matches!(Order::place(draft(vec![line(1, 100)], Decimal::new(-1, 0)), "USD"), Err(OrderError::InvalidDiscount { .. })));
    }

    #[test]
    fn rejects_fractions_of_a_cent() {
        let odd_price = DraftLine { product_id: Uuid::now_v7(), quantity: 1, unit_price: Decimal::new(1004, 3) };
        assert_eq!(Order::place(draft(vec![odd_price], Decimal::ZERO), "USD").unwrap_err(), OrderError::SubCentAmount(Decimal::new(1004, 3)));
        let odd_discount = Order::place(draft(vec![line(1, 100)], Decimal::new(5, 3)), "USD");
        assert_eq!(odd_discount.unwrap_err(), OrderError::SubCentAmount(Decimal::new(5, 3)));

        let order = Order::place(draft(vec![DraftLine { unit_price: Decimal::new(12_500, 3), ..line(3, 0) }], Decimal::new(50, 2)), "USD").unwrap();
        assert_eq!(order.total().amount(), Decimal::new(3700, 2));
        assert_eq!(order.total().amount(), order.total().round_cents().amount());
    }

    #[test]
    fn cancel_from_pending_or_confirmed_only() {
        let mut order = Order::place(draft(vec![line(1, 100)], Decimal::ZERO), "USD").unwrap();
        order.transition_to(OrderStatus::Cancelled).unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert!(order.transition_to(OrderStatus::Confirmed).is_err());
        assert!(order.transition_to(OrderStatus::Pending).is_err());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in ["pendiente", "confirmada", "enviada", "entregada", "cancelada"] {
            assert_eq!(s.parse::<OrderStatus>().unwrap().as_str(), s);
        }
        assert!("shipped".parse::<OrderStatus>().is_err());
    }
}
