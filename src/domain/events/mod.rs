//! Domain events
use crate::domain::value_objects::ProductCode;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "aggregate", content = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Product(ProductEvent),
    Order(OrderEvent),
    Stock(StockEvent),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProductEvent {
    Created { product_id: Uuid, code: ProductCode },
    Deactivated { product_id: Uuid },
    LotReceived { product_id: Uuid, lot_id: Uuid, quantity: u32 },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderEvent {
    Created { order_id: Uuid, customer_id: Uuid, total: Decimal },
    Confirmed { order_id: Uuid },
    Shipped { order_id: Uuid },
    Delivered { order_id: Uuid },
    Cancelled { order_id: Uuid },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StockEvent {
    Decremented { product_id: Uuid, lot_id: Uuid, quantity: u32, order_id: Uuid },
    Restored { product_id: Uuid, lot_id: Uuid, quantity: u32, order_id: Uuid },
}

impl DomainEvent {
    /// NATS subject the event is published on, e.g. `qualipharm.order.created`.
    pub fn subject(&self) -> String {
        let (aggregate, name) = match self {
            Self::Product(e) => ("product", match e {
                ProductEvent::Created { .. } => "created",
                ProductEvent::Deactivated { .. } => "deactivated",
                ProductEvent::LotReceived { .. } => "lot_received",
            }),
            Self::Order(e) => ("order", match e {
                OrderEvent::Created { .. } => "created",
                OrderEvent::Confirmed { .. } => "confirmed",
                OrderEvent::Shipped { .. } => "shipped",
                OrderEvent::Delivered { .. } => "delivered",
                OrderEvent::Cancelled { .. } => "cancelled",
            }),
            Self::Stock(e) => ("stock", match e {
                StockEvent::Decremented { .. } => "decremented",
                StockEvent::Restored { .. } => "restored",
            }),
        };
        format!("qualipharm.{aggregate}.{name}")
    }
}
