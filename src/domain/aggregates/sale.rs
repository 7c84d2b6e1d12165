//! Sale Aggregate: the invoiced record of a completed checkout.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use crate::domain::value_objects::{Money, TaxRate};

const WALK_IN_CUSTOMER: &str = "Online customer";
const UNKNOWN_PHONE: &str = "Not provided";
const ONLINE_SELLER: &str = "Online store";

#[derive(Clone, Debug, Serialize)]
pub struct Sale {
    pub id: Uuid,
    pub number: String,
    pub order_id: Option<Uuid>,
    pub customer_name: String,
    pub customer_phone: String,
    pub customer_email: Option<String>,
    pub seller_id: Option<Uuid>,
    pub seller_name: String,
    pub subtotal: Decimal,
    pub taxes: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub status: SaleStatus,
    pub items: Vec<SaleItem>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SaleItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub subtotal: Decimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaleStatus { Completed, Voided }

impl SaleStatus {
    pub fn as_str(&self) -> &'static str {
        match self { Self::Completed => "completed", Self::Voided => "voided" }
    }
}

impl std::str::FromStr for SaleStatus {
    type Err = SaleError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "voided" => Ok(Self::Voided),
            other => Err(SaleError::UnknownStatus(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SaleDraft {
    pub order_id: Option<Uuid>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub seller_id: Option<Uuid>,
    pub seller_name: Option<String>,
    pub discount: Decimal,
    pub payment_method: String,
    pub items: Vec<SaleItem>,
}

/// Sale numbers are the creation time in unix millis, e.g. `VEN-1767225600000`.
pub fn sale_number(at: DateTime<Utc>) -> String {
    format!("VEN-{}", at.timestamp_millis())
}

impl Sale {
    /// `taxes = subtotal * rate` (to cents), `total = subtotal + taxes - discount`.
    pub fn record(draft: SaleDraft, tax: TaxRate, currency: &str) -> Result<Self, SaleError> {
        if draft.items.is_empty() { return Err(SaleError::NoItems); }
        let subtotal = Money::new(draft.items.iter().map(|i| i.subtotal).sum(), currency);
        if draft.discount < Decimal::ZERO || draft.discount > subtotal.amount() || draft.discount.round_dp(2) != draft.discount {
            return Err(SaleError::InvalidDiscount(draft.discount));
        }
        let taxes = tax.apply(&subtotal);
        let total = subtotal.amount() + taxes.amount() - draft.discount;
        let now = Utc::now();
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Ok(Self {
            id: Uuid::now_v7(),
            number: sale_number(now),
            order_id: draft.order_id,
            customer_name: non_blank(draft.customer_name).unwrap_or_else(|| WALK_IN_CUSTOMER.to_string()),
            customer_phone: non_blank(draft.customer_phone).unwrap_or_else(|| UNKNOWN_PHONE.to_string()),
            customer_email: non_blank(draft.customer_email),
            seller_id: draft.seller_id,
            seller_name: non_blank(draft.seller_name).unwrap_or_else(|| ONLINE_SELLER.to_string()),
            subtotal: subtotal.amount(),
            taxes: taxes.amount(),
            discount: draft.discount,
            total,
            currency: currency.to_string(),
            payment_method: draft.payment_method,
            status: SaleStatus::Completed,
            items: draft.items,
            created_at: now,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaleError {
    #[error("a sale needs at least one item")]
    NoItems,
    #[error("discount {0} must be whole cents between 0 and the subtotal")]
    InvalidDiscount(Decimal),
    #[error("unknown sale status '{0}'")]
    UnknownStatus(String),
}
