//! Qualipharm storefront service
//!
//! Pharmacy e-commerce backend.
//!
//! ## Features
//! - Product catalog with lot-level stock and expiry (FEFO allocation)
//! - Shopping cart with stock ceilings and pre-checkout reconciliation
//! - Idempotent order placement with atomic stock decrement
//! - Simulated payment gateways and invoiced sales
//! - Role-gated administration

use thiserror::Error;
use uuid::Uuid;

pub mod api;
pub mod cache;
pub mod checkout;
pub mod config;
pub mod domain;
pub mod payments;
pub mod publisher;
pub mod store;

use domain::aggregates::{CartError, LotError, OrderError, ProductError, ProfileError, Role, SaleError};
use domain::value_objects::{CodeError, MoneyError};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock { product_id: Uuid, requested: u32, available: u32 },

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("sale number {0} is already taken")]
    SaleNumberTaken(String),

    #[error("caller is not identified")]
    Unauthorized,

    #[error("role {0} may not perform this operation")]
    Forbidden(Role),

    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn product_not_found(id: Uuid) -> Self { Self::NotFound(format!("product {id}")) }
    pub fn order_not_found(id: Uuid) -> Self { Self::NotFound(format!("order {id}")) }
    pub fn profile_not_found(id: Uuid) -> Self { Self::NotFound(format!("profile {id}")) }
}

impl From<CartError> for StoreError {
    fn from(e: CartError) -> Self {
        match e {
            CartError::ItemNotFound(_) => Self::NotFound(e.to_string()),
            CartError::StockExceeded { product_id, requested, available } => Self::InsufficientStock { product_id, requested, available },
        }
    }
}

impl From<LotError> for StoreError {
    fn from(e: LotError) -> Self {
        match e {
            LotError::InsufficientStock { product_id, requested, available } => Self::InsufficientStock { product_id, requested, available },
            other => Self::Validation(other.to_string()),
        }
    }
}

impl From<OrderError> for StoreError {
    fn from(e: OrderError) -> Self {
        match e {
            OrderError::InvalidTransition { .. } => Self::Conflict(e.to_string()),
            other => Self::Validation(other.to_string()),
        }
    }
}

macro_rules! validation_from {
    ($($t:ty),*) => {
        $(impl From<$t> for StoreError {
            fn from(e: $t) -> Self { Self::Validation(e.to_string()) }
        })*
    };
}

validation_from!(ProductError, ProfileError, SaleError, CodeError, MoneyError, validator::ValidationErrors);

pub type Result<T> = std::result::Result<T, StoreError>;
