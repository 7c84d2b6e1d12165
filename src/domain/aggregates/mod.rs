//! Aggregates module
pub mod product;
pub mod order;
pub mod cart;
pub mod sale;
pub mod profile;

pub use product::{allocate_fefo, default_lot_number, sellable_stock, Lot, LotAllocation, LotError, Product, ProductDraft, ProductError, ProductUpdate};
pub use order::{DraftLine, Order, OrderDraft, OrderError, OrderLine, OrderRecord, OrderStatus};
pub use cart::{cart_storage_key, Cart, CartAdjustment, CartError, CartItem, CartProduct, ReconcileReport, RemovalReason, CART_STORE_NAME};
pub use sale::{Sale, SaleDraft, SaleError, SaleItem, SaleStatus};
pub use profile::{Permission, Profile, ProfileDraft, ProfileError, ProfileStatus, Role};
