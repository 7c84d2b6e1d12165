//! Payment methods, gateways and status tracking.
//!
//! Real gateway SDKs are out of reach here; [`SimulatedGateway`] stands in for
//! all of them and behaves like a sandbox.

mod gateway;
mod tracker;

pub use gateway::{PaymentGateway, PaymentOutcome, PaymentRequest, SimulatedGateway};
pub use tracker::{PaymentState, PaymentStatus, PaymentTracker};

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::GatewayCredentials;

/// How long an authorised card payment waits for confirmation.
pub const CONFIRMATION_WINDOW: Duration = Duration::from_secs(60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[serde(alias = "stripe_card", alias = "tarjeta", alias = "stripe")]
    Card,
    Paypal,
    Mercadopago,
    #[serde(alias = "transferencia")]
    BankTransfer,
    #[serde(alias = "efectivo")]
    Cash,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Card => "card",
            Self::Paypal => "paypal",
            Self::Mercadopago => "mercadopago",
            Self::BankTransfer => "bank_transfer",
            Self::Cash => "cash",
        }
    }

    /// Card payments are authorised first and captured on confirmation.
    pub fn needs_confirmation(&self) -> bool { matches!(self, Self::Card) }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind { Card, Transfer, Cash }

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MethodInfo {
    pub id: PaymentMethod,
    pub kind: MethodKind,
    pub name: &'static str,
    pub description: &'static str,
    /// Percentage of the amount, e.g. `2.9` for 2.9 %.
    pub fee_percentage: Decimal,
    pub fee_fixed: Decimal,
    pub processing_time: &'static str,
    pub enabled: bool,
}

/// Cost of paying an amount with one method.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FeeQuote {
    pub amount: Decimal,
    pub fee: Decimal,
    pub total_with_fees: Decimal,
}

impl MethodInfo {
    /// Gateway fee for charging `amount`, rounded to cents.
    pub fn fee(&self, amount: Decimal) -> Decimal {
        (amount * self.fee_percentage / Decimal::ONE_HUNDRED + self.fee_fixed)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }

    pub fn quote(&self, amount: Decimal) -> FeeQuote {
        let fee = self.fee(amount);
        FeeQuote { amount, fee, total_with_fees: amount + fee }
    }
}

/// Every known method; gateway-backed ones are enabled only when their
/// credential is configured.
pub fn method_catalog(credentials: &GatewayCredentials) -> Vec<MethodInfo> {
    vec![
        MethodInfo {
            id: PaymentMethod::Card,
            kind: MethodKind::Card,
            name: "Credit/debit card",
            description: "Visa, Mastercard, American Express",
            fee_percentage: Decimal::new(29, 1),
            fee_fixed: Decimal::new(30, 2),
            processing_time: "Immediate",
            enabled: credentials.stripe_secret_key.is_some(),
        },
        MethodInfo {
            id: PaymentMethod::Paypal,
            kind: MethodKind::Transfer,
            name: "PayPal",
            description: "Pay with your PayPal account",
            fee_percentage: Decimal::new(34, 1),
            fee_fixed: Decimal::new(35, 2),
            processing_time: "Immediate",
            enabled: credentials.paypal_client_id.is_some(),
        },
        MethodInfo {
            id: PaymentMethod::Mercadopago,
            kind: MethodKind::Transfer,
            name: "MercadoPago",
            description: "Secure payment with MercadoPago",
            fee_percentage: Decimal::new(499, 2),
            fee_fixed: Decimal::ZERO,
            processing_time: "Immediate",
            enabled: credentials.mercadopago_access_token.is_some(),
        },
        MethodInfo {
            id: PaymentMethod::BankTransfer,
            kind: MethodKind::Transfer,
            name: "Bank transfer",
            description: "Direct transfer to the store's bank account",
            fee_percentage: Decimal::ZERO,
            fee_fixed: Decimal::ZERO,
            processing_time: "1-3 business days",
            enabled: true,
        },
        MethodInfo {
            id: PaymentMethod::Cash,
            kind: MethodKind::Cash,
            name: "Cash",
            description: "Cash on delivery",
            fee_percentage: Decimal::ZERO,
            fee_fixed: Decimal::ZERO,
            processing_time: "On delivery",
            enabled: true,
        },
    ]
}

pub fn enabled_methods(credentials: &GatewayCredentials) -> Vec<MethodInfo> {
    method_catalog(credentials).into_iter().filter(|m| m.enabled).collect()
}
