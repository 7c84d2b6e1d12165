use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use moka::future::Cache;

use super::{method_catalog, PaymentMethod, CONFIRMATION_WINDOW};
use crate::config::GatewayCredentials;
use crate::domain::value_objects::Money;
use crate::{Result, StoreError};

pub const CARD_DECLINED: &str = "CARD_DECLINED";

#[derive(Clone, Debug)]
pub struct PaymentRequest {
    pub method: PaymentMethod,
    pub amount: Money,
    pub customer_email: Option<String>,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PaymentOutcome {
    /// Funds captured.
    Approved { payment_id: String },
    /// Card authorised; the client finishes with the secret and the payment is
    /// captured on confirmation.
    RequiresConfirmation { payment_id: String, client_secret: String },
}

impl PaymentOutcome {
    pub fn payment_id(&self) -> &str {
        match self { Self::Approved { payment_id } | Self::RequiresConfirmation { payment_id, .. } => payment_id }
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, request: &PaymentRequest) -> Result<PaymentOutcome>;
    /// Captures a card payment previously authorised by `charge`.
    async fn confirm(&self, payment_id: &str) -> Result<()>;
    /// Returns captured funds when the order behind them could not be placed.
    async fn refund(&self, payment_id: &str) -> Result<()>;
}

const OPEN_AUTHORISATIONS: u64 = 10_000;

/// Sandbox gateway: approves with a fixed probability and fabricates ids.
/// Card authorisations lapse when not confirmed within the confirmation window.
pub struct SimulatedGateway {
    approval_rate: f64,
    credentials: GatewayCredentials,
    authorised: Cache<String, Money>,
}

impl SimulatedGateway {
    pub fn new(approval_rate: f64, credentials: GatewayCredentials) -> Self {
        Self {
            approval_rate: approval_rate.clamp(0.0, 1.0),
            credentials,
            authorised: Cache::builder().max_capacity(OPEN_AUTHORISATIONS).time_to_live(CONFIRMATION_WINDOW).build(),
        }
    }

    fn approve(&self) -> bool { rand::thread_rng().gen_bool(self.approval_rate) }
}

/// `PAY_<unix millis>_<9 lowercase alphanumerics>`
pub fn payment_id() -> String {
    let suffix: String = rand::thread_rng().sample_iter(&Alphanumeric).take(9).map(|b| char::from(b).to_ascii_lowercase()).collect();
    format!("PAY_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(&self, request: &PaymentRequest) -> Result<PaymentOutcome> {
        let enabled = method_catalog(&self.credentials).iter().any(|m| m.id == request.method && m.enabled);
        if !enabled {
            return Err(StoreError::Validation(format!("payment method {} is not enabled", request.method)));
        }
        if request.amount.is_negative() || request.amount.amount().is_zero() {
            return Err(StoreError::Validation("payment amount must be positive".to_string()));
        }

        if !self.approve() {
            tracing::warn!(method = %request.method, amount = %request.amount.amount(), "simulated payment declined");
            return Err(StoreError::PaymentDeclined(CARD_DECLINED.to_string()));
        }

        let payment_id = payment_id();
        tracing::info!(%payment_id, method = %request.method, amount = %request.amount.amount(), "simulated payment accepted");
        if request.method.needs_confirmation() {
            let secret: String = rand::thread_rng().sample_iter(&Alphanumeric).take(24).map(char::from).collect();
            self.authorised.insert(payment_id.clone(), request.amount.clone()).await;
            return Ok(PaymentOutcome::RequiresConfirmation { client_secret: format!("{payment_id}_secret_{secret}"), payment_id });
        }
        Ok(PaymentOutcome::Approved { payment_id })
    }

    async fn confirm(&self, payment_id: &str) -> Result<()> {
        match self.authorised.remove(payment_id).await {
            Some(amount) => {
                tracing::info!(%payment_id, amount = %amount.amount(), "simulated card payment captured");
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("payment {payment_id}"))),
        }
    }

    async fn refund(&self, payment_id: &str) -> Result<()> {
        tracing::warn!(%payment_id, "simulated payment refunded");
        Ok(())
    }
}
