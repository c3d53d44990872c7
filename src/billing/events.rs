use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::intake::WebhookError;
use crate::metering::AccountId;
use crate::plans::PlanTier;

/// key: billing-event -> provider envelope as delivered to the webhook
#[derive(Debug, Clone, Deserialize)]
pub struct BillingEvent {
    pub provider_event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    SubscriptionUpdated,
    PaymentFailed,
    PaymentRecovered,
    SubscriptionCanceled,
    PurchaseCompleted,
}

impl EventKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "checkout.completed" => Some(EventKind::CheckoutCompleted),
            "subscription.updated" => Some(EventKind::SubscriptionUpdated),
            "payment.failed" => Some(EventKind::PaymentFailed),
            "payment.recovered" => Some(EventKind::PaymentRecovered),
            "subscription.canceled" => Some(EventKind::SubscriptionCanceled),
            "purchase.completed" => Some(EventKind::PurchaseCompleted),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CheckoutCompleted => "checkout.completed",
            EventKind::SubscriptionUpdated => "subscription.updated",
            EventKind::PaymentFailed => "payment.failed",
            EventKind::PaymentRecovered => "payment.recovered",
            EventKind::SubscriptionCanceled => "subscription.canceled",
            EventKind::PurchaseCompleted => "purchase.completed",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawPlanPayload {
    account_id: AccountId,
    tier: String,
    #[serde(default)]
    current_period_start: Option<DateTime<Utc>>,
    #[serde(default)]
    current_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    trial_ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanPayload {
    pub account_id: AccountId,
    pub tier: PlanTier,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountPayload {
    pub account_id: AccountId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PurchasePayload {
    pub account_id: AccountId,
    pub package_id: String,
    /// Falls back to the provider event id when the provider sends none.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// Validated form of an event, produced before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingCommand {
    Checkout(PlanPayload),
    PlanChanged(PlanPayload),
    PaymentFailed(AccountPayload),
    PaymentRecovered(AccountPayload),
    Canceled(AccountPayload),
    Purchase(PurchasePayload),
    Unsupported(String),
}

impl BillingCommand {
    pub fn account_id(&self) -> Option<AccountId> {
        match self {
            BillingCommand::Checkout(payload) | BillingCommand::PlanChanged(payload) => {
                Some(payload.account_id)
            }
            BillingCommand::PaymentFailed(payload)
            | BillingCommand::PaymentRecovered(payload)
            | BillingCommand::Canceled(payload) => Some(payload.account_id),
            BillingCommand::Purchase(payload) => Some(payload.account_id),
            BillingCommand::Unsupported(_) => None,
        }
    }
}

impl BillingEvent {
    pub fn from_slice(body: &[u8]) -> Result<Self, WebhookError> {
        let event: BillingEvent = serde_json::from_slice(body)
            .map_err(|err| WebhookError::Malformed(err.to_string()))?;
        if event.provider_event_id.trim().is_empty() {
            return Err(WebhookError::Malformed("provider_event_id is empty".into()));
        }
        Ok(event)
    }

    pub fn command(&self) -> Result<BillingCommand, WebhookError> {
        let Some(kind) = EventKind::parse(&self.event_type) else {
            return Ok(BillingCommand::Unsupported(self.event_type.clone()));
        };

        Ok(match kind {
            EventKind::CheckoutCompleted => BillingCommand::Checkout(self.plan_payload()?),
            EventKind::SubscriptionUpdated => BillingCommand::PlanChanged(self.plan_payload()?),
            EventKind::PaymentFailed => BillingCommand::PaymentFailed(self.payload()?),
            EventKind::PaymentRecovered => BillingCommand::PaymentRecovered(self.payload()?),
            EventKind::SubscriptionCanceled => BillingCommand::Canceled(self.payload()?),
            EventKind::PurchaseCompleted => {
                let mut purchase: PurchasePayload = self.payload()?;
                if purchase.transaction_id.is_none() {
                    purchase.transaction_id = Some(self.provider_event_id.clone());
                }
                BillingCommand::Purchase(purchase)
            }
        })
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T, WebhookError> {
        T::deserialize(&self.payload).map_err(|err| {
            WebhookError::Malformed(format!("{} payload: {err}", self.event_type))
        })
    }

    fn plan_payload(&self) -> Result<PlanPayload, WebhookError> {
        let raw: RawPlanPayload = self.payload()?;
        let tier = raw
            .tier
            .parse::<PlanTier>()
            .map_err(|err| WebhookError::Malformed(err.to_string()))?;
        Ok(PlanPayload {
            account_id: raw.account_id,
            tier,
            current_period_start: raw.current_period_start,
            current_period_end: raw.current_period_end,
            trial_ends_at: raw.trial_ends_at,
        })
    }
}
