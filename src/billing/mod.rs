//! Billing-provider webhook intake: signature check, event parsing and the
//! subscription state machine.

pub mod api;
pub mod events;
pub mod intake;
pub mod signature;

pub use api::billing_webhook;
pub use events::{BillingCommand, BillingEvent, EventKind};
pub use intake::{BillingIntake, WebhookError, WebhookOutcome};
