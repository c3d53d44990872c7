use async_trait::async_trait;
use thiserror::Error;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    AccountId, CounterKey, CreditPack, PermitRecord, PlanChange, Subscription,
    SubscriptionStatus,
};
use crate::plans::{PlanTier, ResourceKind};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("stored value out of range: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of a conditional counter increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Committed { consumed: u64 },
    Exceeded { consumed: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanChangeOutcome {
    Created(Subscription),
    Changed {
        previous: PlanTier,
        subscription: Subscription,
    },
    NoLiveSubscription,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        previous: SubscriptionStatus,
        subscription: Subscription,
    },
    /// Current status when the move is not allowed from it, `None` without a subscription.
    Refused(Option<SubscriptionStatus>),
}

/// What releasing a permit gave back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PermitRelease {
    pub released: u64,
    /// New counter value when the allowance was credited back.
    pub consumed: Option<u64>,
    /// Credits returned to packs.
    pub refunded: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    Claimed,
    AlreadyProcessed,
}

/// key: metering-store -> sole writer of subscriptions, counters, packs, permits and event ids
///
/// Every mutating method is atomic on its own. `reserve_usage` must be
/// linearizable per counter key, `draw_credit_packs` per (account, resource)
/// pair, and subscription changes per account. An account has at most one
/// subscription that is not canceled.
#[async_trait]
pub trait MeteringStore: Send + Sync {
    /// Most recently created subscription for the account, in any status.
    async fn current_subscription(
        &self,
        account_id: AccountId,
    ) -> Result<Option<Subscription>, StoreError>;

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError>;

    /// Writes `change` onto the live subscription in one step. With
    /// `open_if_missing` an account without one gets a new row instead.
    async fn change_plan(
        &self,
        change: &PlanChange,
        open_if_missing: bool,
        at: DateTime<Utc>,
    ) -> Result<PlanChangeOutcome, StoreError>;

    /// Moves the current subscription to `to` only while its status is one of `from`.
    async fn transition_subscription(
        &self,
        account_id: AccountId,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Consumed amount for the key, zero when no row exists yet.
    async fn usage(&self, key: &CounterKey) -> Result<u64, StoreError>;

    /// Adds `amount` only if the result stays within `ceiling` (`None` is unlimited).
    async fn reserve_usage(
        &self,
        key: &CounterKey,
        amount: u64,
        ceiling: Option<u64>,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Subtracts `amount`, floored at zero. Returns the new consumed amount.
    async fn release_usage(&self, key: &CounterKey, amount: u64) -> Result<u64, StoreError>;

    /// Packs for the resource ordered oldest purchase first.
    async fn credit_packs(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
    ) -> Result<Vec<CreditPack>, StoreError>;

    /// Returns `false` when a pack with the same source transaction id exists.
    async fn insert_credit_pack(&self, pack: &CreditPack) -> Result<bool, StoreError>;

    /// Draws `amount` across packs oldest first, all or nothing. Returns the
    /// remaining pack balance on success and `None` when the packs cannot cover it.
    async fn draw_credit_packs(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<Option<u64>, StoreError>;

    /// Returns credits to packs newest first, never above what each pack granted.
    /// Returns how many credits were refunded.
    async fn refund_credit_packs(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<u64, StoreError>;

    async fn insert_permit(&self, permit: &PermitRecord) -> Result<(), StoreError>;

    async fn permit(&self, permit_id: Uuid) -> Result<Option<PermitRecord>, StoreError>;

    /// Marks an unreleased permit of `account_id` released and, in the same
    /// step, returns up to `amount` (capped at the permit's amount) to the
    /// counter period or packs it was drawn from. `None` when there is no such
    /// unreleased permit.
    async fn release_permit(
        &self,
        permit_id: Uuid,
        account_id: AccountId,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<PermitRelease>, StoreError>;

    /// Claims a provider event id for processing. A stale in-flight claim can be
    /// taken over; a completed one cannot.
    async fn claim_event(&self, event_id: &str, event_type: &str)
        -> Result<EventClaim, StoreError>;

    async fn complete_event(&self, event_id: &str, outcome: &str) -> Result<(), StoreError>;

    /// Drops a claim whose processing failed so a redelivery can retry it.
    async fn abandon_event(&self, event_id: &str) -> Result<(), StoreError>;
}

pub(crate) fn pack_balance(packs: &[CreditPack]) -> u64 {
    packs
        .iter()
        .fold(0u64, |total, pack| total.saturating_add(pack.credits_remaining))
}
