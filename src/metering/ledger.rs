use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::models::{Account, AccountId, CounterKey};
use super::resolver::{EffectiveEntitlement, EntitlementError, EntitlementResolver};
use super::store::{MeteringStore, ReserveOutcome, StoreError};
use crate::plans::{Limit, ResourceKind};

/// Expected, user-facing refusal: the request does not fit the remaining allowance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("quota exceeded for {resource}: requested {requested}, short by {shortfall}")]
pub struct QuotaExceeded {
    pub resource: ResourceKind,
    pub requested: u64,
    pub limit: Limit,
    pub consumed: u64,
    pub pack_balance: u64,
    pub shortfall: u64,
}

#[derive(Debug, Error)]
pub enum ReserveError {
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaExceeded),
    #[error(transparent)]
    Entitlement(#[from] EntitlementError),
}

impl From<StoreError> for ReserveError {
    fn from(err: StoreError) -> Self {
        ReserveError::Entitlement(EntitlementError::Unavailable(err))
    }
}

/// key: usage-ledger -> per-period consumption counters
#[derive(Clone)]
pub struct UsageLedger {
    store: Arc<dyn MeteringStore>,
    resolver: EntitlementResolver,
}

impl UsageLedger {
    pub fn new(store: Arc<dyn MeteringStore>, resolver: EntitlementResolver) -> Self {
        Self { store, resolver }
    }

    pub fn resolver(&self) -> &EntitlementResolver {
        &self.resolver
    }

    pub async fn current(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.store
            .usage(&CounterKey::new(account_id, resource, now))
            .await
    }

    /// Resolves the account's allowance, then reserves against it.
    pub async fn reserve(
        &self,
        account: &Account,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, ReserveError> {
        let entitlement = self.resolver.resolve(account, now).await?;
        self.reserve_within(&entitlement, resource, amount, now)
            .await
    }

    /// Atomic check-and-increment against an already resolved entitlement.
    /// Leaves the counter untouched on refusal.
    pub async fn reserve_within(
        &self,
        entitlement: &EffectiveEntitlement,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<u64, ReserveError> {
        let limit = if entitlement.bypass {
            Limit::Unlimited
        } else {
            entitlement.plan.limit(resource)
        };
        let key = CounterKey::new(entitlement.account_id, resource, now);

        match self
            .store
            .reserve_usage(&key, amount, limit.ceiling())
            .await?
        {
            ReserveOutcome::Committed { consumed } => {
                tracing::debug!(
                    account_id = entitlement.account_id,
                    %resource,
                    amount,
                    consumed,
                    period = %key.period_key,
                    "usage reserved"
                );
                Ok(consumed)
            }
            ReserveOutcome::Exceeded { consumed } => {
                let available = limit.remaining(consumed).unwrap_or(u64::MAX);
                Err(QuotaExceeded {
                    resource,
                    requested: amount,
                    limit,
                    consumed,
                    pack_balance: 0,
                    shortfall: amount.saturating_sub(available),
                }
                .into())
            }
        }
    }

    /// Compensates a reservation against the period it was charged to. Floors at zero.
    pub async fn release(&self, key: &CounterKey, amount: u64) -> Result<u64, StoreError> {
        let consumed = self.store.release_usage(key, amount).await?;
        tracing::debug!(
            account_id = key.account_id,
            resource = %key.resource,
            amount,
            consumed,
            period = %key.period_key,
            "usage released"
        );
        Ok(consumed)
    }
}
