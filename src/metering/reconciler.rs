use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::ledger::{ReserveError, UsageLedger};
use super::models::{Account, AccountId, CreditPack, Source};
use super::resolver::EffectiveEntitlement;
use super::store::{MeteringStore, StoreError};
use crate::plans::ResourceKind;

/// Replay of an already applied purchase. Callers treat this as a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("purchase `{source_transaction_id}` was already applied")]
pub struct DuplicatePurchase {
    pub source_transaction_id: String,
}

#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error(transparent)]
    Duplicate(#[from] DuplicatePurchase),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a successful metered draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Consumption {
    pub source: Source,
    /// Units still available in the source that was drawn; `None` when unlimited.
    pub remaining: Option<u64>,
}

/// key: credit-pack-reconciler -> subscription allowance first, then packs
#[derive(Clone)]
pub struct CreditPackReconciler {
    store: Arc<dyn MeteringStore>,
    ledger: UsageLedger,
}

impl CreditPackReconciler {
    pub fn new(store: Arc<dyn MeteringStore>, ledger: UsageLedger) -> Self {
        Self { store, ledger }
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn MeteringStore> {
        &self.store
    }

    pub async fn consume_with_fallback(
        &self,
        account: &Account,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Consumption, ReserveError> {
        let entitlement = self.ledger.resolver().resolve(account, now).await?;
        self.consume_within(&entitlement, resource, amount, now)
            .await
    }

    /// All or nothing: the full amount comes from the allowance or from packs,
    /// never split between them.
    pub async fn consume_within(
        &self,
        entitlement: &EffectiveEntitlement,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Consumption, ReserveError> {
        let exceeded = match self
            .ledger
            .reserve_within(entitlement, resource, amount, now)
            .await
        {
            Ok(consumed) => {
                return Ok(Consumption {
                    source: Source::SubscriptionAllowance,
                    remaining: entitlement.plan.limit(resource).remaining(consumed),
                })
            }
            Err(ReserveError::QuotaExceeded(exceeded)) => exceeded,
            Err(err) => return Err(err),
        };

        let account_id = entitlement.account_id;
        if let Some(balance) = self
            .store
            .draw_credit_packs(account_id, resource, amount)
            .await?
        {
            tracing::info!(
                account_id,
                %resource,
                amount,
                pack_balance = balance,
                "allowance exhausted, drew from credit packs"
            );
            return Ok(Consumption {
                source: Source::CreditPack,
                remaining: Some(balance),
            });
        }

        let pack_balance = self.balance(account_id, resource).await?;
        let allowance = exceeded.limit.remaining(exceeded.consumed).unwrap_or(0);
        Err(ReserveError::QuotaExceeded(super::ledger::QuotaExceeded {
            pack_balance,
            shortfall: amount.saturating_sub(allowance.max(pack_balance)),
            ..exceeded
        }))
    }

    /// Idempotent by `source_transaction_id`.
    pub async fn apply_purchase(
        &self,
        source_transaction_id: &str,
        account_id: AccountId,
        resource: ResourceKind,
        credits: u64,
        purchased_at: DateTime<Utc>,
    ) -> Result<CreditPack, PurchaseError> {
        let pack = CreditPack {
            id: Uuid::new_v4(),
            account_id,
            resource,
            credits_granted: credits,
            credits_remaining: credits,
            purchased_at,
            source_transaction_id: source_transaction_id.to_string(),
        };

        if !self.store.insert_credit_pack(&pack).await? {
            return Err(DuplicatePurchase {
                source_transaction_id: source_transaction_id.to_string(),
            }
            .into());
        }
        tracing::info!(
            account_id,
            %resource,
            credits,
            transaction = source_transaction_id,
            "credit pack applied"
        );
        Ok(pack)
    }

    pub async fn balance(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
    ) -> Result<u64, StoreError> {
        let packs = self.store.credit_packs(account_id, resource).await?;
        Ok(super::store::pack_balance(&packs))
    }

    /// Returns credits drawn by a permit whose action failed.
    pub async fn refund(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<u64, StoreError> {
        self.store
            .refund_credit_packs(account_id, resource, amount)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::ledger::QuotaExceeded;
    use crate::metering::memory::MemoryMeteringStore;
    use crate::metering::resolver::EntitlementResolver;
    use crate::plans::PlanCatalog;
    use std::time::Duration;

    fn reconciler() -> (Arc<MemoryMeteringStore>, CreditPackReconciler) {
        let store = Arc::new(MemoryMeteringStore::new());
        let resolver = EntitlementResolver::new(
            store.clone(),
            Arc::new(PlanCatalog::default()),
            Duration::ZERO,
        );
        let ledger = UsageLedger::new(store.clone(), resolver);
        (store.clone(), CreditPackReconciler::new(store, ledger))
    }

    #[tokio::test]
    async fn allowance_is_used_before_packs() {
        let (_, reconciler) = reconciler();
        let now = Utc::now();
        reconciler
            .apply_purchase("txn_1", 1, ResourceKind::Search, 10, now)
            .await
            .unwrap();

        let consumption = reconciler
            .consume_with_fallback(&Account::member(1), ResourceKind::Search, 5, now)
            .await
            .unwrap();
        assert_eq!(consumption.source, Source::SubscriptionAllowance);
        assert_eq!(consumption.remaining, Some(0));

        let consumption = reconciler
            .consume_with_fallback(&Account::member(1), ResourceKind::Search, 4, now)
            .await
            .unwrap();
        assert_eq!(consumption.source, Source::CreditPack);
        assert_eq!(consumption.remaining, Some(6));
    }

    #[tokio::test]
    async fn insufficient_sources_consume_nothing() {
        let (store, reconciler) = reconciler();
        let account = Account::member(1);
        let now = Utc::now();
        // Free allows 5 searches a day; leave 3 of them.
        reconciler
            .ledger()
            .reserve(&account, ResourceKind::Search, 2, now)
            .await
            .unwrap();
        reconciler
            .apply_purchase("txn_small", 1, ResourceKind::Search, 1, now)
            .await
            .unwrap();

        let err = reconciler
            .consume_with_fallback(&account, ResourceKind::Search, 5, now)
            .await
            .unwrap_err();
        match err {
            ReserveError::QuotaExceeded(QuotaExceeded {
                pack_balance,
                shortfall,
                consumed,
                ..
            }) => {
                assert_eq!(pack_balance, 1);
                assert_eq!(consumed, 2);
                assert_eq!(shortfall, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(
            reconciler.ledger().current(1, ResourceKind::Search, now).await.unwrap(),
            2
        );
        assert_eq!(store.pack_balance(1, ResourceKind::Search).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn replayed_purchase_does_not_double_credit() {
        let (_, reconciler) = reconciler();
        let now = Utc::now();
        reconciler
            .apply_purchase("txn_dup", 4, ResourceKind::Verification, 500, now)
            .await
            .unwrap();
        let replay = reconciler
            .apply_purchase("txn_dup", 4, ResourceKind::Verification, 500, now)
            .await;
        assert!(matches!(replay, Err(PurchaseError::Duplicate(_))));
        assert_eq!(
            reconciler.balance(4, ResourceKind::Verification).await.unwrap(),
            500
        );
    }

    #[tokio::test]
    async fn packs_drain_in_purchase_order_across_packs() {
        let (store, reconciler) = reconciler();
        let account = Account::member(2);
        let now = Utc::now();
        reconciler
            .apply_purchase("older", 2, ResourceKind::Search, 2, now - chrono::Duration::days(3))
            .await
            .unwrap();
        reconciler
            .apply_purchase("newer", 2, ResourceKind::Search, 4, now)
            .await
            .unwrap();
        reconciler
            .ledger()
            .reserve(&account, ResourceKind::Search, 5, now)
            .await
            .unwrap();

        reconciler
            .consume_with_fallback(&account, ResourceKind::Search, 3, now)
            .await
            .unwrap();
        let packs = store.credit_packs(2, ResourceKind::Search).await.unwrap();
        assert_eq!(packs[0].source_transaction_id, "older");
        assert_eq!(packs[0].credits_remaining, 0);
        assert_eq!(packs[1].credits_remaining, 3);
    }
}
