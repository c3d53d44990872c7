use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use super::models::{Account, AccountId, Subscription, SubscriptionStatus};
use super::store::{MeteringStore, StoreError};
use crate::plans::{CapabilityFlags, PlanCatalog, PlanLimits, PlanTier, UnknownTierError};

#[derive(Debug, Error)]
pub enum EntitlementError {
    #[error("entitlement unavailable: {0}")]
    Unavailable(#[from] StoreError),
    #[error(transparent)]
    UnknownTier(#[from] UnknownTierError),
}

/// What an account may do right now.
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveEntitlement {
    pub account_id: AccountId,
    pub tier: PlanTier,
    pub plan: PlanLimits,
    /// Quota enforcement is skipped entirely for owner/admin accounts.
    pub bypass: bool,
    pub subscription_status: Option<SubscriptionStatus>,
    /// Tier the account is subscribed to, even when that subscription no longer entitles.
    pub subscribed_tier: Option<PlanTier>,
}

impl EffectiveEntitlement {
    /// Tier whose limits the subscription would grant once billing is back in good standing.
    pub fn lapsed_tier(&self) -> Option<PlanTier> {
        match (self.subscription_status, self.subscribed_tier) {
            (Some(SubscriptionStatus::Active), _) => None,
            (Some(_), Some(tier)) if tier != self.tier => Some(tier),
            _ => None,
        }
    }
}

/// Entry count past which an insert first drops every expired entry.
const CACHE_SWEEP_AT: usize = 1024;

#[derive(Debug, Clone)]
struct CachedSubscription {
    fetched_at: Instant,
    subscription: Option<Subscription>,
}

/// key: entitlement-resolver -> account to effective plan
///
/// Subscription lookups are cached per account for at most `ttl`; billing
/// intake invalidates an account's entry after applying an event. Expired
/// entries are dropped when read and swept once the map grows large.
#[derive(Clone)]
pub struct EntitlementResolver {
    store: Arc<dyn MeteringStore>,
    catalog: Arc<PlanCatalog>,
    cache: Arc<DashMap<AccountId, CachedSubscription>>,
    ttl: Duration,
}

impl EntitlementResolver {
    pub fn new(store: Arc<dyn MeteringStore>, catalog: Arc<PlanCatalog>, ttl: Duration) -> Self {
        Self {
            store,
            catalog,
            cache: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub async fn resolve(
        &self,
        account: &Account,
        now: DateTime<Utc>,
    ) -> Result<EffectiveEntitlement, EntitlementError> {
        if account.is_owner {
            let mut plan = self.catalog.get_plan(PlanTier::highest())?.clone();
            plan.capabilities = CapabilityFlags::all();
            return Ok(EffectiveEntitlement {
                account_id: account.id,
                tier: plan.tier,
                plan,
                bypass: true,
                subscription_status: None,
                subscribed_tier: None,
            });
        }

        let subscription = self.subscription(account.id).await?;
        let tier = match &subscription {
            Some(subscription) if subscription.is_entitling(now) => subscription.tier,
            _ => PlanTier::Free,
        };
        let plan = self.catalog.get_plan(tier)?.clone();

        Ok(EffectiveEntitlement {
            account_id: account.id,
            tier,
            plan,
            bypass: false,
            subscription_status: subscription.as_ref().map(|s| s.status),
            subscribed_tier: subscription.as_ref().map(|s| s.tier),
        })
    }

    pub fn invalidate(&self, account_id: AccountId) {
        self.cache.remove(&account_id);
    }

    async fn subscription(
        &self,
        account_id: AccountId,
    ) -> Result<Option<Subscription>, StoreError> {
        if self.ttl.is_zero() {
            return self.store.current_subscription(account_id).await;
        }

        if let Some(entry) = self.cache.get(&account_id) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.subscription.clone());
            }
        }
        let ttl = self.ttl;
        self.cache
            .remove_if(&account_id, |_, entry| entry.fetched_at.elapsed() >= ttl);

        let subscription = self.store.current_subscription(account_id).await?;
        if self.cache.len() >= CACHE_SWEEP_AT {
            self.cache.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
        }
        self.cache.insert(
            account_id,
            CachedSubscription {
                fetched_at: Instant::now(),
                subscription: subscription.clone(),
            },
        );
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::memory::MemoryMeteringStore;
    use crate::plans::{Limit, ResourceKind};
    use uuid::Uuid;

    fn subscription(
        account_id: AccountId,
        tier: PlanTier,
        status: SubscriptionStatus,
    ) -> Subscription {
        let now = Utc::now();
        Subscription {
            id: Uuid::new_v4(),
            account_id,
            tier,
            status,
            trial_ends_at: None,
            current_period_start: now,
            current_period_end: None,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn resolver(store: Arc<MemoryMeteringStore>, ttl: Duration) -> EntitlementResolver {
        EntitlementResolver::new(store, Arc::new(PlanCatalog::default()), ttl)
    }

    #[tokio::test]
    async fn accounts_without_subscription_get_free() {
        let store = Arc::new(MemoryMeteringStore::new());
        let entitlement = resolver(store, Duration::ZERO)
            .resolve(&Account::member(7), Utc::now())
            .await
            .unwrap();
        assert_eq!(entitlement.tier, PlanTier::Free);
        assert!(!entitlement.bypass);
        assert_eq!(entitlement.subscription_status, None);
    }

    #[tokio::test]
    async fn owners_get_highest_tier_regardless_of_storage() {
        let store = Arc::new(MemoryMeteringStore::new());
        store.set_unavailable(true);
        let entitlement = resolver(store, Duration::ZERO)
            .resolve(&Account::owner(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(entitlement.tier, PlanTier::Autopilot);
        assert!(entitlement.bypass);
        assert!(entitlement.plan.capabilities.automation);
    }

    #[tokio::test]
    async fn past_due_degrades_to_free_limits() {
        let store = Arc::new(MemoryMeteringStore::new());
        store
            .insert_subscription(&subscription(3, PlanTier::Pro, SubscriptionStatus::PastDue))
            .await
            .unwrap();
        let entitlement = resolver(store, Duration::ZERO)
            .resolve(&Account::member(3), Utc::now())
            .await
            .unwrap();
        assert_eq!(entitlement.tier, PlanTier::Free);
        assert_eq!(entitlement.plan.limit(ResourceKind::Search), Limit::Limited(5));
        assert_eq!(entitlement.lapsed_tier(), Some(PlanTier::Pro));
    }

    #[tokio::test]
    async fn storage_failure_is_unavailable_not_free() {
        let store = Arc::new(MemoryMeteringStore::new());
        store.set_unavailable(true);
        let err = resolver(store, Duration::ZERO)
            .resolve(&Account::member(3), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EntitlementError::Unavailable(_)));
    }

    #[tokio::test]
    async fn cache_serves_until_invalidated() {
        let store = Arc::new(MemoryMeteringStore::new());
        let resolver = resolver(store.clone(), Duration::from_secs(60));
        let account = Account::member(9);
        assert_eq!(
            resolver.resolve(&account, Utc::now()).await.unwrap().tier,
            PlanTier::Free
        );

        store
            .insert_subscription(&subscription(9, PlanTier::Basic, SubscriptionStatus::Active))
            .await
            .unwrap();
        assert_eq!(
            resolver.resolve(&account, Utc::now()).await.unwrap().tier,
            PlanTier::Free
        );

        resolver.invalidate(9);
        assert_eq!(
            resolver.resolve(&account, Utc::now()).await.unwrap().tier,
            PlanTier::Basic
        );
    }

    #[tokio::test]
    async fn expired_entries_do_not_accumulate() {
        let store = Arc::new(MemoryMeteringStore::new());
        let resolver = resolver(store, Duration::from_millis(20));
        let now = Utc::now();

        resolver.resolve(&Account::member(1), now).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let entry = resolver.cache.get(&1).map(|entry| entry.fetched_at);
        resolver.resolve(&Account::member(1), now).await.unwrap();
        assert_ne!(resolver.cache.get(&1).map(|entry| entry.fetched_at), entry);

        for account_id in 0..CACHE_SWEEP_AT as AccountId {
            resolver.resolve(&Account::member(account_id), now).await.unwrap();
        }
        assert_eq!(resolver.cache.len(), CACHE_SWEEP_AT);
        tokio::time::sleep(Duration::from_millis(40)).await;
        resolver.resolve(&Account::member(-1), now).await.unwrap();
        assert_eq!(resolver.cache.len(), 1);
    }
}
