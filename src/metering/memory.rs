use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{
    AccountId, CounterKey, CreditPack, PermitRecord, PlanChange, Source, Subscription,
    SubscriptionStatus,
};
use super::store::{
    pack_balance, EventClaim, MeteringStore, PermitRelease, PlanChangeOutcome, ReserveOutcome,
    StoreError, TransitionOutcome,
};
use crate::plans::ResourceKind;

fn stale_claim_after() -> chrono::Duration {
    chrono::Duration::minutes(5)
}

#[derive(Debug, Clone)]
struct EventRecord {
    completed: bool,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemoryState {
    subscriptions: Vec<Subscription>,
    counters: HashMap<CounterKey, u64>,
    packs: Vec<CreditPack>,
    permits: HashMap<Uuid, PermitRecord>,
    events: HashMap<String, EventRecord>,
}

impl MemoryState {
    fn release_counter(&mut self, key: &CounterKey, amount: u64) -> u64 {
        let Some(consumed) = self.counters.get_mut(key) else {
            return 0;
        };
        *consumed = consumed.saturating_sub(amount);
        *consumed
    }

    fn refund_packs(&mut self, account_id: AccountId, resource: ResourceKind, amount: u64) -> u64 {
        let mut outstanding = amount;
        for index in sorted_pack_indexes(self, account_id, resource).into_iter().rev() {
            if outstanding == 0 {
                break;
            }
            let pack = &mut self.packs[index];
            let room = pack.credits_granted.saturating_sub(pack.credits_remaining);
            let refunded = room.min(outstanding);
            pack.credits_remaining += refunded;
            outstanding -= refunded;
        }
        amount - outstanding
    }
}

/// key: metering-store-memory -> mutex-serialized store for tests and local runs
///
/// A single lock serializes every operation, which makes each method trivially
/// linearizable. `set_unavailable` and `set_latency` simulate storage outages.
#[derive(Debug, Default)]
pub struct MemoryMeteringStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
}

impl MemoryMeteringStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(millis, Ordering::SeqCst);
    }

    async fn enter(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

fn sorted_pack_indexes(
    state: &MemoryState,
    account_id: AccountId,
    resource: ResourceKind,
) -> Vec<usize> {
    let mut indexes: Vec<usize> = state
        .packs
        .iter()
        .enumerate()
        .filter(|(_, pack)| pack.account_id == account_id && pack.resource == resource)
        .map(|(index, _)| index)
        .collect();
    indexes.sort_by_key(|index| (state.packs[*index].purchased_at, *index));
    indexes
}

#[async_trait]
impl MeteringStore for MemoryMeteringStore {
    async fn current_subscription(
        &self,
        account_id: AccountId,
    ) -> Result<Option<Subscription>, StoreError> {
        let state = self.enter().await?;
        Ok(state
            .subscriptions
            .iter()
            .filter(|subscription| subscription.account_id == account_id)
            .max_by_key(|subscription| subscription.created_at)
            .cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        let mut state = self.enter().await?;
        state.subscriptions.push(subscription.clone());
        Ok(())
    }

    async fn change_plan(
        &self,
        change: &PlanChange,
        open_if_missing: bool,
        at: DateTime<Utc>,
    ) -> Result<PlanChangeOutcome, StoreError> {
        let mut state = self.enter().await?;
        let live = state
            .subscriptions
            .iter_mut()
            .filter(|s| s.account_id == change.account_id && s.status.is_live())
            .max_by_key(|s| s.created_at);

        if let Some(subscription) = live {
            let previous = subscription.tier;
            change.apply_to(subscription, at);
            return Ok(PlanChangeOutcome::Changed {
                previous,
                subscription: subscription.clone(),
            });
        }
        if !open_if_missing {
            return Ok(PlanChangeOutcome::NoLiveSubscription);
        }
        let subscription = change.open(at);
        state.subscriptions.push(subscription.clone());
        Ok(PlanChangeOutcome::Created(subscription))
    }

    async fn transition_subscription(
        &self,
        account_id: AccountId,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut state = self.enter().await?;
        let current = state
            .subscriptions
            .iter_mut()
            .filter(|s| s.account_id == account_id)
            .max_by_key(|s| s.created_at);

        match current {
            Some(subscription) if from.contains(&subscription.status) => {
                let previous = subscription.status;
                subscription.move_to(to, at);
                Ok(TransitionOutcome::Applied {
                    previous,
                    subscription: subscription.clone(),
                })
            }
            Some(subscription) => Ok(TransitionOutcome::Refused(Some(subscription.status))),
            None => Ok(TransitionOutcome::Refused(None)),
        }
    }

    async fn usage(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let state = self.enter().await?;
        Ok(state.counters.get(key).copied().unwrap_or(0))
    }

    async fn reserve_usage(
        &self,
        key: &CounterKey,
        amount: u64,
        ceiling: Option<u64>,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut state = self.enter().await?;
        let consumed = state.counters.get(key).copied().unwrap_or(0);
        let next = match consumed.checked_add(amount) {
            Some(next) if ceiling.map(|limit| next <= limit).unwrap_or(true) => next,
            _ => return Ok(ReserveOutcome::Exceeded { consumed }),
        };
        state.counters.insert(key.clone(), next);
        Ok(ReserveOutcome::Committed { consumed: next })
    }

    async fn release_usage(&self, key: &CounterKey, amount: u64) -> Result<u64, StoreError> {
        let mut state = self.enter().await?;
        Ok(state.release_counter(key, amount))
    }

    async fn credit_packs(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
    ) -> Result<Vec<CreditPack>, StoreError> {
        let state = self.enter().await?;
        Ok(sorted_pack_indexes(&state, account_id, resource)
            .into_iter()
            .map(|index| state.packs[index].clone())
            .collect())
    }

    async fn insert_credit_pack(&self, pack: &CreditPack) -> Result<bool, StoreError> {
        let mut state = self.enter().await?;
        if state
            .packs
            .iter()
            .any(|existing| existing.source_transaction_id == pack.source_transaction_id)
        {
            return Ok(false);
        }
        state.packs.push(pack.clone());
        Ok(true)
    }

    async fn draw_credit_packs(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<Option<u64>, StoreError> {
        let mut state = self.enter().await?;
        let indexes = sorted_pack_indexes(&state, account_id, resource);
        let balance = indexes
            .iter()
            .fold(0u64, |total, index| {
                total.saturating_add(state.packs[*index].credits_remaining)
            });
        if balance < amount {
            return Ok(None);
        }

        let mut outstanding = amount;
        for index in indexes {
            if outstanding == 0 {
                break;
            }
            let pack = &mut state.packs[index];
            let drawn = pack.credits_remaining.min(outstanding);
            pack.credits_remaining -= drawn;
            outstanding -= drawn;
        }
        Ok(Some(balance - amount))
    }

    async fn refund_credit_packs(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<u64, StoreError> {
        let mut state = self.enter().await?;
        Ok(state.refund_packs(account_id, resource, amount))
    }

    async fn insert_permit(&self, permit: &PermitRecord) -> Result<(), StoreError> {
        let mut state = self.enter().await?;
        state.permits.insert(permit.id, permit.clone());
        Ok(())
    }

    async fn permit(&self, permit_id: Uuid) -> Result<Option<PermitRecord>, StoreError> {
        let state = self.enter().await?;
        Ok(state.permits.get(&permit_id).cloned())
    }

    async fn release_permit(
        &self,
        permit_id: Uuid,
        account_id: AccountId,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<PermitRelease>, StoreError> {
        let mut state = self.enter().await?;
        let permit = match state.permits.get_mut(&permit_id) {
            Some(permit) if permit.account_id == account_id && permit.released_at.is_none() => {
                permit.released_at = Some(at);
                permit.clone()
            }
            _ => return Ok(None),
        };

        let released = amount.min(permit.amount);
        let release = match permit.source {
            Source::SubscriptionAllowance => PermitRelease {
                released,
                consumed: Some(state.release_counter(&permit.counter_key(), released)),
                refunded: None,
            },
            Source::CreditPack => PermitRelease {
                released,
                consumed: None,
                refunded: Some(state.refund_packs(account_id, permit.resource, released)),
            },
            Source::OwnerBypass => PermitRelease::default(),
        };
        Ok(Some(release))
    }

    async fn claim_event(
        &self,
        event_id: &str,
        _event_type: &str,
    ) -> Result<EventClaim, StoreError> {
        let mut state = self.enter().await?;
        let now = Utc::now();
        match state.events.get(event_id) {
            Some(record) if record.completed => return Ok(EventClaim::AlreadyProcessed),
            Some(record) if record.claimed_at + stale_claim_after() > now => {
                return Ok(EventClaim::AlreadyProcessed)
            }
            _ => {}
        }
        state.events.insert(
            event_id.to_string(),
            EventRecord {
                completed: false,
                claimed_at: now,
            },
        );
        Ok(EventClaim::Claimed)
    }

    async fn complete_event(&self, event_id: &str, _outcome: &str) -> Result<(), StoreError> {
        let mut state = self.enter().await?;
        if let Some(record) = state.events.get_mut(event_id) {
            record.completed = true;
        }
        Ok(())
    }

    async fn abandon_event(&self, event_id: &str) -> Result<(), StoreError> {
        let mut state = self.enter().await?;
        state.events.remove(event_id);
        Ok(())
    }
}

impl MemoryMeteringStore {
    /// Total remaining pack credits, used by assertions in tests.
    pub async fn pack_balance(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
    ) -> Result<u64, StoreError> {
        let packs = self.credit_packs(account_id, resource).await?;
        Ok(pack_balance(&packs))
    }
}
