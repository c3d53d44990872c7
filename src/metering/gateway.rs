use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::ledger::{QuotaExceeded, ReserveError};
use super::models::{Account, AccountId, PeriodWindow, PermitRecord, Source, SubscriptionStatus};
use super::reconciler::{Consumption, CreditPackReconciler};
use super::resolver::{EffectiveEntitlement, EntitlementError};
use super::store::StoreError;
use crate::plans::{CapabilityFlags, Limit, PlanLimits, PlanTier, ResourceKind};

/// Why a metered action was refused. The code is the contract with the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    TierTooLow,
    QuotaExceeded,
    SubscriptionInactive,
    EntitlementUnavailable,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::TierTooLow => "tier_too_low",
            DenialReason::QuotaExceeded => "quota_exceeded",
            DenialReason::SubscriptionInactive => "subscription_inactive",
            DenialReason::EntitlementUnavailable => "entitlement_unavailable",
        }
    }
}

/// Single-use capability token for the action that immediately follows.
#[derive(Debug, Clone, Serialize)]
pub struct Permit {
    pub id: Uuid,
    pub account_id: AccountId,
    pub resource: ResourceKind,
    pub amount: u64,
    pub source: Source,
    pub remaining: Option<u64>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Denial {
    pub reason: DenialReason,
    pub remaining: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Permit(Permit),
    Denied(Denial),
}

impl Decision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, Decision::Permit(_))
    }

    pub fn reason(&self) -> Option<DenialReason> {
        match self {
            Decision::Permit(_) => None,
            Decision::Denied(denial) => Some(denial.reason),
        }
    }

    fn denied(reason: DenialReason) -> Self {
        Decision::Denied(Denial {
            reason,
            remaining: None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReleaseOutcome {
    pub permit_id: Uuid,
    pub source: Source,
    pub released: u64,
    /// New counter value when the allowance was credited back.
    pub consumed: Option<u64>,
    /// Credits returned to packs.
    pub refunded: Option<u64>,
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("no permit {0} for this account")]
    UnknownPermit(Uuid),
    #[error("permit {0} was already released")]
    AlreadyReleased(Uuid),
    #[error("permit was issued for {issued}, not {requested}")]
    ResourceMismatch {
        issued: ResourceKind,
        requested: ResourceKind,
    },
    #[error("permit covers {granted}, cannot release {requested}")]
    ExceedsPermit { granted: u64, requested: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub limit: Limit,
    pub used: u64,
    pub remaining: Option<u64>,
    pub credit_pack_balance: u64,
    pub period_key: String,
    pub resets_at: DateTime<Utc>,
}

/// Display payload for client-side gating. Carries no enforcement weight.
#[derive(Debug, Clone, Serialize)]
pub struct EntitlementSnapshot {
    pub account_id: AccountId,
    pub tier: PlanTier,
    pub bypass: bool,
    pub subscription_status: Option<SubscriptionStatus>,
    pub capabilities: CapabilityFlags,
    pub limits: BTreeMap<ResourceKind, Limit>,
    pub usage: BTreeMap<ResourceKind, ResourceUsage>,
}

/// key: quota-gateway -> the choke point for metered actions
///
/// Every lower-layer failure, including the timeout, becomes
/// `EntitlementUnavailable`; nothing is granted on ambiguity. A draw that
/// commits after the deadline is released again once it lands.
#[derive(Clone)]
pub struct QuotaGateway {
    reconciler: CreditPackReconciler,
    timeout: Duration,
}

impl QuotaGateway {
    pub fn new(reconciler: CreditPackReconciler, timeout: Duration) -> Self {
        Self {
            reconciler,
            timeout,
        }
    }

    pub fn reconciler(&self) -> &CreditPackReconciler {
        &self.reconciler
    }

    pub async fn authorize(
        &self,
        account: &Account,
        resource: ResourceKind,
        amount: u64,
    ) -> Decision {
        self.authorize_at(account, resource, amount, Utc::now()).await
    }

    pub async fn authorize_at(
        &self,
        account: &Account,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Decision {
        let decision = self.decide(account, resource, amount, now).await;

        match &decision {
            Decision::Permit(permit) => tracing::info!(
                account_id = account.id,
                %resource,
                amount,
                permit = %permit.id,
                source = ?permit.source,
                "metered action permitted"
            ),
            Decision::Denied(denial) => tracing::info!(
                account_id = account.id,
                %resource,
                amount,
                reason = denial.reason.as_str(),
                "metered action denied"
            ),
        }
        decision
    }

    async fn decide(
        &self,
        account: &Account,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Decision {
        let deadline = Instant::now() + self.timeout;
        let resolver = self.reconciler.ledger().resolver();
        let entitlement =
            match tokio::time::timeout_at(deadline, resolver.resolve(account, now)).await {
                Ok(Ok(entitlement)) => entitlement,
                Ok(Err(err)) => return unavailable(account.id, err),
                Err(_) => return self.timed_out(account.id, resource, amount),
            };

        if entitlement.bypass {
            return Decision::Permit(permit(
                &entitlement,
                resource,
                amount,
                Source::OwnerBypass,
                None,
                now,
            ));
        }

        if !entitlement.plan.permits(resource) {
            let reason = if self.lapsed_plan_allows(&entitlement, resource, |plan| {
                plan.permits(resource)
            }) {
                DenialReason::SubscriptionInactive
            } else {
                DenialReason::TierTooLow
            };
            return Decision::denied(reason);
        }

        // Detached so a commit that lands after the deadline is still observed.
        let gateway = self.clone();
        let mut draw =
            tokio::spawn(async move { gateway.consume(entitlement, resource, amount, now).await });
        let landed = tokio::time::timeout_at(deadline, &mut draw).await;
        match landed {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => {
                tracing::error!(account_id = account.id, %err, "metered draw task failed");
                Decision::denied(DenialReason::EntitlementUnavailable)
            }
            Err(_) => {
                self.release_when_landed(account.id, draw);
                self.timed_out(account.id, resource, amount)
            }
        }
    }

    async fn consume(
        &self,
        entitlement: EffectiveEntitlement,
        resource: ResourceKind,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Decision {
        match self
            .reconciler
            .consume_within(&entitlement, resource, amount, now)
            .await
        {
            Ok(consumption) => self.issue(&entitlement, resource, amount, consumption, now).await,
            Err(ReserveError::QuotaExceeded(exceeded)) => {
                let reason = if self.lapsed_plan_allows(&entitlement, resource, |plan| {
                    plan.limit(resource).allows(exceeded.consumed, amount)
                }) {
                    DenialReason::SubscriptionInactive
                } else {
                    DenialReason::QuotaExceeded
                };
                Decision::Denied(Denial {
                    reason,
                    remaining: Some(available(&exceeded)),
                })
            }
            Err(ReserveError::Entitlement(err)) => unavailable(entitlement.account_id, err),
        }
    }

    /// Records the permit so it can later be released against its own period and source.
    async fn issue(
        &self,
        entitlement: &EffectiveEntitlement,
        resource: ResourceKind,
        amount: u64,
        consumption: Consumption,
        now: DateTime<Utc>,
    ) -> Decision {
        let permit = permit(
            entitlement,
            resource,
            amount,
            consumption.source,
            consumption.remaining,
            now,
        );
        let record = PermitRecord {
            id: permit.id,
            account_id: permit.account_id,
            resource,
            amount,
            source: permit.source,
            period_key: PeriodWindow::for_resource(resource, now).key,
            issued_at: now,
            released_at: None,
        };

        if let Err(err) = self.reconciler.store().insert_permit(&record).await {
            tracing::error!(
                account_id = record.account_id,
                %resource,
                %err,
                "failed to record permit, undoing draw"
            );
            self.undo_draw(&record).await;
            return Decision::denied(DenialReason::EntitlementUnavailable);
        }
        Decision::Permit(permit)
    }

    async fn undo_draw(&self, record: &PermitRecord) {
        let undone = match record.source {
            Source::SubscriptionAllowance => self
                .reconciler
                .ledger()
                .release(&record.counter_key(), record.amount)
                .await
                .map(|_| ()),
            Source::CreditPack => self
                .reconciler
                .refund(record.account_id, record.resource, record.amount)
                .await
                .map(|_| ()),
            Source::OwnerBypass => Ok(()),
        };
        if let Err(err) = undone {
            tracing::error!(
                account_id = record.account_id,
                resource = %record.resource,
                amount = record.amount,
                %err,
                "failed to undo unrecorded draw"
            );
        }
    }

    fn release_when_landed(&self, account_id: AccountId, draw: JoinHandle<Decision>) {
        let store = self.reconciler.store().clone();
        tokio::spawn(async move {
            let Ok(Decision::Permit(permit)) = draw.await else {
                return;
            };
            match store
                .release_permit(permit.id, account_id, permit.amount, Utc::now())
                .await
            {
                Ok(Some(_)) => tracing::info!(
                    account_id,
                    permit = %permit.id,
                    "released draw that landed after the deadline"
                ),
                Ok(None) => tracing::warn!(
                    account_id,
                    permit = %permit.id,
                    "late permit was already released"
                ),
                Err(err) => tracing::error!(
                    account_id,
                    permit = %permit.id,
                    %err,
                    "failed to release draw that landed after the deadline"
                ),
            }
        });
    }

    fn timed_out(&self, account_id: AccountId, resource: ResourceKind, amount: u64) -> Decision {
        tracing::warn!(
            account_id,
            %resource,
            amount,
            timeout_ms = self.timeout.as_millis() as u64,
            "authorization timed out"
        );
        Decision::denied(DenialReason::EntitlementUnavailable)
    }

    /// Whether the tier of a past-due, canceled or expired subscription would have allowed this.
    fn lapsed_plan_allows<F>(
        &self,
        entitlement: &EffectiveEntitlement,
        resource: ResourceKind,
        check: F,
    ) -> bool
    where
        F: Fn(&PlanLimits) -> bool,
    {
        let Some(tier) = entitlement.lapsed_tier() else {
            return false;
        };
        match self.reconciler.ledger().resolver().catalog().get_plan(tier) {
            Ok(plan) => check(plan),
            Err(err) => {
                tracing::error!(%err, %resource, "subscribed tier missing from catalog");
                false
            }
        }
    }

    /// Gives back what a permit drew when its downstream action failed. A
    /// permit is released once, for at most its own amount, against the
    /// period and source it was drawn from. Owner permits are never metered,
    /// so releasing one changes nothing.
    pub async fn release(
        &self,
        account: &Account,
        permit_id: Uuid,
        resource: Option<ResourceKind>,
        amount: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<ReleaseOutcome, ReleaseError> {
        if account.is_owner {
            return Ok(ReleaseOutcome {
                permit_id,
                source: Source::OwnerBypass,
                released: 0,
                consumed: None,
                refunded: None,
            });
        }

        let store = self.reconciler.store();
        let record = store
            .permit(permit_id)
            .await?
            .filter(|record| record.account_id == account.id)
            .ok_or(ReleaseError::UnknownPermit(permit_id))?;
        if record.released_at.is_some() {
            return Err(ReleaseError::AlreadyReleased(permit_id));
        }
        if let Some(requested) = resource.filter(|requested| *requested != record.resource) {
            return Err(ReleaseError::ResourceMismatch {
                issued: record.resource,
                requested,
            });
        }
        let amount = amount.unwrap_or(record.amount);
        if amount > record.amount {
            return Err(ReleaseError::ExceedsPermit {
                granted: record.amount,
                requested: amount,
            });
        }

        let release = store
            .release_permit(permit_id, account.id, amount, now)
            .await?
            .ok_or(ReleaseError::AlreadyReleased(permit_id))?;
        tracing::info!(
            account_id = account.id,
            resource = %record.resource,
            amount = release.released,
            permit = %permit_id,
            source = ?record.source,
            period = %record.period_key,
            "metered action released"
        );
        Ok(ReleaseOutcome {
            permit_id,
            source: record.source,
            released: release.released,
            consumed: release.consumed,
            refunded: release.refunded,
        })
    }

    /// Read-only capability view for the dashboard.
    pub async fn snapshot(
        &self,
        account: &Account,
        now: DateTime<Utc>,
    ) -> Result<EntitlementSnapshot, EntitlementError> {
        let ledger = self.reconciler.ledger();
        let entitlement = ledger.resolver().resolve(account, now).await?;

        let mut usage = BTreeMap::new();
        for resource in ResourceKind::ALL {
            let limit = if entitlement.bypass {
                Limit::Unlimited
            } else {
                entitlement.plan.limit(resource)
            };
            let used = ledger.current(account.id, resource, now).await?;
            let window = PeriodWindow::for_resource(resource, now);
            usage.insert(
                resource,
                ResourceUsage {
                    limit,
                    used,
                    remaining: limit.remaining(used),
                    credit_pack_balance: self.reconciler.balance(account.id, resource).await?,
                    period_key: window.key,
                    resets_at: window.end,
                },
            );
        }

        Ok(EntitlementSnapshot {
            account_id: account.id,
            tier: entitlement.tier,
            bypass: entitlement.bypass,
            subscription_status: entitlement.subscription_status,
            capabilities: entitlement.plan.capabilities.clone(),
            limits: usage.iter().map(|(resource, u)| (*resource, u.limit)).collect(),
            usage,
        })
    }
}

fn permit(
    entitlement: &EffectiveEntitlement,
    resource: ResourceKind,
    amount: u64,
    source: Source,
    remaining: Option<u64>,
    now: DateTime<Utc>,
) -> Permit {
    Permit {
        id: Uuid::new_v4(),
        account_id: entitlement.account_id,
        resource,
        amount,
        source,
        remaining,
        issued_at: now,
    }
}

fn available(exceeded: &QuotaExceeded) -> u64 {
    exceeded
        .limit
        .remaining(exceeded.consumed)
        .unwrap_or(0)
        .max(exceeded.pack_balance)
}

fn unavailable(account_id: AccountId, err: EntitlementError) -> Decision {
    tracing::error!(account_id, %err, "entitlement lookup failed, denying");
    Decision::denied(DenialReason::EntitlementUnavailable)
}
