use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use super::events::{AccountPayload, BillingCommand, BillingEvent, PlanPayload, PurchasePayload};
use super::signature;
use crate::metering::store::{EventClaim, PlanChangeOutcome, TransitionOutcome};
use crate::metering::{
    CreditPackReconciler, EntitlementResolver, MeteringStore, PlanChange, PurchaseError,
    StoreError, SubscriptionStatus,
};
use crate::plans::CreditPackCatalog;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing or invalid webhook signature")]
    InvalidSignature,
    #[error("malformed billing event: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What became of a delivered event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied(String),
    Ignored(String),
    Duplicate,
}

impl WebhookOutcome {
    fn record(&self) -> String {
        match self {
            WebhookOutcome::Applied(detail) => format!("applied: {detail}"),
            WebhookOutcome::Ignored(detail) => format!("ignored: {detail}"),
            WebhookOutcome::Duplicate => "duplicate".to_string(),
        }
    }
}

/// key: billing-intake -> provider events to subscription and credit-pack state
///
/// Subscription states move `none -> active -> past_due -> active` and any
/// live state `-> canceled`. Canceled is terminal; a later checkout creates a
/// new subscription row.
#[derive(Clone)]
pub struct BillingIntake {
    store: Arc<dyn MeteringStore>,
    resolver: EntitlementResolver,
    reconciler: CreditPackReconciler,
    packages: Arc<CreditPackCatalog>,
    secret: Option<String>,
}

impl BillingIntake {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        reconciler: CreditPackReconciler,
        packages: Arc<CreditPackCatalog>,
        secret: Option<String>,
    ) -> Self {
        let resolver = reconciler.ledger().resolver().clone();
        if secret.is_none() {
            tracing::warn!(
                "BILLING_WEBHOOK_SECRET not set, webhook signatures will not be verified"
            );
        }
        Self {
            store,
            resolver,
            reconciler,
            packages,
            secret,
        }
    }

    /// Verifies, parses and applies one raw webhook delivery.
    pub async fn handle(
        &self,
        body: &[u8],
        signature: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        if let Some(secret) = &self.secret {
            let valid = signature
                .map(|signature| signature::verify(secret, body, signature))
                .unwrap_or(false);
            if !valid {
                return Err(WebhookError::InvalidSignature);
            }
        }

        let event = BillingEvent::from_slice(body)?;
        self.process(&event, now).await
    }

    /// Applies an event exactly once per `provider_event_id`.
    pub async fn process(
        &self,
        event: &BillingEvent,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let command = event.command()?;
        let event_id = event.provider_event_id.as_str();

        let claim = self.store.claim_event(event_id, &event.event_type).await?;
        if claim == EventClaim::AlreadyProcessed {
            tracing::info!(
                event_id,
                event_type = %event.event_type,
                "duplicate billing event acknowledged"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match self.apply(&command, now).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Err(abandon) = self.store.abandon_event(event_id).await {
                    tracing::error!(event_id, %abandon, "failed to release billing event claim");
                }
                tracing::error!(
                    event_id,
                    event_type = %event.event_type,
                    %err,
                    "billing event failed to apply"
                );
                return Err(err);
            }
        };

        if let Some(account_id) = command.account_id() {
            self.resolver.invalidate(account_id);
        }
        self.store.complete_event(event_id, &outcome.record()).await?;
        tracing::info!(
            event_id,
            event_type = %event.event_type,
            account_id = command.account_id(),
            outcome = %outcome.record(),
            "billing event processed"
        );
        Ok(outcome)
    }

    async fn apply(
        &self,
        command: &BillingCommand,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        match command {
            BillingCommand::Checkout(payload) => self.checkout(payload, now).await,
            BillingCommand::PlanChanged(payload) => self.change_plan(payload, now).await,
            BillingCommand::PaymentFailed(payload) => {
                self.transition(
                    payload,
                    &[SubscriptionStatus::Active, SubscriptionStatus::Trialing],
                    SubscriptionStatus::PastDue,
                    now,
                )
                .await
            }
            BillingCommand::PaymentRecovered(payload) => {
                self.transition(
                    payload,
                    &[SubscriptionStatus::PastDue],
                    SubscriptionStatus::Active,
                    now,
                )
                .await
            }
            BillingCommand::Canceled(payload) => {
                self.transition(
                    payload,
                    &[
                        SubscriptionStatus::Active,
                        SubscriptionStatus::Trialing,
                        SubscriptionStatus::PastDue,
                    ],
                    SubscriptionStatus::Canceled,
                    now,
                )
                .await
            }
            BillingCommand::Purchase(payload) => self.purchase(payload, now).await,
            BillingCommand::Unsupported(event_type) => {
                Ok(WebhookOutcome::Ignored(format!("unsupported event type `{event_type}`")))
            }
        }
    }

    async fn checkout(
        &self,
        payload: &PlanPayload,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let status = match payload.trial_ends_at {
            Some(end) if end > now => SubscriptionStatus::Trialing,
            _ => SubscriptionStatus::Active,
        };
        let change = plan_change(payload, Some(status));
        let outcome = self.store.change_plan(&change, true, now).await?;
        Ok(plan_outcome(outcome))
    }

    async fn change_plan(
        &self,
        payload: &PlanPayload,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let outcome = self
            .store
            .change_plan(&plan_change(payload, None), false, now)
            .await?;
        Ok(plan_outcome(outcome))
    }

    async fn transition(
        &self,
        payload: &AccountPayload,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let outcome = self
            .store
            .transition_subscription(payload.account_id, from, to, now)
            .await?;
        Ok(match outcome {
            TransitionOutcome::Applied { previous, .. } => {
                WebhookOutcome::Applied(format!("{} -> {}", previous.as_str(), to.as_str()))
            }
            TransitionOutcome::Refused(Some(current)) => WebhookOutcome::Ignored(format!(
                "cannot move {} subscription to {}",
                current.as_str(),
                to.as_str()
            )),
            TransitionOutcome::Refused(None) => WebhookOutcome::Ignored("no subscription".into()),
        })
    }

    async fn purchase(
        &self,
        payload: &PurchasePayload,
        now: DateTime<Utc>,
    ) -> Result<WebhookOutcome, WebhookError> {
        let Some(package) = self.packages.get(&payload.package_id) else {
            return Err(WebhookError::Malformed(format!(
                "unknown credit package `{}`",
                payload.package_id
            )));
        };
        let transaction_id = payload.transaction_id.as_deref().unwrap_or_default();

        match self
            .reconciler
            .apply_purchase(
                transaction_id,
                payload.account_id,
                package.resource,
                package.credits,
                now,
            )
            .await
        {
            Ok(pack) => Ok(WebhookOutcome::Applied(format!(
                "{} {} credits from {}",
                pack.credits_granted, pack.resource, payload.package_id
            ))),
            Err(PurchaseError::Duplicate(duplicate)) => {
                Ok(WebhookOutcome::Ignored(duplicate.to_string()))
            }
            Err(PurchaseError::Store(err)) => Err(err.into()),
        }
    }
}

fn plan_change(payload: &PlanPayload, status: Option<SubscriptionStatus>) -> PlanChange {
    PlanChange {
        account_id: payload.account_id,
        tier: payload.tier,
        status,
        current_period_start: payload.current_period_start,
        current_period_end: payload.current_period_end,
        trial_ends_at: payload.trial_ends_at,
    }
}

fn plan_outcome(outcome: PlanChangeOutcome) -> WebhookOutcome {
    match outcome {
        PlanChangeOutcome::Created(subscription) => {
            WebhookOutcome::Applied(format!("subscription created on {}", subscription.tier))
        }
        PlanChangeOutcome::Changed {
            previous,
            subscription,
        } => WebhookOutcome::Applied(format!(
            "plan changed from {previous} to {}",
            subscription.tier
        )),
        PlanChangeOutcome::NoLiveSubscription => {
            WebhookOutcome::Ignored("no live subscription".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::{MemoryMeteringStore, UsageLedger};
    use crate::plans::{PlanCatalog, PlanTier, ResourceKind};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn intake(store: Arc<MemoryMeteringStore>, secret: Option<&str>) -> BillingIntake {
        let resolver = EntitlementResolver::new(
            store.clone(),
            Arc::new(PlanCatalog::default()),
            Duration::from_secs(60),
        );
        let ledger = UsageLedger::new(store.clone(), resolver);
        let reconciler = CreditPackReconciler::new(store.clone(), ledger);
        BillingIntake::new(
            store,
            reconciler,
            Arc::new(CreditPackCatalog::default()),
            secret.map(str::to_string),
        )
    }

    fn event(id: &str, event_type: &str, payload: Value) -> BillingEvent {
        BillingEvent {
            provider_event_id: id.into(),
            event_type: event_type.into(),
            payload,
        }
    }

    #[tokio::test]
    async fn lifecycle_follows_state_machine() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store.clone(), None);
        let now = Utc::now();

        let outcome = intake
            .process(
                &event("e1", "checkout.completed", json!({"account_id": 1, "tier": "pro"})),
                now,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied(_)));

        intake
            .process(&event("e2", "payment.failed", json!({"account_id": 1})), now)
            .await
            .unwrap();
        let subscription = store.current_subscription(1).await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::PastDue);
        assert_eq!(subscription.tier, PlanTier::Pro);

        intake
            .process(&event("e3", "payment.recovered", json!({"account_id": 1})), now)
            .await
            .unwrap();
        intake
            .process(&event("e4", "subscription.canceled", json!({"account_id": 1})), now)
            .await
            .unwrap();
        let subscription = store.current_subscription(1).await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Canceled);
        assert!(subscription.canceled_at.is_some());

        let outcome = intake
            .process(&event("e5", "payment.recovered", json!({"account_id": 1})), now)
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored(_)));

        let outcome = intake
            .process(
                &event("e6", "checkout.completed", json!({"account_id": 1, "tier": "basic"})),
                now + chrono::Duration::seconds(1),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied(_)));
        let fresh = store.current_subscription(1).await.unwrap().unwrap();
        assert_ne!(fresh.id, subscription.id);
        assert_eq!(fresh.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn past_due_subscription_can_be_canceled() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store.clone(), None);
        let now = Utc::now();
        intake
            .process(
                &event("c1", "checkout.completed", json!({"account_id": 7, "tier": "pro"})),
                now,
            )
            .await
            .unwrap();
        intake
            .process(&event("f1", "payment.failed", json!({"account_id": 7})), now)
            .await
            .unwrap();

        let outcome = intake
            .process(&event("x1", "subscription.canceled", json!({"account_id": 7})), now)
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Applied("past_due -> canceled".into()));
        let subscription = store.current_subscription(7).await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Canceled);
        assert_eq!(subscription.canceled_at, Some(now));
        assert_eq!(subscription.tier, PlanTier::Pro);
    }

    #[tokio::test]
    async fn concurrent_plan_change_and_payment_failure_both_apply() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store.clone(), None);
        let now = Utc::now();
        intake
            .process(
                &event("c1", "checkout.completed", json!({"account_id": 8, "tier": "pro"})),
                now,
            )
            .await
            .unwrap();

        // Every store call now yields, so both deliveries interleave.
        store.set_latency(Duration::from_millis(15));
        let upgrade = event(
            "u1",
            "subscription.updated",
            json!({"account_id": 8, "tier": "autopilot"}),
        );
        let failure = event("f1", "payment.failed", json!({"account_id": 8}));
        let (upgraded, failed) = tokio::join!(
            intake.process(&upgrade, now),
            intake.process(&failure, now),
        );
        assert_eq!(
            upgraded.unwrap(),
            WebhookOutcome::Applied("plan changed from pro to autopilot".into())
        );
        assert_eq!(failed.unwrap(), WebhookOutcome::Applied("active -> past_due".into()));

        store.set_latency(Duration::ZERO);
        let subscription = store.current_subscription(8).await.unwrap().unwrap();
        assert_eq!(subscription.tier, PlanTier::Autopilot);
        assert_eq!(subscription.status, SubscriptionStatus::PastDue);
    }

    #[tokio::test]
    async fn concurrent_checkouts_share_one_subscription() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store.clone(), None);
        store.set_latency(Duration::from_millis(15));
        let first = event("c1", "checkout.completed", json!({"account_id": 9, "tier": "basic"}));
        let second = event("c2", "checkout.completed", json!({"account_id": 9, "tier": "pro"}));

        let (first, second) = tokio::join!(
            intake.process(&first, Utc::now()),
            intake.process(&second, Utc::now()),
        );
        let records: Vec<String> = [first.unwrap(), second.unwrap()]
            .iter()
            .map(WebhookOutcome::record)
            .collect();
        let created = records
            .iter()
            .filter(|record| record.starts_with("applied: subscription created"))
            .count();
        assert_eq!(created, 1, "{records:?}");
    }

    #[tokio::test]
    async fn redelivered_event_is_a_no_op() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store.clone(), None);
        let purchase = event(
            "evt_pack",
            "purchase.completed",
            json!({"account_id": 2, "package_id": "search_1000", "transaction_id": "txn_42"}),
        );

        assert!(matches!(
            intake.process(&purchase, Utc::now()).await.unwrap(),
            WebhookOutcome::Applied(_)
        ));
        assert_eq!(
            intake.process(&purchase, Utc::now()).await.unwrap(),
            WebhookOutcome::Duplicate
        );
        assert_eq!(store.pack_balance(2, ResourceKind::Search).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn same_transaction_under_new_event_id_does_not_double_credit() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store.clone(), None);
        let payload = json!({
            "account_id": 2,
            "package_id": "verify_500",
            "transaction_id": "txn_7"
        });

        intake
            .process(&event("a", "purchase.completed", payload.clone()), Utc::now())
            .await
            .unwrap();
        let outcome = intake
            .process(&event("b", "purchase.completed", payload), Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored(_)));
        assert_eq!(
            store.pack_balance(2, ResourceKind::Verification).await.unwrap(),
            500
        );
    }

    #[tokio::test]
    async fn failed_apply_releases_claim_for_retry() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store.clone(), None);
        let checkout = event("e1", "checkout.completed", json!({"account_id": 4, "tier": "basic"}));

        store.set_unavailable(true);
        assert!(matches!(
            intake.process(&checkout, Utc::now()).await,
            Err(WebhookError::Store(_))
        ));
        store.set_unavailable(false);

        assert!(matches!(
            intake.process(&checkout, Utc::now()).await.unwrap(),
            WebhookOutcome::Applied(_)
        ));
    }

    #[tokio::test]
    async fn applying_an_event_invalidates_cached_entitlement() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store.clone(), None);
        let account = crate::metering::Account::member(6);

        let resolver = intake.reconciler.ledger().resolver();
        assert_eq!(resolver.resolve(&account, Utc::now()).await.unwrap().tier, PlanTier::Free);

        intake
            .process(
                &event("e1", "checkout.completed", json!({"account_id": 6, "tier": "pro"})),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(resolver.resolve(&account, Utc::now()).await.unwrap().tier, PlanTier::Pro);
    }

    #[tokio::test]
    async fn signature_is_required_when_secret_configured() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store, Some("whsec"));
        let body =
            br#"{"provider_event_id":"e1","type":"payment.failed","payload":{"account_id":1}}"#;

        assert!(matches!(
            intake.handle(body, None, Utc::now()).await,
            Err(WebhookError::InvalidSignature)
        ));
        assert!(matches!(
            intake.handle(body, Some("deadbeef"), Utc::now()).await,
            Err(WebhookError::InvalidSignature)
        ));
        let signature = signature::sign("whsec", body);
        assert!(matches!(
            intake.handle(body, Some(&signature), Utc::now()).await.unwrap(),
            WebhookOutcome::Ignored(_)
        ));
    }

    #[tokio::test]
    async fn unknown_package_is_rejected_and_claim_released() {
        let store = Arc::new(MemoryMeteringStore::new());
        let intake = intake(store.clone(), None);
        let bad = event("e1", "purchase.completed", json!({"account_id": 1, "package_id": "nope"}));
        assert!(matches!(
            intake.process(&bad, Utc::now()).await,
            Err(WebhookError::Malformed(_))
        ));
        assert_eq!(
            store.claim_event("e1", "purchase.completed").await.unwrap(),
            EventClaim::Claimed
        );
    }
}
