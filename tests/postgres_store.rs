use std::sync::Arc;

use chrono::Utc;
use entitlements::metering::models::{CounterKey, PermitRecord, PlanChange};
use entitlements::metering::store::{EventClaim, PlanChangeOutcome, ReserveOutcome};
use entitlements::metering::{
    CreditPack, MeteringStore, PgMeteringStore, Source, SubscriptionStatus,
};
use entitlements::plans::{PlanTier, ResourceKind};
use sqlx::PgPool;
use uuid::Uuid;

fn pack(account_id: i64, credits: u64, transaction: &str, age_days: i64) -> CreditPack {
    CreditPack {
        id: Uuid::new_v4(),
        account_id,
        resource: ResourceKind::Verification,
        credits_granted: credits,
        credits_remaining: credits,
        purchased_at: Utc::now() - chrono::Duration::days(age_days),
        source_transaction_id: transaction.to_string(),
    }
}

// key: postgres-store-tests -> conditional upsert, pack draws, event claims
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_reservations_never_overshoot(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = Arc::new(PgMeteringStore::new(pool));
    let key = CounterKey::new(1, ResourceKind::Search, Utc::now());

    let handles: Vec<_> = (0..25)
        .map(|_| {
            let store = store.clone();
            let key = key.clone();
            tokio::spawn(async move { store.reserve_usage(&key, 1, Some(10)).await.unwrap() })
        })
        .collect();
    let mut committed = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), ReserveOutcome::Committed { .. }) {
            committed += 1;
        }
    }
    assert_eq!(committed, 10);
    assert_eq!(store.usage(&key).await.unwrap(), 10);

    assert_eq!(store.release_usage(&key, 25).await.unwrap(), 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn pack_draws_are_fifo_and_refunds_lifo(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgMeteringStore::new(pool);

    assert!(store.insert_credit_pack(&pack(5, 3, "old", 2)).await.unwrap());
    assert!(store.insert_credit_pack(&pack(5, 4, "new", 0)).await.unwrap());
    assert!(!store.insert_credit_pack(&pack(5, 4, "new", 0)).await.unwrap());

    assert_eq!(
        store.draw_credit_packs(5, ResourceKind::Verification, 8).await.unwrap(),
        None
    );
    assert_eq!(
        store.draw_credit_packs(5, ResourceKind::Verification, 5).await.unwrap(),
        Some(2)
    );
    let packs = store.credit_packs(5, ResourceKind::Verification).await.unwrap();
    assert_eq!(packs[0].credits_remaining, 0);
    assert_eq!(packs[1].credits_remaining, 2);

    assert_eq!(
        store.refund_credit_packs(5, ResourceKind::Verification, 10).await.unwrap(),
        5
    );
    let packs = store.credit_packs(5, ResourceKind::Verification).await.unwrap();
    assert_eq!(packs[0].credits_remaining, 3);
    assert_eq!(packs[1].credits_remaining, 4);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn event_claims_are_exclusive(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgMeteringStore::new(pool);

    assert_eq!(
        store.claim_event("evt_1", "payment.failed").await.unwrap(),
        EventClaim::Claimed
    );
    assert_eq!(
        store.claim_event("evt_1", "payment.failed").await.unwrap(),
        EventClaim::AlreadyProcessed
    );
    store.abandon_event("evt_1").await.unwrap();
    assert_eq!(
        store.claim_event("evt_1", "payment.failed").await.unwrap(),
        EventClaim::Claimed
    );
    store.complete_event("evt_1", "applied").await.unwrap();
    assert_eq!(
        store.claim_event("evt_1", "payment.failed").await.unwrap(),
        EventClaim::AlreadyProcessed
    );
}

fn plan(account_id: i64, tier: PlanTier, status: Option<SubscriptionStatus>) -> PlanChange {
    PlanChange {
        account_id,
        tier,
        status,
        current_period_start: None,
        current_period_end: None,
        trial_ends_at: None,
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn concurrent_checkouts_create_one_live_row(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = Arc::new(PgMeteringStore::new(pool.clone()));

    let handles: Vec<_> = [PlanTier::Basic, PlanTier::Pro, PlanTier::Autopilot]
        .into_iter()
        .map(|tier| {
            let store = store.clone();
            let change = plan(11, tier, Some(SubscriptionStatus::Active));
            tokio::spawn(async move { store.change_plan(&change, true, Utc::now()).await.unwrap() })
        })
        .collect();
    let mut created = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), PlanChangeOutcome::Created(_)) {
            created += 1;
        }
    }
    assert_eq!(created, 1);

    let live: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM subscriptions WHERE account_id = 11 AND status <> 'canceled'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(live, 1);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn plan_change_and_payment_failure_both_land(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = Arc::new(PgMeteringStore::new(pool));
    let checkout = plan(12, PlanTier::Pro, Some(SubscriptionStatus::Active));
    store.change_plan(&checkout, true, Utc::now()).await.unwrap();

    let upgrade = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .change_plan(&plan(12, PlanTier::Autopilot, None), false, Utc::now())
                .await
                .unwrap()
        })
    };
    let failure = {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .transition_subscription(
                    12,
                    &[SubscriptionStatus::Active, SubscriptionStatus::Trialing],
                    SubscriptionStatus::PastDue,
                    Utc::now(),
                )
                .await
                .unwrap()
        })
    };
    upgrade.await.unwrap();
    failure.await.unwrap();

    let subscription = store.current_subscription(12).await.unwrap().unwrap();
    assert_eq!(subscription.tier, PlanTier::Autopilot);
    assert_eq!(subscription.status, SubscriptionStatus::PastDue);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn permit_release_credits_its_own_period_once(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgMeteringStore::new(pool);
    let yesterday = Utc::now() - chrono::Duration::days(1);
    let key = CounterKey::new(13, ResourceKind::Search, yesterday);
    store.reserve_usage(&key, 4, Some(5)).await.unwrap();
    let permit = PermitRecord {
        id: Uuid::new_v4(),
        account_id: 13,
        resource: ResourceKind::Search,
        amount: 4,
        source: Source::SubscriptionAllowance,
        period_key: key.period_key.clone(),
        issued_at: yesterday,
        released_at: None,
    };
    store.insert_permit(&permit).await.unwrap();

    assert_eq!(store.release_permit(permit.id, 99, 4, Utc::now()).await.unwrap(), None);
    let release = store
        .release_permit(permit.id, 13, 4, Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(release.consumed, Some(0));
    assert_eq!(store.release_permit(permit.id, 13, 4, Utc::now()).await.unwrap(), None);
    assert_eq!(store.usage(&key).await.unwrap(), 0);
}
