use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::models::{
    AccountId, CounterKey, CreditPack, PermitRecord, PlanChange, Source, Subscription,
    SubscriptionStatus,
};
use super::store::{
    EventClaim, MeteringStore, PermitRelease, PlanChangeOutcome, ReserveOutcome, StoreError,
    TransitionOutcome,
};
use crate::plans::{PlanTier, ResourceKind};

/// key: metering-store-postgres -> durable counters and packs
#[derive(Clone)]
pub struct PgMeteringStore {
    pool: PgPool,
}

impl PgMeteringStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_db(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{value} exceeds BIGINT")))
}

fn from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn subscription_from_row(row: &PgRow) -> Result<Subscription, StoreError> {
    let tier: String = row.get("tier");
    let status: String = row.get("status");
    Ok(Subscription {
        id: row.get("id"),
        account_id: row.get("account_id"),
        tier: tier
            .parse::<PlanTier>()
            .map_err(|err| StoreError::Corrupt(err.to_string()))?,
        status: SubscriptionStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown subscription status `{status}`")))?,
        trial_ends_at: row.get("trial_ends_at"),
        current_period_start: row.get("current_period_start"),
        current_period_end: row.get("current_period_end"),
        canceled_at: row.get("canceled_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn pack_from_row(row: &PgRow) -> Result<CreditPack, StoreError> {
    let resource: String = row.get("resource_kind");
    Ok(CreditPack {
        id: row.get("id"),
        account_id: row.get("account_id"),
        resource: ResourceKind::parse(&resource)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown resource `{resource}`")))?,
        credits_granted: from_db(row.get("credits_granted")),
        credits_remaining: from_db(row.get("credits_remaining")),
        purchased_at: row.get("purchased_at"),
        source_transaction_id: row.get("source_transaction_id"),
    })
}

fn permit_from_row(row: &PgRow) -> Result<PermitRecord, StoreError> {
    let resource: String = row.get("resource_kind");
    let source: String = row.get("source");
    Ok(PermitRecord {
        id: row.get("id"),
        account_id: row.get("account_id"),
        resource: ResourceKind::parse(&resource)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown resource `{resource}`")))?,
        amount: from_db(row.get("amount")),
        source: Source::parse(&source)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown permit source `{source}`")))?,
        period_key: row.get("period_key"),
        issued_at: row.get("issued_at"),
        released_at: row.get("released_at"),
    })
}

async fn write_subscription(
    tx: &mut Transaction<'_, Postgres>,
    subscription: &Subscription,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE subscriptions SET
            tier = $2,
            status = $3,
            trial_ends_at = $4,
            current_period_start = $5,
            current_period_end = $6,
            canceled_at = $7,
            updated_at = $8
        WHERE id = $1
        "#,
    )
    .bind(subscription.id)
    .bind(subscription.tier.as_str())
    .bind(subscription.status.as_str())
    .bind(subscription.trial_ends_at)
    .bind(subscription.current_period_start)
    .bind(subscription.current_period_end)
    .bind(subscription.canceled_at)
    .bind(subscription.updated_at)
    .execute(&mut *tx)
    .await?;
    Ok(())
}

/// Newest-first refund over rows locked by the caller's transaction.
async fn refund_in(
    tx: &mut Transaction<'_, Postgres>,
    account_id: AccountId,
    resource: ResourceKind,
    amount: u64,
) -> Result<u64, StoreError> {
    let rows = sqlx::query(
        r#"
        SELECT id, credits_granted - credits_remaining AS room
        FROM credit_packs
        WHERE account_id = $1 AND resource_kind = $2 AND credits_remaining < credits_granted
        ORDER BY purchased_at DESC, id DESC
        FOR UPDATE
        "#,
    )
    .bind(account_id)
    .bind(resource.as_str())
    .fetch_all(&mut *tx)
    .await?;

    let mut outstanding = amount;
    for row in rows {
        if outstanding == 0 {
            break;
        }
        let pack_id: Uuid = row.get("id");
        let refunded = from_db(row.get("room")).min(outstanding);
        sqlx::query(
            "UPDATE credit_packs SET credits_remaining = credits_remaining + $2 WHERE id = $1",
        )
        .bind(pack_id)
        .bind(to_db(refunded)?)
        .execute(&mut *tx)
        .await?;
        outstanding -= refunded;
    }
    Ok(amount - outstanding)
}

#[async_trait]
impl MeteringStore for PgMeteringStore {
    async fn current_subscription(
        &self,
        account_id: AccountId,
    ) -> Result<Option<Subscription>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                id,
                account_id,
                tier,
                status,
                trial_ends_at,
                current_period_start,
                current_period_end,
                canceled_at,
                created_at,
                updated_at
            FROM subscriptions
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(subscription_from_row).transpose()
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id,
                account_id,
                tier,
                status,
                trial_ends_at,
                current_period_start,
                current_period_end,
                canceled_at,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.account_id)
        .bind(subscription.tier.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.trial_ends_at)
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.canceled_at)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn change_plan(
        &self,
        change: &PlanChange,
        open_if_missing: bool,
        at: DateTime<Utc>,
    ) -> Result<PlanChangeOutcome, StoreError> {
        // A checkout racing this one may win the insert; the second pass then
        // finds and updates its row.
        for _ in 0..2 {
            let mut tx = self.pool.begin().await?;
            let row = sqlx::query(
                r#"
                SELECT
                    id,
                    account_id,
                    tier,
                    status,
                    trial_ends_at,
                    current_period_start,
                    current_period_end,
                    canceled_at,
                    created_at,
                    updated_at
                FROM subscriptions
                WHERE account_id = $1 AND status <> 'canceled'
                ORDER BY created_at DESC
                LIMIT 1
                FOR UPDATE
                "#,
            )
            .bind(change.account_id)
            .fetch_optional(&mut tx)
            .await?;

            if let Some(row) = row {
                let mut subscription = subscription_from_row(&row)?;
                let previous = subscription.tier;
                change.apply_to(&mut subscription, at);
                write_subscription(&mut tx, &subscription).await?;
                tx.commit().await?;
                return Ok(PlanChangeOutcome::Changed {
                    previous,
                    subscription,
                });
            }
            if !open_if_missing {
                tx.rollback().await?;
                return Ok(PlanChangeOutcome::NoLiveSubscription);
            }

            let subscription = change.open(at);
            let inserted = sqlx::query(
                r#"
                INSERT INTO subscriptions (
                    id,
                    account_id,
                    tier,
                    status,
                    trial_ends_at,
                    current_period_start,
                    current_period_end,
                    canceled_at,
                    created_at,
                    updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (account_id) WHERE status <> 'canceled' DO NOTHING
                "#,
            )
            .bind(subscription.id)
            .bind(subscription.account_id)
            .bind(subscription.tier.as_str())
            .bind(subscription.status.as_str())
            .bind(subscription.trial_ends_at)
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.canceled_at)
            .bind(subscription.created_at)
            .bind(subscription.updated_at)
            .execute(&mut tx)
            .await?;

            if inserted.rows_affected() == 1 {
                tx.commit().await?;
                return Ok(PlanChangeOutcome::Created(subscription));
            }
            tx.rollback().await?;
        }
        Err(StoreError::Unavailable(format!(
            "live subscription for account {} kept changing",
            change.account_id
        )))
    }

    async fn transition_subscription(
        &self,
        account_id: AccountId,
        from: &[SubscriptionStatus],
        to: SubscriptionStatus,
        at: DateTime<Utc>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT
                id,
                account_id,
                tier,
                status,
                trial_ends_at,
                current_period_start,
                current_period_end,
                canceled_at,
                created_at,
                updated_at
            FROM subscriptions
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(account_id)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Refused(None));
        };
        let mut subscription = subscription_from_row(&row)?;
        if !from.contains(&subscription.status) {
            tx.rollback().await?;
            return Ok(TransitionOutcome::Refused(Some(subscription.status)));
        }

        let previous = subscription.status;
        subscription.move_to(to, at);
        write_subscription(&mut tx, &subscription).await?;
        tx.commit().await?;
        Ok(TransitionOutcome::Applied {
            previous,
            subscription,
        })
    }

    async fn usage(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let consumed: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT consumed FROM usage_counters
            WHERE account_id = $1 AND resource_kind = $2 AND period_key = $3
            "#,
        )
        .bind(key.account_id)
        .bind(key.resource.as_str())
        .bind(&key.period_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(consumed.map(from_db).unwrap_or(0))
    }

    async fn reserve_usage(
        &self,
        key: &CounterKey,
        amount: u64,
        ceiling: Option<u64>,
    ) -> Result<ReserveOutcome, StoreError> {
        // A fresh row is only inserted with `amount`, so reject oversize requests up front.
        if ceiling.map(|limit| amount > limit).unwrap_or(false) {
            let consumed = self.usage(key).await?;
            return Ok(ReserveOutcome::Exceeded { consumed });
        }

        let ceiling = ceiling.map(to_db).transpose()?;
        let committed: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO usage_counters (account_id, resource_kind, period_key, consumed)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (account_id, resource_kind, period_key)
            DO UPDATE SET
                consumed = usage_counters.consumed + EXCLUDED.consumed,
                updated_at = NOW()
            WHERE $5::BIGINT IS NULL OR usage_counters.consumed + EXCLUDED.consumed <= $5::BIGINT
            RETURNING consumed
            "#,
        )
        .bind(key.account_id)
        .bind(key.resource.as_str())
        .bind(&key.period_key)
        .bind(to_db(amount)?)
        .bind(ceiling)
        .fetch_optional(&self.pool)
        .await?;

        match committed {
            Some(consumed) => Ok(ReserveOutcome::Committed {
                consumed: from_db(consumed),
            }),
            None => {
                let consumed = self.usage(key).await?;
                Ok(ReserveOutcome::Exceeded { consumed })
            }
        }
    }

    async fn release_usage(&self, key: &CounterKey, amount: u64) -> Result<u64, StoreError> {
        let consumed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE usage_counters
            SET consumed = GREATEST(consumed - $4, 0), updated_at = NOW()
            WHERE account_id = $1 AND resource_kind = $2 AND period_key = $3
            RETURNING consumed
            "#,
        )
        .bind(key.account_id)
        .bind(key.resource.as_str())
        .bind(&key.period_key)
        .bind(to_db(amount)?)
        .fetch_optional(&self.pool)
        .await?;
        Ok(consumed.map(from_db).unwrap_or(0))
    }

    async fn credit_packs(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
    ) -> Result<Vec<CreditPack>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, resource_kind, credits_granted, credits_remaining,
                   purchased_at, source_transaction_id
            FROM credit_packs
            WHERE account_id = $1 AND resource_kind = $2
            ORDER BY purchased_at ASC, id ASC
            "#,
        )
        .bind(account_id)
        .bind(resource.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pack_from_row).collect()
    }

    async fn insert_credit_pack(&self, pack: &CreditPack) -> Result<bool, StoreError> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO credit_packs (
                id,
                account_id,
                resource_kind,
                credits_granted,
                credits_remaining,
                purchased_at,
                source_transaction_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_transaction_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(pack.id)
        .bind(pack.account_id)
        .bind(pack.resource.as_str())
        .bind(to_db(pack.credits_granted)?)
        .bind(to_db(pack.credits_remaining)?)
        .bind(pack.purchased_at)
        .bind(&pack.source_transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(inserted.is_some())
    }

    async fn draw_credit_packs(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<Option<u64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, credits_remaining
            FROM credit_packs
            WHERE account_id = $1 AND resource_kind = $2 AND credits_remaining > 0
            ORDER BY purchased_at ASC, id ASC
            FOR UPDATE
            "#,
        )
        .bind(account_id)
        .bind(resource.as_str())
        .fetch_all(&mut tx)
        .await?;

        let packs: Vec<(Uuid, u64)> = rows
            .iter()
            .map(|row| (row.get("id"), from_db(row.get("credits_remaining"))))
            .collect();
        let balance = packs
            .iter()
            .fold(0u64, |total, (_, remaining)| total.saturating_add(*remaining));
        if balance < amount {
            tx.rollback().await?;
            return Ok(None);
        }

        let mut outstanding = amount;
        for (pack_id, remaining) in packs {
            if outstanding == 0 {
                break;
            }
            let drawn = remaining.min(outstanding);
            sqlx::query(
                "UPDATE credit_packs SET credits_remaining = credits_remaining - $2 WHERE id = $1",
            )
            .bind(pack_id)
            .bind(to_db(drawn)?)
            .execute(&mut tx)
            .await?;
            outstanding -= drawn;
        }
        tx.commit().await?;
        Ok(Some(balance - amount))
    }

    async fn refund_credit_packs(
        &self,
        account_id: AccountId,
        resource: ResourceKind,
        amount: u64,
    ) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let refunded = refund_in(&mut tx, account_id, resource, amount).await?;
        tx.commit().await?;
        Ok(refunded)
    }

    async fn insert_permit(&self, permit: &PermitRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO permits (
                id,
                account_id,
                resource_kind,
                amount,
                source,
                period_key,
                issued_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(permit.id)
        .bind(permit.account_id)
        .bind(permit.resource.as_str())
        .bind(to_db(permit.amount)?)
        .bind(permit.source.as_str())
        .bind(&permit.period_key)
        .bind(permit.issued_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn permit(&self, permit_id: Uuid) -> Result<Option<PermitRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, resource_kind, amount, source, period_key,
                   issued_at, released_at
            FROM permits
            WHERE id = $1
            "#,
        )
        .bind(permit_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(permit_from_row).transpose()
    }

    async fn release_permit(
        &self,
        permit_id: Uuid,
        account_id: AccountId,
        amount: u64,
        at: DateTime<Utc>,
    ) -> Result<Option<PermitRelease>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            UPDATE permits SET released_at = $3
            WHERE id = $1 AND account_id = $2 AND released_at IS NULL
            RETURNING id, account_id, resource_kind, amount, source, period_key,
                      issued_at, released_at
            "#,
        )
        .bind(permit_id)
        .bind(account_id)
        .bind(at)
        .fetch_optional(&mut tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let permit = permit_from_row(&row)?;
        let released = amount.min(permit.amount);

        let release = match permit.source {
            Source::SubscriptionAllowance => {
                let consumed: Option<i64> = sqlx::query_scalar(
                    r#"
                    UPDATE usage_counters
                    SET consumed = GREATEST(consumed - $4, 0), updated_at = NOW()
                    WHERE account_id = $1 AND resource_kind = $2 AND period_key = $3
                    RETURNING consumed
                    "#,
                )
                .bind(permit.account_id)
                .bind(permit.resource.as_str())
                .bind(&permit.period_key)
                .bind(to_db(released)?)
                .fetch_optional(&mut tx)
                .await?;
                PermitRelease {
                    released,
                    consumed: Some(consumed.map(from_db).unwrap_or(0)),
                    refunded: None,
                }
            }
            Source::CreditPack => PermitRelease {
                released,
                consumed: None,
                refunded: Some(refund_in(&mut tx, account_id, permit.resource, released).await?),
            },
            Source::OwnerBypass => PermitRelease::default(),
        };
        tx.commit().await?;
        Ok(Some(release))
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
    ) -> Result<EventClaim, StoreError> {
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO billing_events (event_id, event_type, status, claimed_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                claimed_at = NOW()
            WHERE billing_events.status = 'processing'
              AND billing_events.claimed_at < NOW() - INTERVAL '5 minutes'
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match claimed {
            Some(_) => EventClaim::Claimed,
            None => EventClaim::AlreadyProcessed,
        })
    }

    async fn complete_event(&self, event_id: &str, outcome: &str) -> Result<(), StoreError> {
        let completed_at: DateTime<Utc> = Utc::now();
        sqlx::query(
            r#"
            UPDATE billing_events
            SET status = 'completed', outcome = $2, completed_at = $3
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome)
        .bind(completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn abandon_event(&self, event_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM billing_events WHERE event_id = $1 AND status = 'processing'")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
