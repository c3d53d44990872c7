use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::plans::{Cadence, PlanTier, ResourceKind};

pub type AccountId = i64;

/// Authenticated caller. Owned by the identity system; only referenced here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: AccountId,
    pub role: String,
    pub is_owner: bool,
}

impl Account {
    pub fn from_role(id: AccountId, role: impl Into<String>) -> Self {
        let role = role.into();
        let is_owner = matches!(role.as_str(), "owner" | "admin");
        Self { id, role, is_owner }
    }

    pub fn member(id: AccountId) -> Self {
        Self::from_role(id, "user")
    }

    pub fn owner(id: AccountId) -> Self {
        Self::from_role(id, "owner")
    }
}

/// key: subscription-status -> billing lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "trialing" => Some(SubscriptionStatus::Trialing),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }

    /// Any state other than `canceled` can still transition.
    pub fn is_live(&self) -> bool {
        !matches!(self, SubscriptionStatus::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub account_id: AccountId,
    pub tier: PlanTier,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Whether the subscription currently grants its tier's allowance.
    pub fn is_entitling(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            SubscriptionStatus::Active => true,
            SubscriptionStatus::Trialing => self.trial_ends_at.map(|end| end > now).unwrap_or(true),
            SubscriptionStatus::PastDue | SubscriptionStatus::Canceled => false,
        }
    }

    pub fn move_to(&mut self, status: SubscriptionStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
        if status == SubscriptionStatus::Canceled {
            self.canceled_at = Some(at);
        }
    }
}

/// Reset window a usage counter is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeriodWindow {
    pub key: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodWindow {
    pub fn for_resource(resource: ResourceKind, now: DateTime<Utc>) -> Self {
        Self::for_cadence(resource.cadence(), now)
    }

    pub fn for_cadence(cadence: Cadence, now: DateTime<Utc>) -> Self {
        match cadence {
            Cadence::Daily => {
                let start = now
                    .date_naive()
                    .and_hms_opt(0, 0, 0)
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .unwrap_or(now);
                Self {
                    key: now.format("%Y-%m-%d").to_string(),
                    start,
                    end: start + Duration::days(1),
                }
            }
            Cadence::Monthly => {
                let start = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
                    .map(|naive| Utc.from_utc_datetime(&naive))
                    .unwrap_or(now);
                Self {
                    key: now.format("%Y-%m").to_string(),
                    start,
                    end: start
                        .checked_add_months(Months::new(1))
                        .unwrap_or(start + Duration::days(31)),
                }
            }
        }
    }
}

/// Identity of one usage counter row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub account_id: AccountId,
    pub resource: ResourceKind,
    pub period_key: String,
}

impl CounterKey {
    pub fn new(account_id: AccountId, resource: ResourceKind, now: DateTime<Utc>) -> Self {
        Self {
            account_id,
            resource,
            period_key: PeriodWindow::for_resource(resource, now).key,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPack {
    pub id: Uuid,
    pub account_id: AccountId,
    pub resource: ResourceKind,
    pub credits_granted: u64,
    pub credits_remaining: u64,
    pub purchased_at: DateTime<Utc>,
    pub source_transaction_id: String,
}

/// Where an authorized amount was drawn from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    #[default]
    SubscriptionAllowance,
    CreditPack,
    OwnerBypass,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::SubscriptionAllowance => "subscription_allowance",
            Source::CreditPack => "credit_pack",
            Source::OwnerBypass => "owner_bypass",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "subscription_allowance" => Some(Source::SubscriptionAllowance),
            "credit_pack" => Some(Source::CreditPack),
            "owner_bypass" => Some(Source::OwnerBypass),
            _ => None,
        }
    }
}

/// Stored form of an issued permit. A permit can be released once, against
/// the period and source it was drawn from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermitRecord {
    pub id: Uuid,
    pub account_id: AccountId,
    pub resource: ResourceKind,
    pub amount: u64,
    pub source: Source,
    pub period_key: String,
    pub issued_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl PermitRecord {
    pub fn counter_key(&self) -> CounterKey {
        CounterKey {
            account_id: self.account_id,
            resource: self.resource,
            period_key: self.period_key.clone(),
        }
    }
}

/// Plan fields a checkout or plan change writes onto the live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanChange {
    pub account_id: AccountId,
    pub tier: PlanTier,
    /// Checkouts set the status; plan changes keep the current one.
    pub status: Option<SubscriptionStatus>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

impl PlanChange {
    pub fn apply_to(&self, subscription: &mut Subscription, at: DateTime<Utc>) {
        subscription.tier = self.tier;
        if let Some(status) = self.status {
            subscription.status = status;
        }
        if let Some(start) = self.current_period_start {
            subscription.current_period_start = start;
        }
        if self.current_period_end.is_some() {
            subscription.current_period_end = self.current_period_end;
        }
        if self.trial_ends_at.is_some() {
            subscription.trial_ends_at = self.trial_ends_at;
        }
        subscription.updated_at = at;
    }

    /// New subscription row for an account with no live one.
    pub fn open(&self, at: DateTime<Utc>) -> Subscription {
        Subscription {
            id: Uuid::new_v4(),
            account_id: self.account_id,
            tier: self.tier,
            status: self.status.unwrap_or(SubscriptionStatus::Active),
            trial_ends_at: self.trial_ends_at,
            current_period_start: self.current_period_start.unwrap_or(at),
            current_period_end: self.current_period_end,
            canceled_at: None,
            created_at: at,
            updated_at: at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(raw: &str) -> DateTime<Utc> {
        raw.parse().unwrap()
    }

    #[test]
    fn daily_window_rolls_at_utc_midnight() {
        let window = PeriodWindow::for_resource(ResourceKind::Search, at("2026-03-14T23:59:59Z"));
        assert_eq!(window.key, "2026-03-14");
        assert_eq!(window.start, at("2026-03-14T00:00:00Z"));
        assert_eq!(window.end, at("2026-03-15T00:00:00Z"));

        let next = PeriodWindow::for_resource(ResourceKind::Search, at("2026-03-15T00:00:00Z"));
        assert_eq!(next.key, "2026-03-15");
    }

    #[test]
    fn monthly_window_spans_calendar_month() {
        let window = PeriodWindow::for_resource(ResourceKind::Sms, at("2026-12-31T10:00:00Z"));
        assert_eq!(window.key, "2026-12");
        assert_eq!(window.start, at("2026-12-01T00:00:00Z"));
        assert_eq!(window.end, at("2027-01-01T00:00:00Z"));
    }

    #[test]
    fn trial_entitles_until_it_ends() {
        let now = at("2026-05-01T00:00:00Z");
        let mut subscription = Subscription {
            id: Uuid::new_v4(),
            account_id: 1,
            tier: PlanTier::Pro,
            status: SubscriptionStatus::Trialing,
            trial_ends_at: Some(now + Duration::days(1)),
            current_period_start: now,
            current_period_end: None,
            canceled_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(subscription.is_entitling(now));
        assert!(!subscription.is_entitling(now + Duration::days(2)));
        subscription.status = SubscriptionStatus::PastDue;
        assert!(!subscription.is_entitling(now));
    }

    #[test]
    fn plan_change_keeps_unsent_fields() {
        let now = at("2026-05-01T00:00:00Z");
        let change = PlanChange {
            account_id: 1,
            tier: PlanTier::Basic,
            status: None,
            current_period_start: None,
            current_period_end: Some(now + Duration::days(30)),
            trial_ends_at: None,
        };
        let mut subscription = change.open(now);
        assert_eq!(subscription.status, SubscriptionStatus::Active);
        subscription.move_to(SubscriptionStatus::PastDue, now);

        let upgrade = PlanChange {
            tier: PlanTier::Autopilot,
            current_period_end: None,
            ..change
        };
        upgrade.apply_to(&mut subscription, now + Duration::hours(1));
        assert_eq!(subscription.tier, PlanTier::Autopilot);
        assert_eq!(subscription.status, SubscriptionStatus::PastDue);
        assert_eq!(subscription.current_period_end, Some(now + Duration::days(30)));
    }

    #[test]
    fn source_round_trips_storage_names() {
        for source in [Source::SubscriptionAllowance, Source::CreditPack, Source::OwnerBypass] {
            assert_eq!(Source::parse(source.as_str()), Some(source));
        }
        assert_eq!(Source::default(), Source::SubscriptionAllowance);
    }

    #[test]
    fn admin_and_owner_roles_bypass() {
        assert!(Account::from_role(1, "admin").is_owner);
        assert!(Account::owner(1).is_owner);
        assert!(!Account::member(1).is_owner);
    }
}
