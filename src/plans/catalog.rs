use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// key: plan-catalog-tier -> ordered subscription tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    Free,
    Basic,
    Pro,
    Autopilot,
}

impl PlanTier {
    pub const ALL: [PlanTier; 4] = [
        PlanTier::Free,
        PlanTier::Basic,
        PlanTier::Pro,
        PlanTier::Autopilot,
    ];

    pub fn highest() -> PlanTier {
        PlanTier::Autopilot
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Basic => "basic",
            PlanTier::Pro => "pro",
            PlanTier::Autopilot => "autopilot",
        }
    }
}

impl fmt::Display for PlanTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown plan tier `{0}`")]
pub struct UnknownTierError(pub String);

impl FromStr for PlanTier {
    type Err = UnknownTierError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(PlanTier::Free),
            "basic" => Ok(PlanTier::Basic),
            "pro" => Ok(PlanTier::Pro),
            "autopilot" => Ok(PlanTier::Autopilot),
            other => Err(UnknownTierError(other.to_string())),
        }
    }
}

/// Reset window a resource counter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Daily,
    Monthly,
}

/// key: plan-catalog-resource -> meterable units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Search,
    Verification,
    CallMinute,
    Sms,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Search,
        ResourceKind::Verification,
        ResourceKind::CallMinute,
        ResourceKind::Sms,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Search => "search",
            ResourceKind::Verification => "verification",
            ResourceKind::CallMinute => "call_minute",
            ResourceKind::Sms => "sms",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "search" => Some(ResourceKind::Search),
            "verification" => Some(ResourceKind::Verification),
            "call_minute" => Some(ResourceKind::CallMinute),
            "sms" => Some(ResourceKind::Sms),
            _ => None,
        }
    }

    pub fn cadence(&self) -> Cadence {
        match self {
            ResourceKind::Search => Cadence::Daily,
            ResourceKind::Verification | ResourceKind::CallMinute | ResourceKind::Sms => {
                Cadence::Monthly
            }
        }
    }

    /// Capability a plan must carry before this resource can be metered at all.
    pub fn required_capability(&self) -> Option<Capability> {
        match self {
            ResourceKind::Search => None,
            ResourceKind::Verification => Some(Capability::AiVerification),
            ResourceKind::CallMinute => Some(Capability::Calling),
            ResourceKind::Sms => Some(Capability::Sms),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Calling,
    Sms,
    Automation,
    AiVerification,
}

/// Ceiling for one resource. Serialized as a number or `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Limited(u64),
    Unlimited,
}

impl Limit {
    pub fn ceiling(&self) -> Option<u64> {
        match self {
            Limit::Limited(value) => Some(*value),
            Limit::Unlimited => None,
        }
    }

    pub fn allows(&self, consumed: u64, amount: u64) -> bool {
        match self {
            Limit::Limited(ceiling) => consumed
                .checked_add(amount)
                .map(|total| total <= *ceiling)
                .unwrap_or(false),
            Limit::Unlimited => true,
        }
    }

    pub fn remaining(&self, consumed: u64) -> Option<u64> {
        self.ceiling().map(|ceiling| ceiling.saturating_sub(consumed))
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Limited(value) => serializer.serialize_u64(*value),
            Limit::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(Limit::Limited(value)),
            Raw::Text(text) if text.eq_ignore_ascii_case("unlimited") => Ok(Limit::Unlimited),
            Raw::Text(text) => Err(serde::de::Error::custom(format!(
                "expected a non-negative integer or \"unlimited\", got `{text}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFlags {
    #[serde(default)]
    pub calling: bool,
    #[serde(default)]
    pub sms: bool,
    #[serde(default)]
    pub automation: bool,
    #[serde(default)]
    pub ai_verification: bool,
}

impl CapabilityFlags {
    pub fn all() -> Self {
        Self {
            calling: true,
            sms: true,
            automation: true,
            ai_verification: true,
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Calling => self.calling,
            Capability::Sms => self.sms,
            Capability::Automation => self.automation,
            Capability::AiVerification => self.ai_verification,
        }
    }
}

/// key: plan-catalog-limits -> resource ceilings plus capability flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanLimits {
    pub tier: PlanTier,
    pub limits: BTreeMap<ResourceKind, Limit>,
    pub capabilities: CapabilityFlags,
}

impl PlanLimits {
    /// Resources missing from the table are treated as a zero ceiling.
    pub fn limit(&self, resource: ResourceKind) -> Limit {
        self.limits
            .get(&resource)
            .copied()
            .unwrap_or(Limit::Limited(0))
    }

    pub fn permits(&self, resource: ResourceKind) -> bool {
        resource
            .required_capability()
            .map(|capability| self.capabilities.has(capability))
            .unwrap_or(true)
    }

    fn new(
        tier: PlanTier,
        search: Limit,
        verification: Limit,
        call_minutes: Limit,
        sms: Limit,
        capabilities: CapabilityFlags,
    ) -> Self {
        let limits = BTreeMap::from([
            (ResourceKind::Search, search),
            (ResourceKind::Verification, verification),
            (ResourceKind::CallMinute, call_minutes),
            (ResourceKind::Sms, sms),
        ]);
        Self {
            tier,
            limits,
            capabilities,
        }
    }
}

/// Static tier table. Built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct PlanCatalog {
    plans: BTreeMap<PlanTier, PlanLimits>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("plan catalog is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("plan catalog entry for `{found}` is keyed as `{key}`")]
    MismatchedTier { key: PlanTier, found: PlanTier },
    #[error("plan catalog is missing tier `{0}`")]
    MissingTier(PlanTier),
}

impl PlanCatalog {
    pub fn get_plan(&self, tier: PlanTier) -> Result<&PlanLimits, UnknownTierError> {
        self.plans
            .get(&tier)
            .ok_or_else(|| UnknownTierError(tier.to_string()))
    }

    pub fn get_plan_by_name(&self, name: &str) -> Result<&PlanLimits, UnknownTierError> {
        let tier = name.parse::<PlanTier>()?;
        self.get_plan(tier)
    }

    pub fn plans(&self) -> impl Iterator<Item = &PlanLimits> {
        self.plans.values()
    }

    /// Parses a JSON object keyed by tier name. Every tier must be present.
    pub fn from_json(raw: &str) -> Result<Self, CatalogError> {
        let plans: BTreeMap<PlanTier, PlanLimits> = serde_json::from_str(raw)?;
        for (key, plan) in &plans {
            if *key != plan.tier {
                return Err(CatalogError::MismatchedTier {
                    key: *key,
                    found: plan.tier,
                });
            }
        }
        for tier in PlanTier::ALL {
            if !plans.contains_key(&tier) {
                return Err(CatalogError::MissingTier(tier));
            }
        }
        Ok(Self { plans })
    }
}

impl Default for PlanCatalog {
    fn default() -> Self {
        use Limit::{Limited, Unlimited};

        let display_only = CapabilityFlags {
            ai_verification: true,
            ..CapabilityFlags::default()
        };
        let plans = [
            PlanLimits::new(
                PlanTier::Free,
                Limited(5),
                Limited(10),
                Limited(0),
                Limited(0),
                display_only.clone(),
            ),
            PlanLimits::new(
                PlanTier::Basic,
                Limited(50),
                Limited(250),
                Limited(0),
                Limited(0),
                display_only,
            ),
            PlanLimits::new(
                PlanTier::Pro,
                Limited(500),
                Limited(2000),
                Limited(300),
                Limited(1000),
                CapabilityFlags {
                    calling: true,
                    sms: true,
                    automation: false,
                    ai_verification: true,
                },
            ),
            PlanLimits::new(
                PlanTier::Autopilot,
                Unlimited,
                Limited(10_000),
                Limited(1500),
                Limited(5000),
                CapabilityFlags::all(),
            ),
        ];

        Self {
            plans: plans.into_iter().map(|plan| (plan.tier, plan)).collect(),
        }
    }
}
