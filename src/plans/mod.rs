//! Static plan tiers and the purchasable credit-pack catalog.

pub mod catalog;
pub mod packs;

pub use catalog::{
    Cadence, Capability, CapabilityFlags, CatalogError, Limit, PlanCatalog, PlanLimits, PlanTier,
    ResourceKind, UnknownTierError,
};
pub use packs::{CreditPackCatalog, CreditPackage};
