//! Entitlement resolution, usage counters, credit packs and the quota gate.

pub mod api;
pub mod gateway;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod reconciler;
pub mod resolver;
pub mod store;

pub use gateway::{
    Decision, Denial, DenialReason, EntitlementSnapshot, Permit, QuotaGateway, ReleaseError,
    ReleaseOutcome,
};
pub use ledger::{QuotaExceeded, ReserveError, UsageLedger};
pub use memory::MemoryMeteringStore;
pub use models::{
    Account, AccountId, CreditPack, PermitRecord, PlanChange, Source, Subscription,
    SubscriptionStatus,
};
pub use postgres::PgMeteringStore;
pub use reconciler::{Consumption, CreditPackReconciler, PurchaseError};
pub use resolver::{EffectiveEntitlement, EntitlementError, EntitlementResolver};
pub use store::{MeteringStore, StoreError};
