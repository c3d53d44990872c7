use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};

use crate::billing::{self, BillingIntake};
use crate::metering::{
    self, CreditPackReconciler, EntitlementResolver, MeteringStore, QuotaGateway, UsageLedger,
};
use crate::plans::{CreditPackCatalog, PlanCatalog};

async fn root() -> &'static str {
    "Entitlements API"
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Wired components shared by every handler.
#[derive(Clone)]
pub struct Services {
    pub gateway: QuotaGateway,
    pub intake: BillingIntake,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub cache_ttl: Duration,
    pub authorize_timeout: Duration,
    pub webhook_secret: Option<String>,
}

impl Services {
    pub fn new(
        store: Arc<dyn MeteringStore>,
        plans: PlanCatalog,
        packages: CreditPackCatalog,
        settings: ServiceSettings,
    ) -> Self {
        let resolver = EntitlementResolver::new(store.clone(), Arc::new(plans), settings.cache_ttl);
        let ledger = UsageLedger::new(store.clone(), resolver);
        let reconciler = CreditPackReconciler::new(store.clone(), ledger);
        let intake = BillingIntake::new(
            store,
            reconciler.clone(),
            Arc::new(packages),
            settings.webhook_secret,
        );
        Self {
            gateway: QuotaGateway::new(reconciler, settings.authorize_timeout),
            intake,
        }
    }
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route(
            "/api/entitlement/me",
            get(metering::api::current_entitlement),
        )
        .route("/api/authorize", post(metering::api::authorize))
        .route("/api/release", post(metering::api::release))
        .route("/api/billing/webhook", post(billing::billing_webhook))
}

/// Router with every component attached, minus the metrics layer.
pub fn app(services: &Services) -> Router {
    api_routes()
        .layer(Extension(services.gateway.clone()))
        .layer(Extension(services.intake.clone()))
}
