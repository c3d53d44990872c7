use axum::{extract::Extension, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::gateway::{
    Decision, DenialReason, EntitlementSnapshot, QuotaGateway, ReleaseError, ReleaseOutcome,
};
use super::models::Source;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::plans::ResourceKind;

#[derive(Debug, Deserialize)]
pub struct AuthorizeRequest {
    pub resource: String,
    pub amount: i64,
}

#[derive(Debug, Serialize)]
pub struct AuthorizeResponse {
    pub permitted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenialReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permit_id: Option<Uuid>,
}

impl From<Decision> for AuthorizeResponse {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Permit(permit) => AuthorizeResponse {
                permitted: true,
                reason: None,
                remaining: permit.remaining,
                source: Some(permit.source),
                permit_id: Some(permit.id),
            },
            Decision::Denied(denial) => AuthorizeResponse {
                permitted: false,
                reason: Some(denial.reason),
                remaining: denial.remaining,
                source: None,
                permit_id: None,
            },
        }
    }
}

/// Only the permit id is required; `resource` and `amount` narrow the release
/// and must fit within what the permit granted.
#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub permit_id: Option<Uuid>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
}

fn parse_request(resource: &str, amount: i64) -> AppResult<(ResourceKind, u64)> {
    let resource = ResourceKind::parse(resource)
        .ok_or_else(|| AppError::BadRequest(format!("unknown resource `{resource}`")))?;
    if amount < 1 {
        return Err(AppError::BadRequest("amount must be at least 1".into()));
    }
    Ok((resource, amount as u64))
}

impl From<ReleaseError> for AppError {
    fn from(err: ReleaseError) -> Self {
        match err {
            ReleaseError::UnknownPermit(_) => AppError::NotFound(err.to_string()),
            ReleaseError::AlreadyReleased(_) => AppError::Conflict(err.to_string()),
            ReleaseError::ResourceMismatch { .. } | ReleaseError::ExceedsPermit { .. } => {
                AppError::BadRequest(err.to_string())
            }
            ReleaseError::Store(err) => AppError::Unavailable(err.to_string()),
        }
    }
}

/// key: entitlement-api -> capability payload for client-side gating
pub async fn current_entitlement(
    Extension(gateway): Extension<QuotaGateway>,
    user: AuthUser,
) -> AppResult<Json<EntitlementSnapshot>> {
    let snapshot = gateway
        .snapshot(&user.account(), Utc::now())
        .await
        .map_err(|err| AppError::Unavailable(err.to_string()))?;
    Ok(Json(snapshot))
}

/// Denials are a normal answer and come back as 200 with `permitted: false`.
pub async fn authorize(
    Extension(gateway): Extension<QuotaGateway>,
    user: AuthUser,
    Json(payload): Json<AuthorizeRequest>,
) -> AppResult<Json<AuthorizeResponse>> {
    let (resource, amount) = parse_request(&payload.resource, payload.amount)?;
    let decision = gateway.authorize(&user.account(), resource, amount).await;
    Ok(Json(decision.into()))
}

pub async fn release(
    Extension(gateway): Extension<QuotaGateway>,
    user: AuthUser,
    Json(payload): Json<ReleaseRequest>,
) -> AppResult<Json<ReleaseOutcome>> {
    let permit_id = payload
        .permit_id
        .ok_or_else(|| AppError::BadRequest("permit_id is required".into()))?;
    let resource = payload
        .resource
        .as_deref()
        .map(|resource| {
            ResourceKind::parse(resource)
                .ok_or_else(|| AppError::BadRequest(format!("unknown resource `{resource}`")))
        })
        .transpose()?;
    let amount = match payload.amount {
        Some(amount) if amount < 1 => {
            return Err(AppError::BadRequest("amount must be at least 1".into()))
        }
        Some(amount) => Some(amount as u64),
        None => None,
    };

    let outcome = gateway
        .release(&user.account(), permit_id, resource, amount, Utc::now())
        .await?;
    Ok(Json(outcome))
}
