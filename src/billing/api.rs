use axum::{
    body::Bytes,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::Utc;

use super::intake::{BillingIntake, WebhookError, WebhookOutcome};
use super::signature::SIGNATURE_HEADER;

/// key: billing-webhook -> provider delivery endpoint
///
/// Duplicates answer 200 so the provider stops retrying; a new event that
/// failed to apply answers 5xx so it does retry.
pub async fn billing_webhook(
    Extension(intake): Extension<BillingIntake>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookOutcome>, (StatusCode, String)> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    intake
        .handle(&body, signature, Utc::now())
        .await
        .map(Json)
        .map_err(|err| {
            let status = match &err {
                WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
                WebhookError::Malformed(_) => StatusCode::BAD_REQUEST,
                WebhookError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            tracing::warn!(%err, status = status.as_u16(), "billing webhook rejected");
            (status, err.to_string())
        })
}
