//! Variant query endpoints.

use crate::api::{
    authorized_user, fresh_request_id, parse_message, required, run_blocking, signed_reply,
    ApiError,
};
use crate::{quota, AppState};
use axum::extract::{Extension, Json};
use labshare_crypto::{EncryptedPayload, SignedMessage};
use labshare_types::{RequestId, VariantRow};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Body of an unauthenticated `/variants` query.
#[derive(Debug, Deserialize)]
pub struct PublicVariantQuery {
    pub chrom: String,
    pub start: Value,
}

/// Accepts positions sent either as JSON numbers or numeric strings.
fn parse_position(value: Option<&Value>, field: &str) -> Result<Option<u64>, ApiError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("'{field}' must be a non-negative integer"))),
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("'{field}' must be a non-negative integer"))),
        Some(_) => Err(ApiError::BadRequest(format!(
            "'{field}' must be a non-negative integer"
        ))),
    }
}

async fn query_store(
    state: &Arc<AppState>,
    chrom: String,
    start: Option<u64>,
    end: Option<u64>,
) -> Result<Vec<VariantRow>, ApiError> {
    let store = state.variants.clone();
    run_blocking(move || {
        store
            .query(&chrom, start, end)
            .map_err(|e| ApiError::InternalServerError(format!("variant lookup failed: {}", e)))
    })
    .await
}

/// Handler for `POST /variants`: a single-position lookup, limited by the
/// node's daily public budget.
pub async fn public_variants_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(query): Json<PublicVariantQuery>,
) -> Result<Json<Value>, ApiError> {
    let Some(start) = parse_position(Some(&query.start), "start")? else {
        return Err(ApiError::BadRequest("missing field 'start'".to_string()));
    };

    let rows = query_store(&state, query.chrom.clone(), Some(start), None).await?;

    // Only answered lookups count against the budget.
    let limit = state.public_daily_limit;
    let pool = state.pool.clone();
    let allowed = run_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        quota::try_consume(&conn, limit)
            .map_err(|e| ApiError::InternalServerError(format!("quota update failed: {}", e)))
    })
    .await?;
    if !allowed {
        tracing::info!(chrom = %query.chrom, "public query refused: daily quota exhausted");
        return Err(ApiError::TooManyRequests(
            "daily public query limit reached".to_string(),
        ));
    }

    let request_id = RequestId::generate();
    tracing::info!(request_id = %request_id, chrom = %query.chrom, start, "served public query");
    Ok(Json(json!({
        "request_id": request_id.as_str(),
        "result": rows,
    })))
}

/// Handler for `POST /variants-private`: a signed region query from a
/// federated user. Rows are encrypted for the caller's key.
pub async fn private_variants_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<SignedMessage>, ApiError> {
    let message = parse_message(body)?;
    let request_id = fresh_request_id(&state, &message)?;
    let chrom = required(&message, "chrom")?.to_string();
    let start = parse_position(message.get("start"), "start")?;
    let end = parse_position(message.get("end"), "end")?;

    let key = authorized_user(&state, &message).await?;

    let rows = query_store(&state, chrom.clone(), start, end).await?;
    let plaintext = serde_json::to_vec(&rows)
        .map_err(|e| ApiError::InternalServerError(format!("encoding rows failed: {}", e)))?;
    let payload = EncryptedPayload::seal(&plaintext, &key, state.iv_mode)?;
    let wrapped_key = payload.wrapped_key().ok_or_else(|| {
        ApiError::InternalServerError("sealed payload has no wrapped key".to_string())
    })?;

    tracing::info!(
        user_id = message.get_str("user_id").unwrap_or_default(),
        chrom = %chrom,
        rows = rows.len(),
        "served private query"
    );

    signed_reply(
        &state,
        SignedMessage::new()
            .with("request_id", json!(request_id.as_str()))
            .with("result", json!(payload.ciphertext()))
            .with("encryption_key", json!(wrapped_key)),
    )
}
