//! Data sharing endpoints.
//!
//! An authorized user first fetches the node's data key, wrapped for the
//! user's own key, then uploads data encrypted under it. Uploads are stored
//! decrypted under `data_acquisition/`.

use crate::api::{
    authorized_user, fresh_request_id, parse_message, required, run_blocking, signed_reply,
    ApiError,
};
use crate::AppState;
use axum::extract::{Extension, Json};
use chrono::Utc;
use labshare_crypto::keys::write_atomic;
use labshare_crypto::{wrap_shared_key, EncryptedPayload, SignedMessage};
use serde_json::{json, Value};
use std::sync::Arc;

/// Handler for `POST /data-key`.
pub async fn data_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<SignedMessage>, ApiError> {
    let message = parse_message(body)?;
    let request_id = fresh_request_id(&state, &message)?;
    let key = authorized_user(&state, &message).await?;

    let wrapped = wrap_shared_key(&state.data_key, &key)?;
    tracing::debug!(
        user_id = message.get_str("user_id").unwrap_or_default(),
        "issued data key"
    );

    signed_reply(
        &state,
        SignedMessage::new()
            .with("request_id", json!(request_id.as_str()))
            .with("encryption_key", json!(wrapped)),
    )
}

/// Handler for `POST /data`: stores an upload encrypted under the data key.
pub async fn receive_data_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<SignedMessage>, ApiError> {
    let message = parse_message(body)?;
    let request_id = fresh_request_id(&state, &message)?;
    authorized_user(&state, &message).await?;
    let user_id = required(&message, "user_id")?.to_string();

    let payload = EncryptedPayload::from_shared_parts(
        required(&message, "data")?,
        state.data_key.as_ref().clone(),
        state.iv_mode,
    );
    let plaintext = payload
        .open_shared()
        .map_err(|e| ApiError::BadRequest(format!("cannot decrypt data: {e}")))?;

    let file_name = format!(
        "{}-{}.dat",
        Utc::now().format("%Y%m%dT%H%M%S%.6f"),
        user_id
    );
    let path = state.data_dir.join(&file_name);
    let bytes = plaintext.len();
    run_blocking(move || {
        write_atomic(&path, &plaintext, true)
            .map_err(|e| ApiError::InternalServerError(format!("storing data failed: {}", e)))
    })
    .await?;

    tracing::info!(user_id = %user_id, file = %file_name, bytes, "data received");

    signed_reply(
        &state,
        SignedMessage::new()
            .with("request_id", json!(request_id.as_str()))
            .with("result", json!(true)),
    )
}
