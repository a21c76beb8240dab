//! Node-to-node and user key endpoints.

use crate::AppState;
use axum::{
    extract::{Extension, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{NaiveDate, Utc};
use labshare_crypto::{CryptoError, PublicKey, SignedMessage};
use labshare_federation::FederationError;
use labshare_identity::IdentityError;
use labshare_types::{Identity, NodeAvailability, NodeRecord, RequestId};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("too many requests: {0}")]
    TooManyRequests(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::InternalServerError(msg) => {
                tracing::error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<CryptoError> for ApiError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::MissingSignature
            | CryptoError::MalformedSignature(_)
            | CryptoError::NotAnObject
            | CryptoError::KeyEncoding(_) => ApiError::BadRequest(e.to_string()),
            CryptoError::SignatureMismatch => ApiError::Forbidden(e.to_string()),
            _ => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::UnknownIdentity(_) => ApiError::NotFound(e.to_string()),
            IdentityError::IdentityExpired(_) => ApiError::Forbidden(e.to_string()),
            IdentityError::NotLocal { .. } => ApiError::BadRequest(e.to_string()),
            IdentityError::Crypto(inner) => inner.into(),
            _ => ApiError::InternalServerError(e.to_string()),
        }
    }
}

impl From<FederationError> for ApiError {
    fn from(e: FederationError) -> Self {
        match e {
            FederationError::MissingField(_) | FederationError::InvalidNodeName(_) => {
                ApiError::BadRequest(e.to_string())
            }
            FederationError::UnknownNode(_) => ApiError::NotFound(e.to_string()),
            FederationError::NodeExists(_) => ApiError::Conflict(e.to_string()),
            FederationError::Crypto(inner) => inner.into(),
            FederationError::Identity(inner) => inner.into(),
            _ => ApiError::InternalServerError(e.to_string()),
        }
    }
}

pub(crate) fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub(crate) fn parse_message(body: Value) -> Result<SignedMessage, ApiError> {
    Ok(SignedMessage::from_value(body)?)
}

pub(crate) fn required<'a>(
    message: &'a SignedMessage,
    field: &'static str,
) -> Result<&'a str, ApiError> {
    message
        .get_str(field)
        .ok_or_else(|| ApiError::BadRequest(format!("missing field '{field}'")))
}

pub(crate) fn parse_identity(message: &SignedMessage) -> Result<Identity, ApiError> {
    required(message, "user_id")?
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))
}

fn parse_public_key(message: &SignedMessage) -> Result<PublicKey, ApiError> {
    PublicKey::from_pem(required(message, "public_key")?)
        .map_err(|e| ApiError::BadRequest(format!("invalid public_key: {e}")))
}

/// Rejects requests whose id is missing, malformed, or too old.
pub(crate) fn fresh_request_id(
    state: &AppState,
    message: &SignedMessage,
) -> Result<RequestId, ApiError> {
    let request_id = RequestId::from_raw(required(message, "request_id")?);
    if !request_id.is_fresh(Utc::now().naive_utc(), state.request_max_age_seconds) {
        tracing::info!(request_id = %request_id, "rejected stale or malformed request id");
        return Err(ApiError::Forbidden("stale or malformed request_id".to_string()));
    }
    Ok(request_id)
}

/// The key of the user who signed `message`, if that user is currently
/// authorized here or at their home node.
pub(crate) async fn authorized_user(
    state: &AppState,
    message: &SignedMessage,
) -> Result<PublicKey, ApiError> {
    match state.trust.verify_for_identity(message).await? {
        (true, Some(key)) => Ok(key),
        _ => Err(ApiError::Forbidden("requester is not authorized".to_string())),
    }
}

/// Checks that `message` was signed by the stored key of `node`.
async fn verify_from_node(
    state: &AppState,
    message: &SignedMessage,
    node: &str,
) -> Result<(), ApiError> {
    let directory = state.directory.clone();
    let name = node.to_string();
    let key = run_blocking(move || Ok(directory.public_key(&name)?)).await?;
    if !message.verify(&key)? {
        tracing::info!(node, "rejected message with invalid node signature");
        return Err(ApiError::Forbidden(format!(
            "signature does not match key of {node}"
        )));
    }
    Ok(())
}

pub(crate) fn signed_reply(
    state: &AppState,
    mut reply: SignedMessage,
) -> Result<Json<SignedMessage>, ApiError> {
    state.keyring.sign(&mut reply)?;
    Ok(Json(reply))
}

pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))?
}

/// Handler for `POST /check-node`: a peer's signed health probe.
pub async fn check_node_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<SignedMessage>, ApiError> {
    let message = parse_message(body)?;
    let request_node = required(&message, "request_node")?;
    verify_from_node(&state, &message, request_node).await?;
    let request_id = fresh_request_id(&state, &message)?;

    tracing::debug!(node = request_node, "answered health probe");
    signed_reply(
        &state,
        SignedMessage::new()
            .with("result", json!(true))
            .with("node", json!(state.node_name))
            .with("request_id", json!(request_id.as_str())),
    )
}

/// Handler for `POST /check-user`: a peer asks whether one of our users is
/// still authorized. Answers with the user's public key, or `false`.
pub async fn check_user_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<SignedMessage>, ApiError> {
    let message = parse_message(body)?;
    let request_node = required(&message, "request_node")?;
    verify_from_node(&state, &message, request_node).await?;
    let request_id = fresh_request_id(&state, &message)?;

    let identity = parse_identity(&message)?;
    if !identity.is_home(&state.node_name) {
        return Err(ApiError::BadRequest(format!(
            "{identity} was not issued by {}",
            state.node_name
        )));
    }

    let result = match state.trust.lookup_local(&identity, today()).await? {
        Some(key) => json!(key.to_pem()?),
        None => json!(false),
    };
    tracing::info!(
        identity = %identity,
        requester = request_node,
        authorized = result.is_string(),
        "answered authorization check"
    );

    signed_reply(
        &state,
        SignedMessage::new()
            .with("result", result)
            .with("request_id", json!(request_id.as_str())),
    )
}

/// Handler for `POST /update-keys`: a peer announces its new public key,
/// signed with the key we currently hold for it.
pub async fn update_keys_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<SignedMessage>, ApiError> {
    let message = parse_message(body)?;
    let node = required(&message, "node")?;
    verify_from_node(&state, &message, node).await?;
    let new_key = parse_public_key(&message)?;

    let directory = state.directory.clone();
    let name = node.to_string();
    let key = new_key.clone();
    run_blocking(move || Ok(directory.update_key(&name, &key)?)).await?;
    tracing::info!(node, fingerprint = %new_key.fingerprint(), "peer key updated");

    let mut reply = SignedMessage::new().with("result", json!(true));
    if let Some(request_id) = message.get_str("request_id") {
        reply.insert("request_id", json!(request_id));
    }
    signed_reply(&state, reply)
}

/// Handler for `POST /add-node`: a known peer introduces a new node.
pub async fn add_node_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<SignedMessage>, ApiError> {
    let message = parse_message(body)?;
    let request_node = required(&message, "request_node")?;
    verify_from_node(&state, &message, request_node).await?;

    let record = NodeRecord {
        laboratory_name: required(&message, "laboratory-name")?.to_string(),
        address: required(&message, "address")?.to_string(),
    };
    if record.laboratory_name == state.node_name {
        return Err(ApiError::BadRequest("a node cannot be added to itself".to_string()));
    }
    let key = parse_public_key(&message)?;

    let directory = state.directory.clone();
    let stored = record.clone();
    run_blocking(move || Ok(directory.register(&stored, &key)?)).await?;
    tracing::info!(
        node = %record.laboratory_name,
        address = %record.address,
        introduced_by = request_node,
        "node added by peer"
    );

    signed_reply(&state, SignedMessage::new().with("result", json!(true)))
}

/// Handler for `POST /update-user-key`: a user replaces their key, signing
/// the request with the current one.
pub async fn update_user_key_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<SignedMessage>, ApiError> {
    let message = parse_message(body)?;
    let identity = parse_identity(&message)?;
    if !identity.is_home(&state.node_name) {
        return Err(ApiError::BadRequest(format!(
            "{identity} was not issued by {}",
            state.node_name
        )));
    }

    let today = today();
    let Some(current) = state.trust.lookup_local(&identity, today).await? else {
        return Err(ApiError::Forbidden(format!("{identity} is not authorized")));
    };
    if !message.verify(&current)? {
        tracing::info!(identity = %identity, "rejected key update with invalid signature");
        return Err(ApiError::Forbidden("signature does not match user key".to_string()));
    }
    let new_key = parse_public_key(&message)?;

    let state_clone = state.clone();
    let expires_on = run_blocking(move || {
        let conn = state_clone
            .pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        Ok(state_clone
            .registry
            .replace_user_key(&conn, &identity, &new_key, today)?)
    })
    .await?;

    signed_reply(
        &state,
        SignedMessage::new()
            .with("result", json!(true))
            .with("expires_on", json!(expires_on.to_string())),
    )
}

/// Handler for `GET /nodes`: the last availability snapshot.
pub async fn list_nodes_handler(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<Vec<NodeAvailability>>, ApiError> {
    let nodes = run_blocking(move || {
        let conn = state
            .pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        labshare_federation::db::list_availability(&conn)
            .map_err(|e| ApiError::InternalServerError(format!("db query failed: {}", e)))
    })
    .await?;

    Ok(Json(nodes))
}
