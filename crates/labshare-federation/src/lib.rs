//! Node-to-node trust for labshare.
//!
//! Each node keeps a flat directory of its peers (`nodes/<name>.json` plus
//! the peer's public key) and talks to them with signed JSON messages. This
//! crate covers both directions of that conversation from the local node's
//! point of view:
//!
//! - [`FederationClient`] asks a user's home node whether the user is still
//!   authorized, pings every peer on the health-probe timer, and announces
//!   newly added nodes.
//! - [`TrustResolver`] decides whether a signed request from a user is
//!   genuine, looking the user's key up locally or through the home node.
//! - [`KeyRotator`] replaces the node's own key pair and announces the new
//!   public key, signed with the outgoing key.
//! - [`Requester`] is the client a user runs to query a node privately.

pub mod client;
pub mod db;
pub mod directory;
pub mod requester;
pub mod rotation;
pub mod trust;

pub use client::{DenialReason, FederationClient, FederationSettings, RemoteAuthorization};
pub use directory::NodeDirectory;
pub use requester::Requester;
pub use rotation::{reconcile_key_material, KeyRotator, ReconcileOutcome, RotationReport, RotationState};
pub use trust::TrustResolver;

use labshare_crypto::CryptoError;
use labshare_identity::IdentityError;
use thiserror::Error;

/// Errors from federation operations.
#[derive(Debug, Error)]
pub enum FederationError {
    /// The peer could not be reached within the timeout.
    #[error("peer {node} unreachable: {reason}")]
    PeerUnreachable { node: String, reason: String },

    /// The peer answered with a non-success status.
    #[error("peer {node} rejected the request with status {status}")]
    RemoteRejected { node: String, status: u16 },

    /// The peer answered with something that is not a valid response.
    #[error("invalid response from {node}: {reason}")]
    InvalidResponse { node: String, reason: String },

    /// No directory entry for the node.
    #[error("unknown node: {0}")]
    UnknownNode(String),

    /// The directory already holds a node with this name.
    #[error("node already known: {0}")]
    NodeExists(String),

    /// A node name that cannot be stored in the directory.
    #[error("invalid node name: {0}")]
    InvalidNodeName(String),

    /// A request lacks a field the operation needs.
    #[error("missing or invalid field: {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("database error: {0}")]
    DbError(#[from] rusqlite::Error),

    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("directory I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

/// Errors from key rotation.
#[derive(Debug, Error)]
pub enum RotationError {
    /// A rotation is already in progress.
    #[error("a key rotation is already in progress")]
    AlreadyRunning,

    /// The key pair could not be replaced; the previous pair is still current.
    #[error("key rotation aborted: {0}")]
    Aborted(#[from] CryptoError),

    #[error(transparent)]
    Federation(#[from] FederationError),
}

/// Runs blocking SQLite or filesystem work off the async runtime.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, FederationError>
where
    F: FnOnce() -> Result<T, FederationError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FederationError::Task(e.to_string()))?
}
