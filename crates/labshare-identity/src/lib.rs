//! User identities issued by this node and their expiry.
//!
//! A user's public key lives in `public_keys/public.<token>@<node>.key`.
//! Whether the identity is still valid is tracked separately in the
//! `identity_expiry` table: an identity is tracked the first time its key
//! file is observed and stays valid through its expiry date.

pub mod expiry;
pub mod registry;

pub use registry::{IdentityRegistry, SweepReport};

use labshare_crypto::CryptoError;
use thiserror::Error;

/// Errors produced by identity lookups and the expiry registry.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// No key file (or, for renewals, no expiry entry) exists for the identity.
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),

    /// The identity is tracked and its expiry date has passed.
    #[error("identity expired: {0}")]
    IdentityExpired(String),

    /// The identity was issued by another node.
    #[error("identity {identity} is not issued by {node}")]
    NotLocal { identity: String, node: String },

    /// A stored expiry date could not be parsed.
    #[error("invalid expiry date '{0}'")]
    InvalidExpiryDate(String),

    /// The key file could not be parsed.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// Reading or writing a key file failed.
    #[error("key file I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error.
    #[error("database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
}
