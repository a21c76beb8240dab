//! Error types for key handling, encryption, and signatures.

use std::path::PathBuf;

/// Errors that can occur in the crypto layer.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Local key material is absent.
    #[error("key material not found: {0}")]
    KeyNotFound(PathBuf),

    /// A key file exists but cannot be parsed, or its halves do not match.
    #[error("key material at {path} is corrupted: {reason}")]
    KeyCorrupted { path: PathBuf, reason: String },

    /// RSA key generation failed.
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// A key could not be encoded to or decoded from PEM.
    #[error("key encoding error: {0}")]
    KeyEncoding(String),

    /// Reading or writing key files failed.
    #[error("key storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The message has no `signature` field.
    #[error("message carries no signature")]
    MissingSignature,

    /// The `signature` field cannot be decoded.
    #[error("malformed signature: {0}")]
    MalformedSignature(String),

    /// The signature does not match the message and key.
    #[error("signature does not match")]
    SignatureMismatch,

    /// Stripped padding was inconsistent after decryption.
    #[error("invalid padding in decrypted payload")]
    PaddingError,

    /// Ciphertext is not valid hex or has an impossible length.
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// A symmetric key had the wrong length.
    #[error("symmetric key must be 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// RSA-OAEP wrap or unwrap failed.
    #[error("asymmetric operation failed: {0}")]
    Asymmetric(String),

    /// The message is not a JSON object.
    #[error("signed messages must be JSON objects")]
    NotAnObject,

    /// Another process owns the key directory.
    #[error("key directory {} is in use{}", .path.display(), held_by(.holder))]
    KeyDirLocked { path: PathBuf, holder: Option<u32> },

    /// Renaming the current key pair out of the way failed; nothing changed.
    #[error("key rotation aborted: {0}")]
    RotationAborted(String),
}

fn held_by(holder: &Option<u32>) -> String {
    holder.map(|pid| format!(" by process {pid}")).unwrap_or_default()
}
