//! Key material, message codec, and signatures for labshare nodes.
//!
//! Every message exchanged between nodes is a flat JSON object signed over
//! its canonical form (keys sorted, compact encoding, `signature` field
//! excluded). Private query results travel as AES-CBC ciphertext whose
//! one-time key is wrapped with the requester's RSA public key.
//!
//! # Modules
//!
//! - [`keys`]: RSA key pairs and their on-disk layout.
//! - [`keyring`]: the node's current key pair, shared between signers and
//!   the rotation job.
//! - [`lock`]: exclusive ownership of a key directory across processes.
//! - [`codec`]: canonical serialization and symmetric/asymmetric encryption.
//! - [`payload`]: encrypted query results and uploads.
//! - [`signature`]: signing and verifying [`SignedMessage`]s.

mod error;
pub mod codec;
pub mod keyring;
pub mod keys;
pub mod lock;
pub mod payload;
pub mod signature;

pub use codec::{canonicalize, IvMode, SymmetricKey};
pub use error::CryptoError;
pub use keyring::NodeKeyring;
pub use lock::KeyDirLock;
pub use keys::{KeyMaterial, KeyPair, KeySlot, PublicKey, DEFAULT_KEY_BITS};
pub use payload::{unwrap_shared_key, wrap_shared_key, EncryptedPayload};
pub use signature::{sign, verify, SignedMessage, SIGNATURE_FIELD};
