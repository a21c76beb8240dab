//! Encrypted payloads.
//!
//! Private query results are sealed under a one-time key wrapped for the
//! requester. Uploaded data uses the node's shared data key instead, which
//! the uploader fetched wrapped for its own key beforehand.

use crate::codec::{self, IvMode, SymmetricKey};
use crate::keys::{KeyPair, PublicKey};
use crate::CryptoError;

/// How the receiver of an [`EncryptedPayload`] obtains the AES key.
#[derive(Debug, Clone)]
pub enum DecryptionKey {
    /// Both sides already hold the key.
    Shared(SymmetricKey),
    /// A one-time key wrapped with the recipient's RSA public key, hex encoded.
    Wrapped(String),
}

/// Hex ciphertext together with the means to decrypt it.
///
/// Built per response and never persisted.
#[derive(Debug, Clone)]
pub struct EncryptedPayload {
    ciphertext: String,
    key: DecryptionKey,
    iv_mode: IvMode,
}

impl EncryptedPayload {
    /// Encrypts `plaintext` under a fresh one-time key and wraps that key for
    /// `recipient`.
    pub fn seal(
        plaintext: &[u8],
        recipient: &PublicKey,
        iv_mode: IvMode,
    ) -> Result<Self, CryptoError> {
        let one_time = SymmetricKey::generate();
        let ciphertext = codec::encrypt_symmetric(plaintext, &one_time, iv_mode);
        let wrapped = wrap_shared_key(&one_time, recipient)?;
        Ok(Self {
            ciphertext,
            key: DecryptionKey::Wrapped(wrapped),
            iv_mode,
        })
    }

    /// Encrypts `plaintext` under a key both sides already share.
    pub fn with_shared_key(plaintext: &[u8], key: &SymmetricKey, iv_mode: IvMode) -> Self {
        Self {
            ciphertext: codec::encrypt_symmetric(plaintext, key, iv_mode),
            key: DecryptionKey::Shared(key.clone()),
            iv_mode,
        }
    }

    /// Rebuilds a received ciphertext that was encrypted under `key`.
    pub fn from_shared_parts(
        ciphertext: impl Into<String>,
        key: SymmetricKey,
        iv_mode: IvMode,
    ) -> Self {
        Self {
            ciphertext: ciphertext.into(),
            key: DecryptionKey::Shared(key),
            iv_mode,
        }
    }

    /// Rebuilds a received payload from its wire fields.
    pub fn from_parts(
        ciphertext: impl Into<String>,
        wrapped_key: impl Into<String>,
        iv_mode: IvMode,
    ) -> Self {
        Self {
            ciphertext: ciphertext.into(),
            key: DecryptionKey::Wrapped(wrapped_key.into()),
            iv_mode,
        }
    }

    pub fn ciphertext(&self) -> &str {
        &self.ciphertext
    }

    /// The hex-encoded wrapped key, if this payload carries one.
    pub fn wrapped_key(&self) -> Option<&str> {
        match &self.key {
            DecryptionKey::Wrapped(wrapped) => Some(wrapped),
            DecryptionKey::Shared(_) => None,
        }
    }

    /// Decrypts with the recipient's private key.
    pub fn open(&self, recipient: &KeyPair) -> Result<Vec<u8>, CryptoError> {
        let key = match &self.key {
            DecryptionKey::Wrapped(wrapped) => unwrap_shared_key(wrapped, recipient)?,
            DecryptionKey::Shared(key) => key.clone(),
        };
        codec::decrypt_symmetric(&self.ciphertext, &key, self.iv_mode)
    }

    /// Decrypts a payload built with a shared key.
    ///
    /// # Errors
    ///
    /// [`CryptoError::Asymmetric`] if the payload carries a wrapped key
    /// instead, [`CryptoError::PaddingError`] when a wrong key leaves
    /// inconsistent padding.
    pub fn open_shared(&self) -> Result<Vec<u8>, CryptoError> {
        match &self.key {
            DecryptionKey::Shared(key) => {
                codec::decrypt_symmetric(&self.ciphertext, key, self.iv_mode)
            }
            DecryptionKey::Wrapped(_) => Err(CryptoError::Asymmetric(
                "payload key is wrapped for a recipient".to_string(),
            )),
        }
    }
}

/// Encrypts `key` for `recipient` with RSA-OAEP, hex encoded.
pub fn wrap_shared_key(key: &SymmetricKey, recipient: &PublicKey) -> Result<String, CryptoError> {
    codec::encrypt_asymmetric(key.as_bytes(), recipient)
}

/// Reverses [`wrap_shared_key`].
pub fn unwrap_shared_key(wrapped: &str, recipient: &KeyPair) -> Result<SymmetricKey, CryptoError> {
    SymmetricKey::from_bytes(&codec::decrypt_asymmetric(wrapped, recipient)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_payload_opens_only_for_recipient() {
        let requester = KeyPair::generate(1024).unwrap();
        let rows = br#"[["21",9825797,"rs123","A","G"]]"#;

        let payload = EncryptedPayload::seal(rows, requester.public(), IvMode::Fixed).unwrap();
        assert!(payload.wrapped_key().is_some());

        let received = EncryptedPayload::from_parts(
            payload.ciphertext(),
            payload.wrapped_key().unwrap(),
            IvMode::Fixed,
        );
        assert_eq!(received.open(&requester).unwrap(), rows);

        let stranger = KeyPair::generate(1024).unwrap();
        assert!(received.open(&stranger).is_err());
    }

    #[test]
    fn each_seal_uses_a_fresh_key() {
        let requester = KeyPair::generate(1024).unwrap();
        let a = EncryptedPayload::seal(b"rows", requester.public(), IvMode::Fixed).unwrap();
        let b = EncryptedPayload::seal(b"rows", requester.public(), IvMode::Fixed).unwrap();
        assert_ne!(a.ciphertext(), b.ciphertext());
    }

    #[test]
    fn shared_key_payload_opens_with_the_same_key_only() {
        let uploader = KeyPair::generate(1024).unwrap();
        let node_key = SymmetricKey::generate();

        let wrapped = wrap_shared_key(&node_key, uploader.public()).unwrap();
        let fetched = unwrap_shared_key(&wrapped, &uploader).unwrap();
        assert_eq!(fetched.as_bytes(), node_key.as_bytes());

        let sent = EncryptedPayload::with_shared_key(b"sample 17", &fetched, IvMode::Random);
        assert!(sent.wrapped_key().is_none());

        let received =
            EncryptedPayload::from_shared_parts(sent.ciphertext(), node_key, IvMode::Random);
        assert_eq!(received.open_shared().unwrap(), b"sample 17");

        let stale =
            EncryptedPayload::from_shared_parts(sent.ciphertext(), SymmetricKey::generate(), IvMode::Random);
        assert_ne!(stale.open_shared().ok().as_deref(), Some(&b"sample 17"[..]));
    }

    #[test]
    fn wrapped_payload_has_no_shared_opening() {
        let requester = KeyPair::generate(1024).unwrap();
        let payload = EncryptedPayload::seal(b"rows", requester.public(), IvMode::Fixed).unwrap();
        assert!(matches!(
            payload.open_shared(),
            Err(CryptoError::Asymmetric(_))
        ));
    }
}
