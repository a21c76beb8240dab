//! RSA key pairs and their on-disk layout.
//!
//! A node keeps its own pair under `keys/`:
//!
//! | File | Contents |
//! |------|----------|
//! | `private.key` | current private key, PKCS#1 PEM |
//! | `public.key` | current public key, SPKI PEM |
//! | `private.old.key`, `public.old.key` | outgoing pair, only during rotation |
//! | `user_id` | the identity a requester holds (client side only) |
//!
//! The private key is the node's trust anchor: losing it de-authorizes the
//! node until it is re-registered with its peers.

use crate::CryptoError;
use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Default RSA modulus size for node and user keys.
pub const DEFAULT_KEY_BITS: usize = 2048;

const USER_ID_FILE: &str = "user_id";

/// An RSA public key as exchanged between nodes.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey(RsaPublicKey);

impl PublicKey {
    /// Parses a PEM public key. Both SPKI (`BEGIN PUBLIC KEY`) and PKCS#1
    /// (`BEGIN RSA PUBLIC KEY`) encodings are accepted.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        let pem = pem.trim();
        RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map(Self)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
    }

    /// Encodes the key as SPKI PEM.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        self.0
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
    }

    /// Short hex fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        let modulus = self.0.n().to_bytes_be();
        hex::encode(&Sha256::digest(&modulus)[..8])
    }

    /// Modulus size in bytes.
    pub fn size(&self) -> usize {
        self.0.size()
    }

    pub(crate) fn inner(&self) -> &RsaPublicKey {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.fingerprint()).finish()
    }
}

/// A private key together with its public half.
#[derive(Clone)]
pub struct KeyPair {
    private: RsaPrivateKey,
    public: PublicKey,
}

impl KeyPair {
    /// Generates a fresh RSA key pair.
    pub fn generate(bits: usize) -> Result<Self, CryptoError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    /// Parses a PEM private key (PKCS#1 or PKCS#8) and derives its public half.
    pub fn from_private_pem(pem: &str) -> Result<Self, CryptoError> {
        let pem = pem.trim();
        let private = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(Self::from_private(private))
    }

    fn from_private(private: RsaPrivateKey) -> Self {
        let public = PublicKey(private.to_public_key());
        Self { private, public }
    }

    /// Encodes the private key as PKCS#1 PEM.
    pub fn private_pem(&self) -> Result<String, CryptoError> {
        let pem = self
            .private
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        Ok(pem.as_str().to_owned())
    }

    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    pub(crate) fn private(&self) -> &RsaPrivateKey {
        &self.private
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Which of the two key-pair slots under `keys/` to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    /// The pair used for all signing.
    Current,
    /// The outgoing pair kept only while a rotation is announced.
    Old,
}

/// File-backed storage for a node's (or a requester's) own key pair.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    keys_dir: PathBuf,
}

impl KeyMaterial {
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            keys_dir: keys_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.keys_dir
    }

    /// Returns `(private, public)` file paths for a slot.
    pub fn paths(&self, slot: KeySlot) -> (PathBuf, PathBuf) {
        match slot {
            KeySlot::Current => (
                self.keys_dir.join("private.key"),
                self.keys_dir.join("public.key"),
            ),
            KeySlot::Old => (
                self.keys_dir.join("private.old.key"),
                self.keys_dir.join("public.old.key"),
            ),
        }
    }

    /// Whether both halves of the slot are on disk.
    pub fn exists(&self, slot: KeySlot) -> bool {
        let (private, public) = self.paths(slot);
        private.is_file() && public.is_file()
    }

    /// Whether either half of the slot is on disk.
    pub fn has_any(&self, slot: KeySlot) -> bool {
        let (private, public) = self.paths(slot);
        private.is_file() || public.is_file()
    }

    /// Loads the pair in `slot`.
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyNotFound`] if either half is missing,
    /// [`CryptoError::KeyCorrupted`] if a half does not parse or the public
    /// half does not belong to the private half.
    pub fn load(&self, slot: KeySlot) -> Result<KeyPair, CryptoError> {
        let (private_path, public_path) = self.paths(slot);

        let private_pem = read_key_file(&private_path)?;
        let pair = KeyPair::from_private_pem(&private_pem).map_err(|e| CryptoError::KeyCorrupted {
            path: private_path.clone(),
            reason: e.to_string(),
        })?;

        let public_pem = read_key_file(&public_path)?;
        let public = PublicKey::from_pem(&public_pem).map_err(|e| CryptoError::KeyCorrupted {
            path: public_path.clone(),
            reason: e.to_string(),
        })?;
        if &public != pair.public() {
            return Err(CryptoError::KeyCorrupted {
                path: public_path,
                reason: "public key does not match private key".to_string(),
            });
        }

        Ok(pair)
    }

    /// Writes both halves of `pair` into `slot`, replacing whatever is there.
    pub fn save(&self, pair: &KeyPair, slot: KeySlot) -> Result<(), CryptoError> {
        fs::create_dir_all(&self.keys_dir)?;
        let (private_path, public_path) = self.paths(slot);
        write_atomic(&private_path, pair.private_pem()?.as_bytes(), true)?;
        write_atomic(&public_path, pair.public().to_pem()?.as_bytes(), false)?;
        Ok(())
    }

    /// Loads the current pair, generating and saving one only if none exists.
    ///
    /// Returns the pair and whether it was freshly generated. An existing key
    /// is never overwritten; a private key without its public file gets the
    /// public file re-derived.
    pub fn load_or_generate(&self, bits: usize) -> Result<(KeyPair, bool), CryptoError> {
        let (private_path, public_path) = self.paths(KeySlot::Current);

        match (private_path.is_file(), public_path.is_file()) {
            (true, true) => Ok((self.load(KeySlot::Current)?, false)),
            (true, false) => {
                let pem = read_key_file(&private_path)?;
                let pair = KeyPair::from_private_pem(&pem).map_err(|e| {
                    CryptoError::KeyCorrupted {
                        path: private_path.clone(),
                        reason: e.to_string(),
                    }
                })?;
                tracing::warn!(path = %public_path.display(), "public key missing, re-deriving from private key");
                write_atomic(&public_path, pair.public().to_pem()?.as_bytes(), false)?;
                Ok((pair, false))
            }
            (false, true) => Err(CryptoError::KeyCorrupted {
                path: private_path,
                reason: "public key present without its private key".to_string(),
            }),
            (false, false) => {
                let pair = KeyPair::generate(bits)?;
                self.save(&pair, KeySlot::Current)?;
                tracing::info!(fingerprint = %pair.public().fingerprint(), "generated new node key pair");
                Ok((pair, true))
            }
        }
    }

    /// Moves the current pair into the old slot.
    ///
    /// Either both halves move or neither does: if the second rename fails
    /// the first is undone.
    ///
    /// # Errors
    ///
    /// [`CryptoError::RotationAborted`] if an old pair is already present or
    /// a rename fails.
    pub fn rename_current_to_old(&self) -> Result<(), CryptoError> {
        if self.has_any(KeySlot::Old) {
            return Err(CryptoError::RotationAborted(
                "an old key pair is already present".to_string(),
            ));
        }

        let (current_private, current_public) = self.paths(KeySlot::Current);
        let (old_private, old_public) = self.paths(KeySlot::Old);

        fs::rename(&current_public, &old_public)
            .map_err(|e| CryptoError::RotationAborted(format!("renaming public key: {e}")))?;

        if let Err(e) = fs::rename(&current_private, &old_private) {
            if let Err(undo) = fs::rename(&old_public, &current_public) {
                tracing::error!(error = %undo, "failed to move public key back after aborted rotation");
            }
            return Err(CryptoError::RotationAborted(format!(
                "renaming private key: {e}"
            )));
        }

        Ok(())
    }

    /// Moves every half present in the old slot back into the current slot.
    ///
    /// Used to recover from a rotation interrupted before a new pair was
    /// written.
    pub fn restore_old(&self) -> Result<(), CryptoError> {
        let (current_private, current_public) = self.paths(KeySlot::Current);
        let (old_private, old_public) = self.paths(KeySlot::Old);
        if old_public.is_file() {
            fs::rename(&old_public, &current_public)?;
        }
        if old_private.is_file() {
            fs::rename(&old_private, &current_private)?;
        }
        Ok(())
    }

    /// Removes both halves of `slot`. Missing files are not an error.
    pub fn delete(&self, slot: KeySlot) -> Result<(), CryptoError> {
        let (private, public) = self.paths(slot);
        for path in [private, public] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Records the identity this key pair was registered under.
    pub fn save_user_id(&self, user_id: &str) -> Result<(), CryptoError> {
        fs::create_dir_all(&self.keys_dir)?;
        write_atomic(&self.keys_dir.join(USER_ID_FILE), user_id.as_bytes(), false)?;
        Ok(())
    }

    /// Reads the identity recorded by [`KeyMaterial::save_user_id`].
    pub fn load_user_id(&self) -> Result<String, CryptoError> {
        Ok(read_key_file(&self.keys_dir.join(USER_ID_FILE))?
            .trim()
            .to_string())
    }
}

fn read_key_file(path: &Path) -> Result<String, CryptoError> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            CryptoError::KeyNotFound(path.to_path_buf())
        } else {
            CryptoError::Io(e)
        }
    })
}

/// Writes via a sibling temp file and a rename so readers never see a
/// truncated file. `private` restricts the file to its owner.
pub fn write_atomic(path: &Path, contents: &[u8], private: bool) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents)?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    let _ = private;

    fs::rename(&tmp, path)
}
