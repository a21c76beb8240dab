//! Canonical serialization and payload encryption.
//!
//! Symmetric encryption is AES-256-CBC over block-padded plaintext, hex
//! encoded on the wire. In [`IvMode::Fixed`] every message uses the same IV
//! ([`FIXED_IV`]), which is what deployed peers expect. [`IvMode::Random`]
//! draws a fresh IV per message and prepends it to the ciphertext; both ends
//! of a payload must agree on the mode.

use crate::keys::{KeyPair, PublicKey};
use crate::CryptoError;
use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::Oaep;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::fmt;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// IV shared by every node running in [`IvMode::Fixed`].
pub const FIXED_IV: [u8; 16] = *b"This is an IV456";

const BLOCK_SIZE: usize = 16;
const KEY_LEN: usize = 32;

/// How the AES-CBC initialization vector is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IvMode {
    /// The constant [`FIXED_IV`]; ciphertext is `hex(ct)`.
    #[default]
    Fixed,
    /// A random IV per message; ciphertext is `hex(iv || ct)`.
    Random,
}

impl fmt::Display for IvMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IvMode::Fixed => f.write_str("fixed"),
            IvMode::Random => f.write_str("random"),
        }
    }
}

/// A 256-bit AES key.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Draws a fresh key from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Serializes `value` with object keys sorted at every level and no
/// whitespace. The output depends only on the value, never on insertion
/// order.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out.into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}

/// Pads to a whole number of blocks. Every pad byte holds the pad length;
/// aligned input gets a full extra block.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let pad_len = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut padded = Vec::with_capacity(data.len() + pad_len);
    padded.extend_from_slice(data);
    padded.resize(data.len() + pad_len, pad_len as u8);
    padded
}

/// Strips padding added by [`pad`].
///
/// # Errors
///
/// [`CryptoError::PaddingError`] if the length is not a whole number of
/// blocks or the pad bytes are inconsistent.
pub fn unpad(data: &[u8]) -> Result<&[u8], CryptoError> {
    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::PaddingError);
    }
    let pad_len = data[data.len() - 1] as usize;
    if pad_len == 0 || pad_len > BLOCK_SIZE {
        return Err(CryptoError::PaddingError);
    }
    let (body, padding) = data.split_at(data.len() - pad_len);
    if padding.iter().any(|&b| b as usize != pad_len) {
        return Err(CryptoError::PaddingError);
    }
    Ok(body)
}

/// Encrypts `plaintext` with AES-256-CBC and returns hex ciphertext.
pub fn encrypt_symmetric(plaintext: &[u8], key: &SymmetricKey, mode: IvMode) -> String {
    let iv = match mode {
        IvMode::Fixed => FIXED_IV,
        IvMode::Random => {
            let mut iv = [0u8; BLOCK_SIZE];
            OsRng.fill_bytes(&mut iv);
            iv
        }
    };

    let ciphertext = Aes256CbcEnc::new(&key.0.into(), &iv.into())
        .encrypt_padded_vec_mut::<NoPadding>(&pad(plaintext));

    match mode {
        IvMode::Fixed => hex::encode(ciphertext),
        IvMode::Random => {
            let mut framed = iv.to_vec();
            framed.extend_from_slice(&ciphertext);
            hex::encode(framed)
        }
    }
}

/// Reverses [`encrypt_symmetric`].
///
/// A wrong key almost always surfaces as [`CryptoError::PaddingError`]; it
/// can never yield the original plaintext.
pub fn decrypt_symmetric(
    ciphertext_hex: &str,
    key: &SymmetricKey,
    mode: IvMode,
) -> Result<Vec<u8>, CryptoError> {
    let raw = hex::decode(ciphertext_hex.trim())
        .map_err(|e| CryptoError::InvalidCiphertext(e.to_string()))?;

    let (iv, body) = match mode {
        IvMode::Fixed => (FIXED_IV, raw.as_slice()),
        IvMode::Random => {
            if raw.len() < BLOCK_SIZE {
                return Err(CryptoError::InvalidCiphertext(
                    "ciphertext shorter than its IV".to_string(),
                ));
            }
            let (iv, body) = raw.split_at(BLOCK_SIZE);
            let mut fixed = [0u8; BLOCK_SIZE];
            fixed.copy_from_slice(iv);
            (fixed, body)
        }
    };

    if body.is_empty() || body.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidCiphertext(format!(
            "length {} is not a whole number of blocks",
            body.len()
        )));
    }

    let padded = Aes256CbcDec::new(&key.0.into(), &iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(body)
        .map_err(|_| CryptoError::PaddingError)?;

    unpad(&padded).map(<[u8]>::to_vec)
}

/// Encrypts a short secret under `recipient` with RSA-OAEP (SHA-256).
pub fn encrypt_asymmetric(plaintext: &[u8], recipient: &PublicKey) -> Result<String, CryptoError> {
    let ciphertext = recipient
        .inner()
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| CryptoError::Asymmetric(e.to_string()))?;
    Ok(hex::encode(ciphertext))
}

/// Reverses [`encrypt_asymmetric`] with the recipient's private key.
pub fn decrypt_asymmetric(ciphertext_hex: &str, pair: &KeyPair) -> Result<Vec<u8>, CryptoError> {
    let raw = hex::decode(ciphertext_hex.trim())
        .map_err(|e| CryptoError::InvalidCiphertext(e.to_string()))?;
    pair.private()
        .decrypt(Oaep::new::<Sha256>(), &raw)
        .map_err(|e| CryptoError::Asymmetric(e.to_string()))
}
