//! Signing and verification of inter-node messages.
//!
//! A signature covers the canonical form of every field except
//! [`SIGNATURE_FIELD`]: SHA-256, then RSASSA-PKCS1-v1_5. On the wire the
//! signature is carried as base64 of the signature's decimal integer value,
//! which is the token format deployed nodes exchange.

use crate::codec::canonicalize;
use crate::keys::{KeyPair, PublicKey};
use crate::CryptoError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rsa::{BigUint, Pkcs1v15Sign};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Name of the field that carries the signature token.
pub const SIGNATURE_FIELD: &str = "signature";

/// A flat JSON object that can carry a signature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SignedMessage(Map<String, Value>);

impl SignedMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`SignedMessage::insert`].
    pub fn with(mut self, field: &str, value: Value) -> Self {
        self.insert(field, value);
        self
    }

    pub fn insert(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// The field as a string, if present and a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// The raw signature token, if the message has been signed.
    pub fn signature(&self) -> Option<&Value> {
        self.0.get(SIGNATURE_FIELD)
    }

    pub fn from_value(value: Value) -> Result<Self, CryptoError> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(CryptoError::NotAnObject),
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Canonical bytes of every field except the signature.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.0.clone();
        unsigned.remove(SIGNATURE_FIELD);
        canonicalize(&Value::Object(unsigned))
    }

    /// Signs the message with `pair`, replacing any existing signature.
    pub fn sign(&mut self, pair: &KeyPair) -> Result<(), CryptoError> {
        let token = sign(self, pair)?;
        self.0.insert(SIGNATURE_FIELD.to_string(), Value::String(token));
        Ok(())
    }

    /// See [`verify`].
    pub fn verify(&self, public: &PublicKey) -> Result<bool, CryptoError> {
        verify(self, public)
    }

    /// Like [`SignedMessage::verify`] but turns a wrong signature into
    /// [`CryptoError::SignatureMismatch`].
    pub fn verify_strict(&self, public: &PublicKey) -> Result<(), CryptoError> {
        if verify(self, public)? {
            Ok(())
        } else {
            Err(CryptoError::SignatureMismatch)
        }
    }
}

fn digest(message: &SignedMessage) -> Vec<u8> {
    Sha256::digest(message.canonical_bytes()).to_vec()
}

/// Produces the signature token for `message` without attaching it.
pub fn sign(message: &SignedMessage, pair: &KeyPair) -> Result<String, CryptoError> {
    let signature = pair
        .private()
        .sign_with_rng(&mut OsRng, Pkcs1v15Sign::new::<Sha256>(), &digest(message))
        .map_err(|e| CryptoError::Asymmetric(e.to_string()))?;
    let decimal = BigUint::from_bytes_be(&signature).to_string();
    Ok(STANDARD.encode(decimal))
}

/// Checks the signature carried by `message` against `public`.
///
/// Returns `Ok(false)` for a well-formed signature that does not match.
///
/// # Errors
///
/// [`CryptoError::MissingSignature`] if there is no signature field,
/// [`CryptoError::MalformedSignature`] if the token cannot be decoded.
pub fn verify(message: &SignedMessage, public: &PublicKey) -> Result<bool, CryptoError> {
    let token = match message.signature() {
        None => return Err(CryptoError::MissingSignature),
        Some(Value::String(token)) => token,
        Some(_) => {
            return Err(CryptoError::MalformedSignature(
                "signature is not a string".to_string(),
            ))
        }
    };

    let signature = decode_token(token, public.size())?;
    let Some(signature) = signature else {
        return Ok(false);
    };

    Ok(public
        .inner()
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest(message), &signature)
        .is_ok())
}

/// Decodes a token to big-endian bytes padded to the key size. `None` means
/// the integer cannot be a signature under a key of that size.
fn decode_token(token: &str, key_size: usize) -> Result<Option<Vec<u8>>, CryptoError> {
    let decoded = STANDARD
        .decode(token.trim())
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    let decimal = String::from_utf8(decoded)
        .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
    let value: BigUint = decimal
        .parse()
        .map_err(|_| CryptoError::MalformedSignature("not a decimal integer".to_string()))?;

    let bytes = value.to_bytes_be();
    if bytes.len() > key_size {
        return Ok(None);
    }
    let mut padded = vec![0u8; key_size - bytes.len()];
    padded.extend_from_slice(&bytes);
    Ok(Some(padded))
}
