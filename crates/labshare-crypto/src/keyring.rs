//! The node's own signing key, shared between request handlers and the
//! rotation job.

use crate::keys::{KeyMaterial, KeyPair, KeySlot, PublicKey};
use crate::lock::KeyDirLock;
use crate::signature::SignedMessage;
use crate::CryptoError;
use std::sync::{Arc, RwLock};

/// Holds the current key pair in memory and on disk.
///
/// Signers take a cheap snapshot with [`NodeKeyring::current`]; rotation
/// swaps the pair under the write lock so a signer sees either the old pair
/// or the new one, never a mix. The keyring owns the directory's
/// [`KeyDirLock`], so no other process can change the slots underneath it.
#[derive(Debug)]
pub struct NodeKeyring {
    lock: KeyDirLock,
    key_bits: usize,
    current: RwLock<Arc<KeyPair>>,
}

impl NodeKeyring {
    /// Loads the current pair from the locked directory, generating one if
    /// none exists.
    ///
    /// Returns the keyring and whether a new pair was generated.
    pub fn open(lock: KeyDirLock, key_bits: usize) -> Result<(Self, bool), CryptoError> {
        let (pair, generated) = lock.material().load_or_generate(key_bits)?;
        let keyring = Self {
            lock,
            key_bits,
            current: RwLock::new(Arc::new(pair)),
        };
        Ok((keyring, generated))
    }

    pub fn material(&self) -> &KeyMaterial {
        self.lock.material()
    }

    /// Snapshot of the current key pair.
    pub fn current(&self) -> Arc<KeyPair> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn public_key(&self) -> PublicKey {
        self.current().public().clone()
    }

    /// Signs `message` with the current private key.
    pub fn sign(&self, message: &mut SignedMessage) -> Result<(), CryptoError> {
        message.sign(&self.current())
    }

    /// Replaces the current pair with a freshly generated one.
    ///
    /// The outgoing pair is moved to the old slot on disk and returned so the
    /// caller can sign the rotation announcement with it. If anything fails
    /// before the new pair is saved, the old pair is put back and stays
    /// current.
    pub fn replace_current(&self) -> Result<Arc<KeyPair>, CryptoError> {
        let fresh = KeyPair::generate(self.key_bits)?;

        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());

        self.material().rename_current_to_old()?;

        if let Err(e) = self.material().save(&fresh, KeySlot::Current) {
            tracing::error!(error = %e, "failed to save new key pair, restoring previous pair");
            if let Err(cleanup) = self.material().delete(KeySlot::Current) {
                tracing::error!(error = %cleanup, "failed to remove partial new key pair");
            }
            self.material().restore_old()?;
            return Err(CryptoError::RotationAborted(format!(
                "saving new key pair: {e}"
            )));
        }

        let old = std::mem::replace(&mut *guard, Arc::new(fresh));
        Ok(old)
    }

    /// Puts the old pair back as current, discarding whatever is in the
    /// current slot, and reloads it.
    pub fn restore_from_old(&self) -> Result<(), CryptoError> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        self.material().delete(KeySlot::Current)?;
        self.material().restore_old()?;
        *guard = Arc::new(self.material().load(KeySlot::Current)?);
        Ok(())
    }

    /// Loads the outgoing pair if one is on disk.
    pub fn old_pair(&self) -> Result<Option<KeyPair>, CryptoError> {
        if !self.material().exists(KeySlot::Old) {
            return Ok(None);
        }
        self.material().load(KeySlot::Old).map(Some)
    }

    /// Deletes the outgoing pair once the rotation has been announced.
    pub fn discard_old(&self) -> Result<(), CryptoError> {
        self.material().delete(KeySlot::Old)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    const TEST_BITS: usize = 1024;

    fn open_keyring(dir: &std::path::Path) -> NodeKeyring {
        let lock = KeyDirLock::acquire(KeyMaterial::new(dir)).unwrap();
        NodeKeyring::open(lock, TEST_BITS).unwrap().0
    }

    #[test]
    fn second_keyring_on_same_directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = open_keyring(dir.path());
        let before = keyring.public_key();

        assert!(matches!(
            KeyDirLock::acquire(KeyMaterial::new(dir.path())),
            Err(CryptoError::KeyDirLocked { .. })
        ));

        // The slots are untouched, so memory and disk still agree.
        let on_disk = keyring.material().load(KeySlot::Current).unwrap();
        assert_eq!(on_disk.public(), &before);

        drop(keyring);
        let reopened = open_keyring(dir.path());
        assert_eq!(reopened.public_key(), before);
    }

    #[test]
    fn concurrent_signatures_match_one_whole_pair() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = Arc::new(open_keyring(dir.path()));
        let first = keyring.public_key();
        let done = Arc::new(AtomicBool::new(false));

        let signers: Vec<_> = (0..4)
            .map(|i| {
                let keyring = keyring.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mut signed = Vec::new();
                    while !done.load(Ordering::Acquire) || signed.is_empty() {
                        let mut message = SignedMessage::new()
                            .with("node", json!("LabA"))
                            .with("seq", json!(format!("{i}-{}", signed.len())));
                        keyring.sign(&mut message).unwrap();
                        signed.push(message);
                    }
                    signed
                })
            })
            .collect();

        let old = keyring.replace_current().unwrap();
        done.store(true, Ordering::Release);
        assert_eq!(old.public(), &first);
        let second = keyring.public_key();

        for signer in signers {
            for message in signer.join().unwrap() {
                let by_first = message.verify(&first).unwrap();
                let by_second = message.verify(&second).unwrap();
                assert!(by_first ^ by_second, "signature must match exactly one pair");
            }
        }
    }

    #[test]
    fn replace_current_swaps_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = open_keyring(dir.path());
        let before = keyring.public_key();

        let old = keyring.replace_current().unwrap();
        assert_eq!(old.public(), &before);
        assert_ne!(keyring.public_key(), before);

        let on_disk = keyring.material().load(KeySlot::Current).unwrap();
        assert_eq!(on_disk.public(), &keyring.public_key());
        assert_eq!(keyring.old_pair().unwrap().unwrap().public(), &before);

        keyring.discard_old().unwrap();
        assert!(keyring.old_pair().unwrap().is_none());
    }

    #[test]
    fn replace_current_refuses_while_old_pair_pending() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = open_keyring(dir.path());
        keyring.replace_current().unwrap();
        let current = keyring.public_key();

        assert!(matches!(
            keyring.replace_current(),
            Err(CryptoError::RotationAborted(_))
        ));
        assert_eq!(keyring.public_key(), current);
        assert_eq!(
            keyring.material().load(KeySlot::Current).unwrap().public(),
            &current
        );
    }

    #[test]
    fn restore_from_old_reinstates_previous_pair() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = open_keyring(dir.path());
        let before = keyring.public_key();
        keyring.replace_current().unwrap();

        keyring.restore_from_old().unwrap();
        assert_eq!(keyring.public_key(), before);
        assert!(keyring.old_pair().unwrap().is_none());
    }

    #[test]
    fn signatures_follow_the_current_pair() {
        let dir = tempfile::tempdir().unwrap();
        let keyring = open_keyring(dir.path());

        let mut message = SignedMessage::new().with("node", json!("LabA"));
        keyring.sign(&mut message).unwrap();
        let first_key = keyring.public_key();
        assert!(message.verify(&first_key).unwrap());

        keyring.replace_current().unwrap();
        let mut message = SignedMessage::new().with("node", json!("LabA"));
        keyring.sign(&mut message).unwrap();
        assert!(!message.verify(&first_key).unwrap());
        assert!(message.verify(&keyring.public_key()).unwrap());
    }
}
