//! Exclusive ownership of a key directory.
//!
//! Only one process may hold a node's key slots at a time: the running
//! server, or an offline admin command. The lock is an advisory `flock` on
//! `keys/.lock` that lives as long as the [`KeyDirLock`] value, so a crashed
//! holder never leaves a stale lock behind.

use crate::keys::KeyMaterial;
use crate::CryptoError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

const LOCK_FILE: &str = ".lock";

/// Held for as long as this process owns the key directory.
#[derive(Debug)]
pub struct KeyDirLock {
    file: File,
    material: KeyMaterial,
}

impl KeyDirLock {
    /// Takes the lock without waiting.
    ///
    /// # Errors
    ///
    /// [`CryptoError::KeyDirLocked`] if another holder exists, with its pid
    /// when the lock file names one.
    pub fn acquire(material: KeyMaterial) -> Result<Self, CryptoError> {
        std::fs::create_dir_all(material.dir())?;
        let path = lock_path(&material);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            let mut contents = String::new();
            let holder = file
                .read_to_string(&mut contents)
                .ok()
                .and_then(|_| contents.trim().parse().ok());
            return Err(CryptoError::KeyDirLocked { path, holder });
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;

        tracing::debug!(path = %path.display(), "key directory locked");
        Ok(Self { file, material })
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }
}

impl Drop for KeyDirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, "failed to release key directory lock");
        }
    }
}

fn lock_path(material: &KeyMaterial) -> PathBuf {
    material.dir().join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let material = KeyMaterial::new(dir.path());

        let first = KeyDirLock::acquire(material.clone()).unwrap();
        match KeyDirLock::acquire(material.clone()) {
            Err(CryptoError::KeyDirLocked { holder, .. }) => {
                assert_eq!(holder, Some(std::process::id()));
            }
            other => panic!("expected KeyDirLocked, got {other:?}"),
        }

        drop(first);
        KeyDirLock::acquire(material).unwrap();
    }

    #[test]
    fn missing_directory_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let material = KeyMaterial::new(dir.path().join("keys"));
        let lock = KeyDirLock::acquire(material).unwrap();
        assert!(lock.material().dir().join(LOCK_FILE).is_file());
    }
}
