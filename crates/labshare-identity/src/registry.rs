//! Lookup and issuance of user identities for the local node.

use crate::{expiry, IdentityError};
use chrono::NaiveDate;
use labshare_crypto::keys::write_atomic;
use labshare_crypto::PublicKey;
use labshare_types::Identity;
use rusqlite::Connection;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const KEY_FILE_PREFIX: &str = "public.";
const KEY_FILE_SUFFIX: &str = ".key";

/// Outcome of one pass of [`IdentityRegistry::sweep_key_directory`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Key files seen during the pass.
    pub key_files: usize,
    /// Identities tracked for the first time.
    pub newly_observed: usize,
    /// Tracked identities past their expiry date.
    pub expired: Vec<String>,
}

/// Catalog of the users this node has issued identities to.
#[derive(Debug, Clone)]
pub struct IdentityRegistry {
    public_keys_dir: PathBuf,
    node_name: String,
    ttl_days: i64,
}

impl IdentityRegistry {
    pub fn new(public_keys_dir: impl Into<PathBuf>, node_name: &str, ttl_days: i64) -> Self {
        Self {
            public_keys_dir: public_keys_dir.into(),
            node_name: node_name.to_string(),
            ttl_days,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn public_keys_dir(&self) -> &Path {
        &self.public_keys_dir
    }

    /// `public_keys/public.<token>@<node>.key`
    pub fn key_path(&self, identity: &Identity) -> PathBuf {
        self.public_keys_dir
            .join(format!("{KEY_FILE_PREFIX}{identity}{KEY_FILE_SUFFIX}"))
    }

    fn ensure_local(&self, identity: &Identity) -> Result<(), IdentityError> {
        if identity.is_home(&self.node_name) {
            Ok(())
        } else {
            Err(IdentityError::NotLocal {
                identity: identity.to_string(),
                node: self.node_name.clone(),
            })
        }
    }

    /// Returns the public key of a local, unexpired identity.
    ///
    /// A key file seen for the first time starts the identity's expiry
    /// window.
    ///
    /// # Errors
    ///
    /// - [`IdentityError::NotLocal`] for identities of other nodes.
    /// - [`IdentityError::IdentityExpired`] if the expiry date has passed,
    ///   whether or not the key file still exists.
    /// - [`IdentityError::UnknownIdentity`] if there is no key file.
    pub fn lookup_local(
        &self,
        conn: &Connection,
        identity: &Identity,
        today: NaiveDate,
    ) -> Result<PublicKey, IdentityError> {
        self.ensure_local(identity)?;

        let id = identity.to_string();
        if expiry::is_expired(conn, &id, today)? {
            return Err(IdentityError::IdentityExpired(id));
        }

        let pem = match fs::read_to_string(self.key_path(identity)) {
            Ok(pem) => pem,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(IdentityError::UnknownIdentity(id))
            }
            Err(e) => return Err(e.into()),
        };
        let key = PublicKey::from_pem(&pem)?;

        expiry::register_observation(conn, &id, today, self.ttl_days)?;
        Ok(key)
    }

    /// Starts tracking `identity`. Idempotent.
    pub fn register_observation(
        &self,
        conn: &Connection,
        identity: &Identity,
        today: NaiveDate,
    ) -> Result<bool, IdentityError> {
        expiry::register_observation(conn, &identity.to_string(), today, self.ttl_days)
    }

    /// Gives `identity` a fresh validity window starting today.
    pub fn renew(
        &self,
        conn: &Connection,
        identity: &Identity,
        today: NaiveDate,
    ) -> Result<NaiveDate, IdentityError> {
        expiry::renew(conn, &identity.to_string(), today, self.ttl_days)
    }

    pub fn is_expired(
        &self,
        conn: &Connection,
        identity: &Identity,
        today: NaiveDate,
    ) -> Result<bool, IdentityError> {
        expiry::is_expired(conn, &identity.to_string(), today)
    }

    /// Issues a new identity for `public_key` and starts its expiry window.
    pub fn register_user(
        &self,
        conn: &Connection,
        public_key: &PublicKey,
        today: NaiveDate,
    ) -> Result<Identity, IdentityError> {
        let identity = Identity::generate(&self.node_name);
        self.write_key(&identity, public_key)?;
        self.register_observation(conn, &identity, today)?;
        tracing::info!(identity = %identity, "registered user");
        Ok(identity)
    }

    /// Replaces the key of an existing local user and renews the identity.
    ///
    /// # Errors
    ///
    /// [`IdentityError::UnknownIdentity`] if the user has no key file.
    pub fn replace_user_key(
        &self,
        conn: &Connection,
        identity: &Identity,
        public_key: &PublicKey,
        today: NaiveDate,
    ) -> Result<NaiveDate, IdentityError> {
        self.ensure_local(identity)?;
        if !self.key_path(identity).is_file() {
            return Err(IdentityError::UnknownIdentity(identity.to_string()));
        }
        self.write_key(identity, public_key)?;
        self.register_observation(conn, identity, today)?;
        let expires_on = self.renew(conn, identity, today)?;
        tracing::info!(identity = %identity, fingerprint = %public_key.fingerprint(), "user key replaced");
        Ok(expires_on)
    }

    /// Observes every key file under `public_keys/` and reports which tracked
    /// identities have expired. Key files are never deleted.
    pub fn sweep_key_directory(
        &self,
        conn: &Connection,
        today: NaiveDate,
    ) -> Result<SweepReport, IdentityError> {
        let mut report = SweepReport::default();

        let entries = match fs::read_dir(&self.public_keys_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some(raw) = name
                .strip_prefix(KEY_FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(KEY_FILE_SUFFIX))
            else {
                continue;
            };
            let identity: Identity = match raw.parse() {
                Ok(identity) => identity,
                Err(e) => {
                    tracing::warn!(file = name, error = %e, "skipping key file with malformed identity");
                    continue;
                }
            };

            report.key_files += 1;
            if self.register_observation(conn, &identity, today)? {
                report.newly_observed += 1;
            }
        }

        report.expired = expiry::expired_identities(conn, today)?;
        Ok(report)
    }

    fn write_key(&self, identity: &Identity, public_key: &PublicKey) -> Result<(), IdentityError> {
        fs::create_dir_all(&self.public_keys_dir)?;
        write_atomic(
            &self.key_path(identity),
            public_key.to_pem()?.as_bytes(),
            false,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use labshare_crypto::KeyPair;

    fn setup() -> (tempfile::TempDir, Connection, IdentityRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open_in_memory().unwrap();
        labshare_db::run_migrations(&conn).unwrap();
        let registry = IdentityRegistry::new(dir.path().join("public_keys"), "LabA", 30);
        (dir, conn, registry)
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    #[test]
    fn registered_user_is_authorized_until_expiry() {
        let (_dir, conn, registry) = setup();
        let user = KeyPair::generate(1024).unwrap();
        let identity = registry.register_user(&conn, user.public(), today()).unwrap();
        assert!(identity.is_home("LabA"));

        let key = registry.lookup_local(&conn, &identity, today()).unwrap();
        assert_eq!(&key, user.public());

        let day_30 = today() + Duration::days(30);
        assert!(registry.lookup_local(&conn, &identity, day_30).is_ok());

        let day_31 = today() + Duration::days(31);
        assert!(matches!(
            registry.lookup_local(&conn, &identity, day_31),
            Err(IdentityError::IdentityExpired(_))
        ));
    }

    #[test]
    fn registered_key_file_is_written_whole() {
        let (_dir, conn, registry) = setup();
        let user = KeyPair::generate(1024).unwrap();
        let identity = registry.register_user(&conn, user.public(), today()).unwrap();

        let pem = fs::read_to_string(registry.key_path(&identity)).unwrap();
        assert_eq!(&PublicKey::from_pem(&pem).unwrap(), user.public());
        let leftovers: Vec<_> = fs::read_dir(registry.public_keys_dir())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .filter(|name| name.to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn first_lookup_of_an_unseen_key_file_observes_it() {
        let (_dir, conn, registry) = setup();
        let user = KeyPair::generate(1024).unwrap();
        let identity: Identity = "abc123@LabA".parse().unwrap();
        fs::create_dir_all(registry.public_keys_dir()).unwrap();
        fs::write(registry.key_path(&identity), user.public().to_pem().unwrap()).unwrap();

        assert!(!registry.is_expired(&conn, &identity, today()).unwrap());
        registry.lookup_local(&conn, &identity, today()).unwrap();
        assert_eq!(
            expiry::expiry_date(&conn, "abc123@LabA").unwrap(),
            Some(today() + Duration::days(30))
        );
    }

    #[test]
    fn missing_key_file_is_unknown() {
        let (_dir, conn, registry) = setup();
        let identity: Identity = "nobody@LabA".parse().unwrap();
        assert!(matches!(
            registry.lookup_local(&conn, &identity, today()),
            Err(IdentityError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn foreign_identity_is_not_local() {
        let (_dir, conn, registry) = setup();
        let identity: Identity = "abc123@LabB".parse().unwrap();
        assert!(matches!(
            registry.lookup_local(&conn, &identity, today()),
            Err(IdentityError::NotLocal { .. })
        ));
    }

    #[test]
    fn replace_user_key_renews_the_window() {
        let (_dir, conn, registry) = setup();
        let first = KeyPair::generate(1024).unwrap();
        let identity = registry.register_user(&conn, first.public(), today()).unwrap();

        let later = today() + Duration::days(20);
        let second = KeyPair::generate(1024).unwrap();
        let expires_on = registry
            .replace_user_key(&conn, &identity, second.public(), later)
            .unwrap();
        assert_eq!(expires_on, later + Duration::days(30));

        let key = registry.lookup_local(&conn, &identity, later).unwrap();
        assert_eq!(&key, second.public());
    }

    #[test]
    fn replace_user_key_rejects_unknown_users() {
        let (_dir, conn, registry) = setup();
        let key = KeyPair::generate(1024).unwrap();
        let identity: Identity = "ghost@LabA".parse().unwrap();
        assert!(matches!(
            registry.replace_user_key(&conn, &identity, key.public(), today()),
            Err(IdentityError::UnknownIdentity(_))
        ));
    }

    #[test]
    fn sweep_observes_files_and_reports_expired() {
        let (_dir, conn, registry) = setup();
        let key = KeyPair::generate(1024).unwrap();
        let pem = key.public().to_pem().unwrap();
        fs::create_dir_all(registry.public_keys_dir()).unwrap();
        for id in ["aaa@LabA", "bbb@LabA"] {
            let identity: Identity = id.parse().unwrap();
            fs::write(registry.key_path(&identity), &pem).unwrap();
        }
        fs::write(registry.public_keys_dir().join("README"), "ignored").unwrap();

        let report = registry.sweep_key_directory(&conn, today()).unwrap();
        assert_eq!(report.key_files, 2);
        assert_eq!(report.newly_observed, 2);
        assert!(report.expired.is_empty());

        let report = registry
            .sweep_key_directory(&conn, today() + Duration::days(31))
            .unwrap();
        assert_eq!(report.newly_observed, 0);
        assert_eq!(report.expired, vec!["aaa@LabA".to_string(), "bbb@LabA".to_string()]);
        assert!(registry.key_path(&"aaa@LabA".parse().unwrap()).is_file());
    }

    #[test]
    fn sweep_of_missing_directory_is_empty() {
        let (_dir, conn, registry) = setup();
        assert_eq!(
            registry.sweep_key_directory(&conn, today()).unwrap(),
            SweepReport::default()
        );
    }
}
