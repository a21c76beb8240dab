//! The on-disk directory of known peer nodes.
//!
//! `nodes/<name>.json` holds the [`NodeRecord`]; `nodes/public.<name>.key`
//! holds the peer's current public key. Writes go through a temp file and a
//! rename.

use crate::FederationError;
use labshare_crypto::keys::write_atomic;
use labshare_crypto::PublicKey;
use labshare_types::{is_valid_node_name, NodeRecord};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct NodeDirectory {
    nodes_dir: PathBuf,
}

impl NodeDirectory {
    pub fn new(nodes_dir: impl Into<PathBuf>) -> Self {
        Self {
            nodes_dir: nodes_dir.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.nodes_dir
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.nodes_dir.join(format!("{name}.json"))
    }

    fn key_path(&self, name: &str) -> PathBuf {
        self.nodes_dir.join(format!("public.{name}.key"))
    }

    fn check_name(name: &str) -> Result<(), FederationError> {
        if is_valid_node_name(name) {
            Ok(())
        } else {
            Err(FederationError::InvalidNodeName(name.to_string()))
        }
    }

    /// All known nodes, sorted by name. Unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<NodeRecord>, FederationError> {
        let entries = match fs::read_dir(&self.nodes_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut nodes = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => nodes.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable node record");
                }
            }
        }
        nodes.sort_by(|a, b| a.laboratory_name.cmp(&b.laboratory_name));
        Ok(nodes)
    }

    pub fn get(&self, name: &str) -> Result<Option<NodeRecord>, FederationError> {
        Self::check_name(name)?;
        match read_record(&self.record_path(name)) {
            Ok(record) => Ok(Some(record)),
            Err(FederationError::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The stored public key of a known node.
    ///
    /// # Errors
    ///
    /// [`FederationError::UnknownNode`] if no key is stored for `name`.
    pub fn public_key(&self, name: &str) -> Result<PublicKey, FederationError> {
        Self::check_name(name)?;
        let pem = match fs::read_to_string(self.key_path(name)) {
            Ok(pem) => pem,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FederationError::UnknownNode(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(PublicKey::from_pem(&pem)?)
    }

    /// Stores the record and key of a node not yet in the directory.
    ///
    /// # Errors
    ///
    /// [`FederationError::NodeExists`] if the name is taken; a known node's
    /// key only changes through [`NodeDirectory::update_key`].
    pub fn register(&self, record: &NodeRecord, key: &PublicKey) -> Result<(), FederationError> {
        let name = &record.laboratory_name;
        Self::check_name(name)?;
        if self.record_path(name).exists() || self.key_path(name).exists() {
            return Err(FederationError::NodeExists(name.clone()));
        }
        fs::create_dir_all(&self.nodes_dir)?;
        write_atomic(&self.key_path(name), key.to_pem()?.as_bytes(), false)?;
        write_atomic(
            &self.record_path(name),
            serde_json::to_string_pretty(record)?.as_bytes(),
            false,
        )?;
        Ok(())
    }

    /// Replaces the stored key of an already known node.
    pub fn update_key(&self, name: &str, key: &PublicKey) -> Result<(), FederationError> {
        if self.get(name)?.is_none() {
            return Err(FederationError::UnknownNode(name.to_string()));
        }
        write_atomic(&self.key_path(name), key.to_pem()?.as_bytes(), false)?;
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<NodeRecord, FederationError> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use labshare_crypto::KeyPair;

    fn record(name: &str) -> NodeRecord {
        NodeRecord {
            laboratory_name: name.to_string(),
            address: format!("http://{name}.example:8080"),
        }
    }

    #[test]
    fn register_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let directory = NodeDirectory::new(dir.path().join("nodes"));
        let key = KeyPair::generate(1024).unwrap();

        directory.register(&record("LabB"), key.public()).unwrap();
        directory.register(&record("LabA"), key.public()).unwrap();

        let names: Vec<_> = directory
            .list()
            .unwrap()
            .into_iter()
            .map(|n| n.laboratory_name)
            .collect();
        assert_eq!(names, vec!["LabA", "LabB"]);
        assert_eq!(&directory.public_key("LabB").unwrap(), key.public());

        let raw = fs::read_to_string(dir.path().join("nodes/LabB.json")).unwrap();
        assert!(raw.contains("\"laboratory-name\""));
    }

    #[test]
    fn unknown_node_has_no_key() {
        let dir = tempfile::tempdir().unwrap();
        let directory = NodeDirectory::new(dir.path());
        assert!(directory.get("LabZ").unwrap().is_none());
        assert!(matches!(
            directory.public_key("LabZ"),
            Err(FederationError::UnknownNode(_))
        ));
    }

    #[test]
    fn update_key_requires_known_node() {
        let dir = tempfile::tempdir().unwrap();
        let directory = NodeDirectory::new(dir.path());
        let first = KeyPair::generate(1024).unwrap();
        let second = KeyPair::generate(1024).unwrap();

        assert!(matches!(
            directory.update_key("LabB", second.public()),
            Err(FederationError::UnknownNode(_))
        ));

        directory.register(&record("LabB"), first.public()).unwrap();
        directory.update_key("LabB", second.public()).unwrap();
        assert_eq!(&directory.public_key("LabB").unwrap(), second.public());
    }

    #[test]
    fn known_node_cannot_be_registered_again() {
        let dir = tempfile::tempdir().unwrap();
        let directory = NodeDirectory::new(dir.path());
        let first = KeyPair::generate(1024).unwrap();
        let second = KeyPair::generate(1024).unwrap();

        directory.register(&record("LabB"), first.public()).unwrap();
        assert!(matches!(
            directory.register(&record("LabB"), second.public()),
            Err(FederationError::NodeExists(name)) if name == "LabB"
        ));
        assert_eq!(&directory.public_key("LabB").unwrap(), first.public());
    }

    #[test]
    fn path_like_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let directory = NodeDirectory::new(dir.path());
        let key = KeyPair::generate(1024).unwrap();
        assert!(matches!(
            directory.register(&record("../etc"), key.public()),
            Err(FederationError::InvalidNodeName(_))
        ));
    }

    #[test]
    fn garbage_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let directory = NodeDirectory::new(dir.path());
        assert!(directory.list().unwrap().is_empty());
    }
}
