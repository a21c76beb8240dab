//! Replacement of the node's own key pair.
//!
//! A rotation moves through `Stable -> Rotating -> Announcing -> Stable`:
//!
//! 1. The current pair is renamed to the old slot and a new pair is written
//!    (under the keyring's write lock). Any failure here puts the old pair
//!    back and leaves the node in `Stable`.
//! 2. The new public key is announced to every peer, signed with the OLD
//!    private key, since that is the key peers still hold for us. Peers the
//!    last health probe found unreachable, and peers that fail the
//!    announcement, get the signed announcement queued instead.
//! 3. The old pair is deleted.
//!
//! A crash can leave the key directory between steps; [`reconcile_key_material`]
//! runs before the keyring is opened and [`KeyRotator::resume`] finishes an
//! interrupted announcement. A failure after step 1 in a running node is
//! picked up by the next [`KeyRotator::rotate_or_finish`].

use crate::client::FederationClient;
use crate::{blocking, db, FederationError, RotationError};
use futures_util::future::join_all;
use labshare_crypto::{CryptoError, KeyMaterial, KeyPair, KeySlot, SignedMessage};
use labshare_types::{NodeRecord, RequestId};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    Stable,
    Rotating,
    Announcing,
}

/// Who received the new key directly and who has it queued.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub announced: Vec<String>,
    pub queued: Vec<String>,
}

/// What startup reconciliation found in the key directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No rotation was in progress.
    Clean,
    /// A rotation stopped before the new pair was written; the old pair is
    /// current again.
    RestoredOld,
    /// A rotation stopped after the new pair was written; its announcement
    /// still has to be sent.
    AnnouncementPending,
}

/// Repairs the key directory after an interrupted rotation.
///
/// Must run before the keyring is opened, otherwise a missing current pair
/// would be regenerated instead of restored.
pub fn reconcile_key_material(material: &KeyMaterial) -> Result<ReconcileOutcome, CryptoError> {
    if !material.has_any(KeySlot::Old) {
        return Ok(ReconcileOutcome::Clean);
    }

    if material.exists(KeySlot::Old) {
        if material.load(KeySlot::Current).is_ok() {
            tracing::warn!("found new key pair alongside old pair, resuming rotation announcement");
            return Ok(ReconcileOutcome::AnnouncementPending);
        }
        tracing::warn!("found old key pair without a usable current pair, restoring it");
        material.delete(KeySlot::Current)?;
        material.restore_old()?;
    } else {
        // Only one half was renamed; its partner is still in the current slot.
        tracing::warn!("found half-renamed key pair, moving it back");
        material.restore_old()?;
    }

    material.load(KeySlot::Current)?;
    Ok(ReconcileOutcome::RestoredOld)
}

/// Drives key rotation for the local node.
#[derive(Debug)]
pub struct KeyRotator {
    client: FederationClient,
    state: Mutex<RotationState>,
}

struct StateGuard<'a>(&'a Mutex<RotationState>);

impl StateGuard<'_> {
    fn set(&self, state: RotationState) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.set(RotationState::Stable);
    }
}

impl KeyRotator {
    pub fn new(client: FederationClient) -> Self {
        Self {
            client,
            state: Mutex::new(RotationState::Stable),
        }
    }

    pub fn state(&self) -> RotationState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self) -> Result<StateGuard<'_>, RotationError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != RotationState::Stable {
            return Err(RotationError::AlreadyRunning);
        }
        *state = RotationState::Rotating;
        Ok(StateGuard(&self.state))
    }

    /// Runs one complete rotation.
    pub async fn rotate(&self) -> Result<RotationReport, RotationError> {
        let guard = self.begin()?;

        let keyring = self.client.keyring().clone();
        let old = tokio::task::spawn_blocking(move || keyring.replace_current())
            .await
            .map_err(|e| FederationError::Task(e.to_string()))?
            .map_err(|e| {
                tracing::error!(error = %e, "key rotation aborted, previous key pair kept");
                RotationError::Aborted(e)
            })?;

        tracing::info!(
            old = %old.public().fingerprint(),
            new = %self.client.keyring().public_key().fingerprint(),
            "key pair replaced"
        );

        guard.set(RotationState::Announcing);
        let report = self.announce(&old).await?;
        self.client.keyring().discard_old()?;

        tracing::info!(
            announced = report.announced.len(),
            queued = report.queued.len(),
            "key rotation complete"
        );
        Ok(report)
    }

    /// Entry point for the scheduled job.
    ///
    /// An old pair still on disk means an earlier announcement did not
    /// complete; that one is finished instead of starting a new rotation.
    pub async fn rotate_or_finish(&self) -> Result<RotationReport, RotationError> {
        if self.client.keyring().material().exists(KeySlot::Old) {
            tracing::warn!("previous key rotation was not fully announced, finishing it");
            if let Some(report) = self.resume().await? {
                return Ok(report);
            }
        }
        self.rotate().await
    }

    /// Finishes a rotation interrupted after the new pair was written.
    ///
    /// Returns `None` if no old pair is on disk.
    pub async fn resume(&self) -> Result<Option<RotationReport>, RotationError> {
        let guard = self.begin()?;

        let Some(old) = self.client.keyring().old_pair()? else {
            return Ok(None);
        };

        guard.set(RotationState::Announcing);
        let report = self.announce(&old).await?;
        self.client.keyring().discard_old()?;
        tracing::info!(
            announced = report.announced.len(),
            queued = report.queued.len(),
            "resumed key rotation complete"
        );
        Ok(Some(report))
    }

    async fn announce(&self, old: &KeyPair) -> Result<RotationReport, RotationError> {
        let new_public = self.client.keyring().public_key().to_pem()?;
        let nodes = self.client.directory().list()?;

        let pool = self.client.pool().clone();
        let reachable: HashSet<String> = blocking(move || {
            let conn = pool.get()?;
            Ok(db::list_availability(&conn)?
                .into_iter()
                .filter(|node| node.reachable)
                .map(|node| node.laboratory_name)
                .collect())
        })
        .await?;

        let mut messages = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let mut message = SignedMessage::new()
                .with("node", json!(self.client.node_name()))
                .with("public_key", json!(new_public))
                .with("request_id", json!(RequestId::generate().as_str()));
            message.sign(old)?;
            messages.push(message);
        }

        let (online, offline): (Vec<_>, Vec<_>) = nodes
            .iter()
            .zip(messages)
            .partition(|(node, _)| reachable.contains(&node.laboratory_name));

        let results = join_all(
            online
                .iter()
                .map(|(node, message)| self.client.announce_key(node, message)),
        )
        .await;

        let mut report = RotationReport::default();
        let mut to_queue: Vec<(&NodeRecord, SignedMessage)> = offline;

        for ((node, message), result) in online.into_iter().zip(results) {
            match result {
                Ok(()) => report.announced.push(node.laboratory_name.clone()),
                Err(e) => {
                    tracing::warn!(node = %node.laboratory_name, error = %e, "key announcement failed, queueing");
                    to_queue.push((node, message));
                }
            }
        }

        for (node, message) in to_queue {
            self.client
                .queue_announcement(&node.laboratory_name, message)
                .await?;
            report.queued.push(node.laboratory_name.clone());
        }

        report.announced.sort();
        report.queued.sort();
        Ok(report)
    }
}
