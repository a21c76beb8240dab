//! Outbound calls to peer nodes.

use crate::directory::NodeDirectory;
use crate::{blocking, db, FederationError};
use chrono::{SecondsFormat, Utc};
use futures_util::future::join_all;
use labshare_crypto::{NodeKeyring, PublicKey, SignedMessage};
use labshare_db::DbPool;
use labshare_types::{Identity, NodeAvailability, NodeRecord, RequestId};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Settings the client needs from the node configuration.
#[derive(Debug, Clone)]
pub struct FederationSettings {
    /// This node's laboratory name, sent as `request_node`.
    pub node_name: String,
    /// This node's externally reachable base URL.
    pub public_address: String,
    /// Upper bound for every peer call.
    pub peer_timeout: Duration,
}

/// Why a remote authorization check did not authorize the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    /// The identity's home node is not in the directory.
    UnknownNode,
    /// The home node did not answer in time.
    Unreachable,
    /// The home node answered with a non-success status.
    Rejected(u16),
    /// The answer was not signed by the home node's stored key.
    BadSignature,
    /// The answer echoed a different request id.
    RequestIdMismatch,
    /// The answer could not be parsed.
    InvalidResponse,
    /// The home node says the user is not authorized.
    NotAuthorized,
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenialReason::UnknownNode => f.write_str("home node unknown"),
            DenialReason::Unreachable => f.write_str("home node unreachable"),
            DenialReason::Rejected(status) => write!(f, "home node answered {status}"),
            DenialReason::BadSignature => f.write_str("response signature invalid"),
            DenialReason::RequestIdMismatch => f.write_str("response request id mismatch"),
            DenialReason::InvalidResponse => f.write_str("response malformed"),
            DenialReason::NotAuthorized => f.write_str("user not authorized"),
        }
    }
}

/// Outcome of [`FederationClient::check_remote_authorization`].
#[derive(Debug, Clone)]
pub enum RemoteAuthorization {
    /// The home node vouched for the user and returned this key.
    Authorized(PublicKey),
    Denied(DenialReason),
}

/// Signs and sends messages to peer nodes.
///
/// Every call is bounded by [`FederationSettings::peer_timeout`]; a peer that
/// does not answer in time is treated as unreachable.
#[derive(Debug, Clone)]
pub struct FederationClient {
    http: reqwest::Client,
    settings: FederationSettings,
    keyring: Arc<NodeKeyring>,
    directory: NodeDirectory,
    pool: DbPool,
}

impl FederationClient {
    pub fn new(
        settings: FederationSettings,
        keyring: Arc<NodeKeyring>,
        directory: NodeDirectory,
        pool: DbPool,
    ) -> Result<Self, FederationError> {
        let http = reqwest::Client::builder()
            .timeout(settings.peer_timeout)
            .build()?;
        Ok(Self {
            http,
            settings,
            keyring,
            directory,
            pool,
        })
    }

    pub fn node_name(&self) -> &str {
        &self.settings.node_name
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    pub fn keyring(&self) -> &Arc<NodeKeyring> {
        &self.keyring
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn sign(&self, mut message: SignedMessage) -> Result<SignedMessage, FederationError> {
        self.keyring.sign(&mut message)?;
        Ok(message)
    }

    async fn post(
        &self,
        node: &NodeRecord,
        endpoint: &str,
        message: &SignedMessage,
    ) -> Result<reqwest::Response, FederationError> {
        self.http
            .post(node.endpoint(endpoint))
            .json(message)
            .send()
            .await
            .map_err(|e| FederationError::PeerUnreachable {
                node: node.laboratory_name.clone(),
                reason: e.to_string(),
            })
    }

    /// Asks a foreign identity's home node whether the user is authorized.
    ///
    /// Only a response that is signed by the home node's stored key, echoes
    /// our request id, and carries a public key authorizes the user. Every
    /// other outcome is a denial; errors are returned only for local
    /// failures such as being unable to sign.
    pub async fn check_remote_authorization(
        &self,
        identity: &Identity,
    ) -> Result<RemoteAuthorization, FederationError> {
        let home = identity.node();
        let record = match self.directory.get(home)? {
            Some(record) => record,
            None => return Ok(RemoteAuthorization::Denied(DenialReason::UnknownNode)),
        };
        let home_key = match self.directory.public_key(home) {
            Ok(key) => key,
            Err(FederationError::UnknownNode(_)) => {
                return Ok(RemoteAuthorization::Denied(DenialReason::UnknownNode))
            }
            Err(e) => return Err(e),
        };

        let request_id = RequestId::generate();
        let message = self.sign(
            SignedMessage::new()
                .with("user_id", json!(identity.to_string()))
                .with("node", json!(home))
                .with("request_node", json!(self.settings.node_name))
                .with("request_id", json!(request_id.as_str())),
        )?;

        let response = match self.post(&record, "check-user", &message).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(node = home, error = %e, "authorization check failed");
                return Ok(RemoteAuthorization::Denied(DenialReason::Unreachable));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Ok(RemoteAuthorization::Denied(DenialReason::Rejected(
                status.as_u16(),
            )));
        }

        let reply = match response.json::<Value>().await.map(SignedMessage::from_value) {
            Ok(Ok(reply)) => reply,
            _ => return Ok(RemoteAuthorization::Denied(DenialReason::InvalidResponse)),
        };

        match reply.verify(&home_key) {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                tracing::warn!(node = home, "authorization response failed signature check");
                return Ok(RemoteAuthorization::Denied(DenialReason::BadSignature));
            }
        }

        if reply.get_str("request_id") != Some(request_id.as_str()) {
            return Ok(RemoteAuthorization::Denied(DenialReason::RequestIdMismatch));
        }

        match reply.get("result") {
            Some(Value::String(pem)) => match PublicKey::from_pem(pem) {
                Ok(key) => Ok(RemoteAuthorization::Authorized(key)),
                Err(_) => Ok(RemoteAuthorization::Denied(DenialReason::InvalidResponse)),
            },
            _ => Ok(RemoteAuthorization::Denied(DenialReason::NotAuthorized)),
        }
    }

    async fn ping(&self, node: &NodeRecord) -> bool {
        let message = match self.sign(
            SignedMessage::new()
                .with("request_node", json!(self.settings.node_name))
                .with("request_id", json!(RequestId::generate().as_str())),
        ) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(error = %e, "failed to sign health probe");
                return false;
            }
        };

        match self.post(node, "check-node", &message).await {
            Ok(response) if response.status().is_success() => true,
            // A peer still holding our previous key answers 403 but is up,
            // and must count as reachable for queued announcements to reach it.
            Ok(response) => {
                tracing::warn!(node = %node.laboratory_name, status = %response.status(), "health probe rejected");
                true
            }
            Err(e) => {
                tracing::warn!(node = %node.laboratory_name, error = %e, "health probe failed");
                false
            }
        }
    }

    /// Pings every known node, stores the availability snapshot, then
    /// re-delivers queued rotation announcements to the nodes that answered.
    ///
    /// A failing peer is recorded as unreachable and never aborts the sweep.
    pub async fn broadcast_health_probe(&self) -> Result<Vec<NodeAvailability>, FederationError> {
        let nodes = self.directory.list()?;
        let checked_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        let results = join_all(nodes.iter().map(|node| self.ping(node))).await;
        let snapshot: Vec<NodeAvailability> = nodes
            .iter()
            .zip(&results)
            .map(|(node, &reachable)| NodeAvailability {
                laboratory_name: node.laboratory_name.clone(),
                address: node.address.clone(),
                reachable,
                checked_at: checked_at.clone(),
            })
            .collect();

        let pool = self.pool.clone();
        let to_store = snapshot.clone();
        blocking(move || {
            let mut conn = pool.get()?;
            db::replace_availability(&mut conn, &to_store)?;
            Ok(())
        })
        .await?;

        let reachable = results.iter().filter(|&&r| r).count();
        tracing::info!(nodes = nodes.len(), reachable, "health probe complete");

        for (node, reachable) in nodes.iter().zip(&results) {
            if !*reachable {
                continue;
            }
            match self.deliver_pending(node).await {
                Ok(0) => {}
                Ok(delivered) => {
                    tracing::info!(node = %node.laboratory_name, delivered, "delivered queued key announcements")
                }
                Err(e) => {
                    tracing::warn!(node = %node.laboratory_name, error = %e, "failed to deliver queued key announcements")
                }
            }
        }

        Ok(snapshot)
    }

    /// Sends an already signed key announcement to `node`.
    pub async fn announce_key(
        &self,
        node: &NodeRecord,
        message: &SignedMessage,
    ) -> Result<(), FederationError> {
        let response = self.post(node, "update-keys", message).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(FederationError::RemoteRejected {
                node: node.laboratory_name.clone(),
                status: status.as_u16(),
            })
        }
    }

    /// Stores an announcement for delivery by a later health probe.
    pub async fn queue_announcement(
        &self,
        node: &str,
        message: SignedMessage,
    ) -> Result<(), FederationError> {
        let pool = self.pool.clone();
        let node = node.to_string();
        blocking(move || {
            let conn = pool.get()?;
            db::enqueue_announcement(&conn, &node, &message)?;
            Ok(())
        })
        .await
    }

    /// Re-sends queued announcements to `node` in the order they were queued.
    ///
    /// Stops at the first delivery the peer did not answer. An announcement
    /// the peer rejects outright is dropped, since resending it cannot
    /// succeed.
    pub async fn deliver_pending(&self, node: &NodeRecord) -> Result<usize, FederationError> {
        let pool = self.pool.clone();
        let name = node.laboratory_name.clone();
        let pending = blocking(move || {
            let conn = pool.get()?;
            Ok(db::pending_announcements(&conn, &name)?)
        })
        .await?;

        let mut delivered = 0;
        for (id, message) in pending {
            match self.announce_key(node, &message).await {
                Ok(()) => delivered += 1,
                Err(FederationError::RemoteRejected { status, .. }) if (400..500).contains(&status) => {
                    tracing::warn!(node = %node.laboratory_name, status, "peer rejected queued key announcement, dropping it");
                }
                Err(e) => {
                    tracing::debug!(node = %node.laboratory_name, error = %e, "queued announcement still undeliverable");
                    break;
                }
            }

            let pool = self.pool.clone();
            blocking(move || {
                let conn = pool.get()?;
                db::delete_announcement(&conn, id)?;
                Ok(())
            })
            .await?;
        }

        Ok(delivered)
    }

    /// Registers a peer locally and announces it to every other known peer.
    ///
    /// Returns how many peers accepted the announcement. Failed
    /// announcements are logged and do not undo the local registration.
    pub async fn add_node(
        &self,
        record: NodeRecord,
        key: &PublicKey,
    ) -> Result<usize, FederationError> {
        self.directory.register(&record, key)?;
        tracing::info!(node = %record.laboratory_name, address = %record.address, "node added");

        let message = self.sign(
            SignedMessage::new()
                .with("laboratory-name", json!(record.laboratory_name))
                .with("address", json!(record.address))
                .with("public_key", json!(key.to_pem()?))
                .with("request_node", json!(self.settings.node_name))
                .with("request_id", json!(RequestId::generate().as_str())),
        )?;

        let peers: Vec<NodeRecord> = self
            .directory
            .list()?
            .into_iter()
            .filter(|peer| {
                peer.laboratory_name != record.laboratory_name
                    && peer.laboratory_name != self.settings.node_name
            })
            .collect();

        let results = join_all(peers.iter().map(|peer| self.post(peer, "add-node", &message))).await;

        let mut accepted = 0;
        for (peer, result) in peers.iter().zip(results) {
            match result {
                Ok(response) if response.status().is_success() => accepted += 1,
                Ok(response) => {
                    tracing::warn!(peer = %peer.laboratory_name, status = %response.status(), "peer rejected node announcement")
                }
                Err(e) => {
                    tracing::warn!(peer = %peer.laboratory_name, error = %e, "failed to announce new node")
                }
            }
        }

        Ok(accepted)
    }
}
