//! The client a registered user runs to query nodes privately.

use crate::FederationError;
use labshare_crypto::{
    unwrap_shared_key, EncryptedPayload, IvMode, KeyMaterial, KeyPair, KeySlot, PublicKey,
    SignedMessage, SymmetricKey,
};
use labshare_types::{Identity, RequestId, VariantRow};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;

/// A user's identity and key pair, loaded from a `keys/` directory.
#[derive(Debug)]
pub struct Requester {
    http: reqwest::Client,
    material: KeyMaterial,
    pair: KeyPair,
    identity: Identity,
    iv_mode: IvMode,
}

impl Requester {
    /// Stores a freshly registered identity and its key pair under
    /// `keys_dir` and returns a requester for it.
    pub fn enroll(
        keys_dir: impl Into<PathBuf>,
        identity: Identity,
        pair: KeyPair,
        iv_mode: IvMode,
        timeout: Duration,
    ) -> Result<Self, FederationError> {
        let material = KeyMaterial::new(keys_dir);
        material.save(&pair, KeySlot::Current)?;
        material.save_user_id(&identity.to_string())?;
        Self::build(material, pair, identity, iv_mode, timeout)
    }

    /// Loads `keys/user_id` and the user's key pair.
    pub fn load(
        keys_dir: impl Into<PathBuf>,
        iv_mode: IvMode,
        timeout: Duration,
    ) -> Result<Self, FederationError> {
        let material = KeyMaterial::new(keys_dir);
        let pair = material.load(KeySlot::Current)?;
        let identity = material
            .load_user_id()?
            .parse()
            .map_err(|_| FederationError::MissingField("user_id"))?;
        Self::build(material, pair, identity, iv_mode, timeout)
    }

    fn build(
        material: KeyMaterial,
        pair: KeyPair,
        identity: Identity,
        iv_mode: IvMode,
        timeout: Duration,
    ) -> Result<Self, FederationError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            material,
            pair,
            identity,
            iv_mode,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.pair
    }

    /// Builds and signs a private region query.
    pub fn build_private_query(
        &self,
        chrom: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<(SignedMessage, RequestId), FederationError> {
        let request_id = RequestId::generate();
        let mut message = SignedMessage::new()
            .with("user_id", json!(self.identity.to_string()))
            .with("chrom", json!(chrom))
            .with("request_id", json!(request_id.as_str()));
        if let Some(start) = start {
            message.insert("start", json!(start));
        }
        if let Some(end) = end {
            message.insert("end", json!(end));
        }
        message.sign(&self.pair)?;
        Ok((message, request_id))
    }

    /// Checks the serving node's signature on a `variants-private` response
    /// and decrypts it into rows.
    pub fn open_response(
        &self,
        response: &SignedMessage,
        request_id: &RequestId,
        node_key: &PublicKey,
    ) -> Result<Vec<VariantRow>, FederationError> {
        response.verify_strict(node_key)?;

        let invalid = |reason: &str| FederationError::InvalidResponse {
            node: self.identity.node().to_string(),
            reason: reason.to_string(),
        };

        if response.get_str("request_id") != Some(request_id.as_str()) {
            return Err(invalid("request id mismatch"));
        }
        let ciphertext = response
            .get_str("result")
            .ok_or_else(|| invalid("missing result"))?;
        let wrapped_key = response
            .get_str("encryption_key")
            .ok_or_else(|| invalid("missing encryption_key"))?;

        let plaintext =
            EncryptedPayload::from_parts(ciphertext, wrapped_key, self.iv_mode).open(&self.pair)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Queries `node_address` for variants in a region and decrypts the rows.
    ///
    /// `node_key` is the serving node's public key; a reply not signed with
    /// it is refused.
    pub async fn query_private(
        &self,
        node_address: &str,
        node_key: &PublicKey,
        chrom: &str,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Vec<VariantRow>, FederationError> {
        let (message, request_id) = self.build_private_query(chrom, start, end)?;
        let response = self.post(node_address, "variants-private", &message).await?;
        self.open_response(&response, &request_id, node_key)
    }

    fn signed_request(&self, request_id: &RequestId) -> SignedMessage {
        SignedMessage::new()
            .with("user_id", json!(self.identity.to_string()))
            .with("request_id", json!(request_id.as_str()))
    }

    /// Checks a node's reply: signed by `node_key` and answering `request_id`.
    fn check_reply(
        &self,
        reply: &SignedMessage,
        request_id: &RequestId,
        node_address: &str,
        node_key: &PublicKey,
    ) -> Result<(), FederationError> {
        reply.verify_strict(node_key)?;
        if reply.get_str("request_id") != Some(request_id.as_str()) {
            return Err(FederationError::InvalidResponse {
                node: node_address.to_string(),
                reason: "request id mismatch".to_string(),
            });
        }
        Ok(())
    }

    /// Fetches the data key of the node at `node_address`.
    pub async fn fetch_data_key(
        &self,
        node_address: &str,
        node_key: &PublicKey,
    ) -> Result<SymmetricKey, FederationError> {
        let request_id = RequestId::generate();
        let mut message = self.signed_request(&request_id);
        message.sign(&self.pair)?;

        let reply = self.post(node_address, "data-key", &message).await?;
        self.check_reply(&reply, &request_id, node_address, node_key)?;
        let wrapped = reply
            .get_str("encryption_key")
            .ok_or_else(|| FederationError::InvalidResponse {
                node: node_address.to_string(),
                reason: "missing encryption_key".to_string(),
            })?;
        Ok(unwrap_shared_key(wrapped, &self.pair)?)
    }

    /// Uploads `data` to the node at `node_address`, encrypted under its
    /// data key.
    pub async fn share_data(
        &self,
        node_address: &str,
        node_key: &PublicKey,
        data: &[u8],
    ) -> Result<(), FederationError> {
        let key = self.fetch_data_key(node_address, node_key).await?;
        let payload = EncryptedPayload::with_shared_key(data, &key, self.iv_mode);

        let request_id = RequestId::generate();
        let mut message = self
            .signed_request(&request_id)
            .with("data", json!(payload.ciphertext()));
        message.sign(&self.pair)?;

        let reply = self.post(node_address, "data", &message).await?;
        self.check_reply(&reply, &request_id, node_address, node_key)?;
        if reply.get("result") != Some(&json!(true)) {
            return Err(FederationError::InvalidResponse {
                node: node_address.to_string(),
                reason: "upload not acknowledged".to_string(),
            });
        }
        tracing::info!(node = node_address, bytes = data.len(), "data shared");
        Ok(())
    }

    /// Replaces the user's key on its home node and on disk.
    ///
    /// The update is signed with the current key; the new pair is only saved
    /// once the node has accepted it.
    pub async fn update_key(&mut self, node_address: &str, key_bits: usize) -> Result<(), FederationError> {
        let fresh = KeyPair::generate(key_bits)?;
        let mut message = SignedMessage::new()
            .with("user_id", json!(self.identity.to_string()))
            .with("public_key", json!(fresh.public().to_pem()?))
            .with("request_id", json!(RequestId::generate().as_str()));
        message.sign(&self.pair)?;

        self.post(node_address, "update-user-key", &message).await?;

        self.material.save(&fresh, KeySlot::Current)?;
        self.pair = fresh;
        tracing::info!(identity = %self.identity, "user key updated");
        Ok(())
    }

    async fn post(
        &self,
        node_address: &str,
        endpoint: &str,
        message: &SignedMessage,
    ) -> Result<SignedMessage, FederationError> {
        let url = format!("{}/{}", node_address.trim_end_matches('/'), endpoint);
        let response = self
            .http
            .post(&url)
            .json(message)
            .send()
            .await
            .map_err(|e| FederationError::PeerUnreachable {
                node: node_address.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FederationError::RemoteRejected {
                node: node_address.to_string(),
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await?;
        Ok(SignedMessage::from_value(body)?)
    }
}
