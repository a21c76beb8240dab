//! Per-user signature verification across the federation.

use crate::client::{FederationClient, RemoteAuthorization};
use crate::{blocking, FederationError};
use chrono::{NaiveDate, Utc};
use labshare_crypto::{CryptoError, PublicKey, SignedMessage};
use labshare_db::DbPool;
use labshare_identity::{IdentityError, IdentityRegistry};
use labshare_types::Identity;

/// Resolves a user's public key, locally for identities this node issued
/// and through the home node otherwise, and checks signatures with it.
#[derive(Debug, Clone)]
pub struct TrustResolver {
    registry: IdentityRegistry,
    pool: DbPool,
    client: FederationClient,
}

impl TrustResolver {
    pub fn new(registry: IdentityRegistry, pool: DbPool, client: FederationClient) -> Self {
        Self {
            registry,
            pool,
            client,
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Key of a local identity, or `None` if it is expired or unknown.
    pub async fn lookup_local(
        &self,
        identity: &Identity,
        today: NaiveDate,
    ) -> Result<Option<PublicKey>, FederationError> {
        let registry = self.registry.clone();
        let pool = self.pool.clone();
        let identity = identity.clone();
        blocking(move || {
            let conn = pool.get()?;
            match registry.lookup_local(&conn, &identity, today) {
                Ok(key) => Ok(Some(key)),
                Err(IdentityError::IdentityExpired(id)) => {
                    tracing::info!(identity = %id, "denied: identity expired");
                    Ok(None)
                }
                Err(IdentityError::UnknownIdentity(id)) => {
                    tracing::info!(identity = %id, "denied: unknown identity");
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    /// The key the signer of a request should be checked against, or `None`
    /// if the identity is not (or no longer) authorized.
    pub async fn resolve_public_key(
        &self,
        identity: &Identity,
    ) -> Result<Option<PublicKey>, FederationError> {
        if identity.is_home(self.registry.node_name()) {
            return self.lookup_local(identity, today()).await;
        }

        match self.client.check_remote_authorization(identity).await? {
            RemoteAuthorization::Authorized(key) => Ok(Some(key)),
            RemoteAuthorization::Denied(reason) => {
                tracing::info!(identity = %identity, %reason, "denied by home node");
                Ok(None)
            }
        }
    }

    /// Verifies a message signed by the user named in its `user_id` field.
    ///
    /// Returns whether the signature is valid and the key it was checked
    /// against; an unauthorized identity yields `(false, None)`.
    ///
    /// # Errors
    ///
    /// [`FederationError::MissingField`] if `user_id` is absent or malformed,
    /// [`CryptoError::MissingSignature`] / [`CryptoError::MalformedSignature`]
    /// for unusable signatures.
    pub async fn verify_for_identity(
        &self,
        message: &SignedMessage,
    ) -> Result<(bool, Option<PublicKey>), FederationError> {
        let identity: Identity = message
            .get_str("user_id")
            .ok_or(FederationError::MissingField("user_id"))?
            .parse()
            .map_err(|_| FederationError::MissingField("user_id"))?;

        if message.signature().is_none() {
            return Err(CryptoError::MissingSignature.into());
        }

        let Some(key) = self.resolve_public_key(&identity).await? else {
            return Ok((false, None));
        };

        let valid = message.verify(&key)?;
        if !valid {
            tracing::info!(identity = %identity, "denied: signature does not match user key");
        }
        Ok((valid, Some(key)))
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}
