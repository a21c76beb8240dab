//! labshare node server library logic.

pub mod api;
pub mod api_data;
pub mod api_variants;
pub mod background;
pub mod config;
pub mod quota;
pub mod variants;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Json, Router,
};
use config::Config;
use labshare_crypto::{IvMode, KeyMaterial, NodeKeyring, SymmetricKey};
use labshare_db::DbPool;
use labshare_federation::{
    FederationClient, FederationError, FederationSettings, KeyRotator, NodeDirectory,
    TrustResolver,
};
use labshare_identity::IdentityRegistry;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use variants::VariantStore;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// This node's laboratory name.
    pub node_name: String,
    /// The node's own signing key.
    pub keyring: Arc<NodeKeyring>,
    /// Known peer nodes.
    pub directory: NodeDirectory,
    /// Users issued by this node.
    pub registry: IdentityRegistry,
    /// Outbound peer calls.
    pub client: FederationClient,
    /// Per-user signature checks.
    pub trust: TrustResolver,
    /// Key rotation driver.
    pub rotator: Arc<KeyRotator>,
    /// Variant lookup.
    pub variants: Arc<dyn VariantStore>,
    /// IV handling for private query payloads and uploads.
    pub iv_mode: IvMode,
    /// Key users encrypt uploads with. Regenerated on every start.
    pub data_key: Arc<SymmetricKey>,
    /// Where decrypted uploads are stored.
    pub data_dir: PathBuf,
    /// Oldest accepted request id on freshness-checked endpoints.
    pub request_max_age_seconds: i64,
    /// Budget for `/variants` per quota period.
    pub public_daily_limit: u32,
}

/// The state directories under `node.data_dir`.
#[derive(Debug, Clone)]
pub struct DataDirs {
    root: PathBuf,
}

impl DataDirs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keys(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn public_keys(&self) -> PathBuf {
        self.root.join("public_keys")
    }

    pub fn nodes(&self) -> PathBuf {
        self.root.join("nodes")
    }

    pub fn data_acquisition(&self) -> PathBuf {
        self.root.join("data_acquisition")
    }

    /// Creates any missing state directory.
    pub fn bootstrap(&self) -> std::io::Result<()> {
        for dir in [
            self.keys(),
            self.public_keys(),
            self.nodes(),
            self.data_acquisition(),
        ] {
            if !dir.is_dir() {
                std::fs::create_dir_all(&dir)?;
                tracing::info!(path = %dir.display(), "created state directory");
            }
        }
        Ok(())
    }

    pub fn key_material(&self) -> KeyMaterial {
        KeyMaterial::new(self.keys())
    }
}

/// Wires the node's components together.
pub fn build_state(
    config: &Config,
    pool: DbPool,
    keyring: Arc<NodeKeyring>,
    variants: Arc<dyn VariantStore>,
) -> Result<AppState, FederationError> {
    let dirs = DataDirs::new(&config.node.data_dir);
    let directory = NodeDirectory::new(dirs.nodes());
    let registry = IdentityRegistry::new(
        dirs.public_keys(),
        &config.node.laboratory_name,
        config.node.identity_ttl_days,
    );

    let client = FederationClient::new(
        FederationSettings {
            node_name: config.node.laboratory_name.clone(),
            public_address: config.node.public_address.clone(),
            peer_timeout: config.federation.peer_timeout(),
        },
        keyring.clone(),
        directory.clone(),
        pool.clone(),
    )?;
    let trust = TrustResolver::new(registry.clone(), pool.clone(), client.clone());
    let rotator = Arc::new(KeyRotator::new(client.clone()));

    Ok(AppState {
        pool,
        node_name: config.node.laboratory_name.clone(),
        keyring,
        directory,
        registry,
        client,
        trust,
        rotator,
        variants,
        iv_mode: config.crypto.iv_mode,
        data_key: Arc::new(SymmetricKey::generate()),
        data_dir: dirs.data_acquisition(),
        request_max_age_seconds: config.node.request_max_age_seconds,
        public_daily_limit: config.variants.public_daily_limit,
    })
}

/// Request bodies are small JSON messages.
const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;

/// Health check handler.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "node": state.node_name,
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/check-node", post(api::check_node_handler))
        .route("/check-user", post(api::check_user_handler))
        .route("/update-keys", post(api::update_keys_handler))
        .route("/add-node", post(api::add_node_handler))
        .route("/update-user-key", post(api::update_user_key_handler))
        .route("/nodes", get(api::list_nodes_handler))
        .route("/data-key", post(api_data::data_key_handler))
        .route("/data", post(api_data::receive_data_handler))
        .route("/variants", post(api_variants::public_variants_handler))
        .route(
            "/variants-private",
            post(api_variants::private_variants_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
