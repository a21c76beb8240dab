#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use labshare_crypto::{KeyDirLock, KeyPair, NodeKeyring, PublicKey};
use labshare_db::{create_pool, run_migrations, DbRuntimeSettings};
use labshare_server::{
    app, build_state, config::Config, variants::StaticVariantStore, AppState, DataDirs,
};
use labshare_types::{Identity, NodeRecord};
use serde_json::Value;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tower::ServiceExt;

pub const TEST_KEY_BITS: usize = 1024;

pub fn sample_variants() -> StaticVariantStore {
    StaticVariantStore::new(vec![
        vec!["21".into(), "9825797".into(), "A".into(), "G".into()],
        vec!["21".into(), "9825800".into(), "C".into(), "T".into()],
        vec!["22".into(), "100".into(), "G".into(), "A".into()],
    ])
}

/// One node with its own data directory, database and key pair, bound to a
/// loopback port but not yet serving.
pub struct TestNode {
    pub state: AppState,
    pub address: String,
    listener: Option<TcpListener>,
    _dir: TempDir,
}

impl TestNode {
    pub async fn new(name: &str) -> Self {
        Self::with_config(name, |_| {}).await
    }

    pub async fn with_config(name: &str, adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());

        let mut config = Config::default();
        config.node.laboratory_name = name.to_string();
        config.node.public_address = address.clone();
        config.node.data_dir = dir.path().to_path_buf();
        config.node.key_bits = TEST_KEY_BITS;
        config.federation.peer_timeout_seconds = 1;
        config.database.path = dir.path().join("labshare.db").to_str().unwrap().to_string();
        adjust(&mut config);

        let dirs = DataDirs::new(dir.path());
        dirs.bootstrap().unwrap();

        let pool = create_pool(&config.database.path, DbRuntimeSettings::default()).unwrap();
        run_migrations(&pool.get().unwrap()).unwrap();

        let (keyring, generated) =
            NodeKeyring::open(KeyDirLock::acquire(dirs.key_material()).unwrap(), TEST_KEY_BITS)
                .unwrap();
        assert!(generated);

        let state = build_state(
            &config,
            pool,
            Arc::new(keyring),
            Arc::new(sample_variants()),
        )
        .unwrap();

        Self {
            state,
            address,
            listener: Some(listener),
            _dir: dir,
        }
    }

    pub fn name(&self) -> &str {
        &self.state.node_name
    }

    pub fn record(&self) -> NodeRecord {
        NodeRecord {
            laboratory_name: self.name().to_string(),
            address: self.address.clone(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.state.keyring.public_key()
    }

    pub fn router(&self) -> Router {
        app(self.state.clone())
    }

    /// Starts answering HTTP on the bound port.
    pub fn serve(&mut self) {
        let listener = self.listener.take().expect("node is already serving");
        let router = self.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
    }

    /// Stores `other`'s record and current key in this node's directory.
    pub fn introduce(&self, other: &TestNode) {
        self.state
            .directory
            .register(&other.record(), &other.public_key())
            .unwrap();
    }

    /// Registers a new user at this node as of `today`.
    pub fn register_user(&self, today: NaiveDate) -> (Identity, KeyPair) {
        let pair = KeyPair::generate(TEST_KEY_BITS).unwrap();
        let conn = self.state.pool.get().unwrap();
        let identity = self
            .state
            .registry
            .register_user(&conn, pair.public(), today)
            .unwrap();
        (identity, pair)
    }

    /// Key this node stores for peer `name`.
    pub fn stored_key(&self, name: &str) -> PublicKey {
        self.state.directory.public_key(name).unwrap()
    }
}

/// Introduces every node to every other node.
pub fn mesh(nodes: &[&TestNode]) {
    for a in nodes {
        for b in nodes {
            if a.name() != b.name() {
                a.introduce(b);
            }
        }
    }
}

pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn days_ago(days: i64) -> NaiveDate {
    today() - ChronoDuration::days(days)
}

pub async fn post_json(router: Router, uri: &str, body: &Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    send(router, request).await
}

pub async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(router, request).await
}

async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}
