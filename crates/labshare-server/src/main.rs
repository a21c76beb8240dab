//! labshare node binary.
//!
//! Loads configuration, reconciles the node's key material, and serves the
//! federation and variant endpoints with graceful shutdown on SIGTERM/SIGINT.

use labshare_crypto::{IvMode, KeyDirLock, NodeKeyring};
use labshare_federation::{reconcile_key_material, ReconcileOutcome};
use labshare_server::{
    app, background, build_state, config,
    variants::{StaticVariantStore, TsvVariantStore, VariantStore},
    DataDirs,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("LABSHARE_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the node cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    config.validate().expect("invalid configuration");

    match config.crypto.iv_mode {
        IvMode::Fixed => tracing::warn!(
            iv_mode = %config.crypto.iv_mode,
            "private query payloads use a fixed IV; set crypto.iv_mode = \"random\" once all peers support it"
        ),
        IvMode::Random => tracing::info!(iv_mode = %config.crypto.iv_mode, "payload IV mode"),
    }

    let dirs = DataDirs::new(&config.node.data_dir);
    dirs.bootstrap()
        .expect("failed to create state directories under node.data_dir");

    // Initialize database
    let pool = labshare_db::create_pool(
        &config.database.path,
        labshare_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool, check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied =
            labshare_db::run_migrations(&conn).expect("failed to run database migrations");
        let version =
            labshare_db::schema_version(&conn).expect("failed to read database schema version");
        tracing::info!(applied, schema_version = ?version, "database ready");
    }

    // Key material
    let lock = KeyDirLock::acquire(dirs.key_material())
        .expect("failed to lock the key directory, is another node or admin command running?");
    let outcome = reconcile_key_material(lock.material())
        .expect("node key material is corrupted, refusing to start");
    let (keyring, generated) = NodeKeyring::open(lock, config.node.key_bits)
        .expect("failed to load or generate the node key pair");
    if generated {
        tracing::info!(bits = config.node.key_bits, "generated node key pair");
    }
    tracing::info!(
        node = %config.node.laboratory_name,
        fingerprint = %keyring.public_key().fingerprint(),
        "node key loaded"
    );

    let variants: Arc<dyn VariantStore> = match &config.variants.path {
        Some(path) => {
            tracing::info!(path = %path.display(), "serving variants from file");
            Arc::new(TsvVariantStore::new(path))
        }
        None => {
            tracing::warn!("no variants.path configured; variant queries return no rows");
            Arc::new(StaticVariantStore::default())
        }
    };

    let state = build_state(&config, pool, Arc::new(keyring), variants)
        .expect("failed to build application state");
    let shared = Arc::new(state.clone());

    if outcome == ReconcileOutcome::AnnouncementPending {
        let resume_state = shared.clone();
        tokio::spawn(async move {
            match resume_state.rotator.resume().await {
                Ok(Some(report)) => tracing::info!(
                    announced = report.announced.len(),
                    queued = report.queued.len(),
                    "resumed interrupted key rotation"
                ),
                Ok(None) => {}
                Err(e) => tracing::error!(error = %e, "failed to resume key rotation"),
            }
        });
    }

    let schedule = config.schedule.clone();
    tokio::spawn(background::start_health_probe_task(
        shared.clone(),
        schedule.health_probe_seconds,
    ));
    tokio::spawn(background::start_quota_reset_task(
        shared.clone(),
        schedule.quota_reset_seconds,
    ));
    tokio::spawn(background::start_rotation_task(
        shared.clone(),
        schedule.rotation_interval_seconds,
    ));
    tokio::spawn(background::start_expiry_sweep_task(
        shared,
        schedule.expiry_sweep_seconds,
    ));

    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, node = %config.node.laboratory_name, "starting labshare node");

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("labshare node shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
