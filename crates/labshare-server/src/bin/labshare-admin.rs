//! Operator commands for a labshare node.
//!
//! ```text
//! labshare-admin add-node <laboratory-name> <address> <public-key.pem>
//! labshare-admin register-user <public-key.pem>
//! labshare-admin rotate-keys
//! ```
//!
//! The configuration is read from `LABSHARE_CONFIG_PATH` or `config.toml`.
//! `add-node` and `rotate-keys` need the node's key directory and refuse to
//! run while the server holds it.

use chrono::Utc;
use labshare_crypto::{CryptoError, KeyDirLock, NodeKeyring, PublicKey};
use labshare_federation::reconcile_key_material;
use labshare_identity::IdentityRegistry;
use labshare_server::{
    build_state, config, variants::StaticVariantStore, AppState, DataDirs,
};
use labshare_types::NodeRecord;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage:
  labshare-admin add-node <laboratory-name> <address> <public-key.pem>
  labshare-admin register-user <public-key.pem>
  labshare-admin rotate-keys";

fn read_public_key(path: &str) -> Result<PublicKey, String> {
    let pem = std::fs::read_to_string(path).map_err(|e| format!("cannot read {path}: {e}"))?;
    PublicKey::from_pem(&pem).map_err(|e| format!("{path} is not a public key: {e}"))
}

struct Store {
    config: config::Config,
    dirs: DataDirs,
    pool: labshare_db::DbPool,
}

fn open_store() -> Result<Store, String> {
    let path = std::env::var("LABSHARE_CONFIG_PATH")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| "config.toml".to_string());
    let config = config::load_config(Some(path.as_str())).map_err(|e| e.to_string())?;
    config.validate().map_err(|e| e.to_string())?;

    let dirs = DataDirs::new(&config.node.data_dir);
    dirs.bootstrap().map_err(|e| e.to_string())?;

    let pool = labshare_db::create_pool(
        &config.database.path,
        labshare_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .map_err(|e| e.to_string())?;
    {
        let conn = pool.get().map_err(|e| e.to_string())?;
        labshare_db::run_migrations(&conn).map_err(|e| e.to_string())?;
    }

    Ok(Store { config, dirs, pool })
}

/// Opens the node with its key directory locked.
///
/// Fails while the server is running; key changes go through the process
/// that owns the keys.
fn open_node() -> Result<AppState, String> {
    let store = open_store()?;

    let lock = KeyDirLock::acquire(store.dirs.key_material()).map_err(|e| match e {
        CryptoError::KeyDirLocked { .. } => format!("{e}; stop the node server first"),
        other => other.to_string(),
    })?;
    reconcile_key_material(lock.material()).map_err(|e| e.to_string())?;
    let (keyring, _) =
        NodeKeyring::open(lock, store.config.node.key_bits).map_err(|e| e.to_string())?;

    build_state(
        &store.config,
        store.pool,
        Arc::new(keyring),
        Arc::new(StaticVariantStore::default()),
    )
    .map_err(|e| e.to_string())
}

async fn run(args: &[String]) -> Result<(), String> {
    match args {
        [cmd, name, address, key_path] if cmd == "add-node" => {
            let key = read_public_key(key_path)?;
            let state = open_node()?;
            let record = NodeRecord {
                laboratory_name: name.clone(),
                address: address.clone(),
            };
            let accepted = state
                .client
                .add_node(record, &key)
                .await
                .map_err(|e| e.to_string())?;
            println!("added {name}; announced to {accepted} peer(s)");
            Ok(())
        }
        [cmd, key_path] if cmd == "register-user" => {
            let key = read_public_key(key_path)?;
            let store = open_store()?;
            let registry = IdentityRegistry::new(
                store.dirs.public_keys(),
                &store.config.node.laboratory_name,
                store.config.node.identity_ttl_days,
            );
            let conn = store.pool.get().map_err(|e| e.to_string())?;
            let identity = registry
                .register_user(&conn, &key, Utc::now().date_naive())
                .map_err(|e| e.to_string())?;
            println!("{identity}");
            Ok(())
        }
        [cmd] if cmd == "rotate-keys" => {
            let state = open_node()?;
            let report = state.rotator.rotate().await.map_err(|e| e.to_string())?;
            println!(
                "rotated; announced to {} peer(s), queued for {}",
                report.announced.len(),
                report.queued.len()
            );
            Ok(())
        }
        _ => Err(USAGE.to_string()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("{message}");
            ExitCode::FAILURE
        }
    }
}
