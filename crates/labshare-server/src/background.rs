//! Background tasks for the labshare node.
//!
//! Includes:
//! - Health probes of every known peer (which also re-deliver queued key
//!   announcements).
//! - Resetting the public query budget.
//! - Periodic key rotation.
//! - Sweeping the user key directory for new and expired identities.

use crate::{quota, AppState};
use chrono::Utc;
use labshare_federation::RotationError;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Starts the peer health probe task.
///
/// Each pass pings every node in the directory, replaces the availability
/// snapshot, and flushes pending announcements to nodes that answered.
pub async fn start_health_probe_task(state: Arc<AppState>, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::warn!("health probe task disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(interval_seconds, "starting peer health probe task");

    loop {
        sleep(interval).await;

        match state.client.broadcast_health_probe().await {
            Ok(snapshot) => {
                let reachable = snapshot.iter().filter(|n| n.reachable).count();
                tracing::debug!(
                    nodes = snapshot.len(),
                    reachable,
                    "health probe complete"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "health probe failed");
            }
        }
    }
}

/// Starts the task that restores the public query budget.
pub async fn start_quota_reset_task(state: Arc<AppState>, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::warn!("quota reset task disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(interval_seconds, "starting public quota reset task");

    loop {
        sleep(interval).await;

        let pool = state.pool.clone();
        let limit = state.public_daily_limit;
        let res = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| e.to_string())?;
            quota::reset(&conn, limit).map_err(|e| e.to_string())
        })
        .await;

        match res {
            Ok(Ok(())) => {
                tracing::info!(limit, "public query quota reset");
            }
            Ok(Err(e)) => {
                tracing::error!("failed to reset public quota: {}", e);
            }
            Err(e) => {
                tracing::error!("quota reset task join error: {}", e);
            }
        }
    }
}

/// Starts the periodic key rotation task.
pub async fn start_rotation_task(state: Arc<AppState>, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::warn!("key rotation task disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(interval_seconds, "starting key rotation task");

    loop {
        sleep(interval).await;

        match state.rotator.rotate_or_finish().await {
            Ok(report) => {
                tracing::info!(
                    announced = report.announced.len(),
                    queued = report.queued.len(),
                    "key rotation complete"
                );
            }
            Err(RotationError::AlreadyRunning) => {
                tracing::warn!("skipping scheduled rotation: one is already in progress");
            }
            Err(e) => {
                tracing::error!(error = %e, "scheduled key rotation failed");
            }
        }
    }
}

/// Starts the identity expiry sweep.
///
/// New key files are put under expiry tracking; expired identities are
/// reported but their files are left in place.
pub async fn start_expiry_sweep_task(state: Arc<AppState>, interval_seconds: u64) {
    if interval_seconds == 0 {
        tracing::warn!("expiry sweep task disabled (interval=0)");
        return;
    }
    let interval = Duration::from_secs(interval_seconds);
    tracing::info!(interval_seconds, "starting identity expiry sweep task");

    loop {
        sleep(interval).await;

        let pool = state.pool.clone();
        let registry = state.registry.clone();
        let res = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| e.to_string())?;
            registry
                .sweep_key_directory(&conn, Utc::now().date_naive())
                .map_err(|e| e.to_string())
        })
        .await;

        match res {
            Ok(Ok(report)) => {
                if report.newly_observed > 0 {
                    tracing::info!(
                        count = report.newly_observed,
                        "started tracking new identities"
                    );
                }
                for identity in &report.expired {
                    tracing::debug!(identity = %identity, "identity expired");
                }
            }
            Ok(Err(e)) => {
                tracing::error!("failed to sweep identity keys: {}", e);
            }
            Err(e) => {
                tracing::error!("expiry sweep task join error: {}", e);
            }
        }
    }
}
