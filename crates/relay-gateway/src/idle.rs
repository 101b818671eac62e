// Periodic eviction of connections that have gone quiet.
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

use crate::connection::Connection;
use crate::manager::ConnectionManager;

// How often the reaper sweeps the connection set.
const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Close every connection whose last activity is older than `idle_timeout_ms`.
/// Candidates are collected from a snapshot and closed outside the map lock.
pub fn sweep(manager: &ConnectionManager, idle_timeout_ms: u64) -> usize {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let expired: Vec<Arc<Connection>> = manager
        .snapshot()
        .into_iter()
        .filter(|conn| {
            let last = conn.last_active_ms();
            last > 0 && now_ms.saturating_sub(last) > idle_timeout_ms
        })
        .collect();
    let count = expired.len();
    for conn in expired {
        tracing::info!(session_id = %conn.session_id(), "closing idle connection");
        conn.close();
    }
    count
}

/// Spawn the reaper task. It exits when the shutdown signal fires.
pub fn spawn(
    manager: Arc<ConnectionManager>,
    idle_timeout_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep(&manager, idle_timeout_ms);
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
