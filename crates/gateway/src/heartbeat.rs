use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use streamsync_protocol::HEARTBEAT_INTERVAL;

use crate::connection::Connection;
use crate::manager::Manager;

// ── Liveness buckets ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Healthy,
    Warning,
    Unhealthy,
}

/// Bucket a connection by how stale its last liveness signal is.
pub fn classify(staleness: Duration) -> Liveness {
    if staleness < Duration::from_secs(30) {
        Liveness::Healthy
    } else if staleness < Duration::from_secs(60) {
        Liveness::Warning
    } else {
        Liveness::Unhealthy
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LivenessReport {
    pub healthy: usize,
    pub warning: usize,
    pub unhealthy: usize,
}

pub fn report(connections: &[Arc<Connection>]) -> LivenessReport {
    let mut out = LivenessReport::default();
    for conn in connections {
        match classify(conn.staleness()) {
            Liveness::Healthy => out.healthy += 1,
            Liveness::Warning => out.warning += 1,
            Liveness::Unhealthy => out.unhealthy += 1,
        }
    }
    out
}

// ── Sweep task ───────────────────────────────────────────────────────────────

/// Periodic sweep closing connections past the liveness deadline.
pub(crate) async fn run(manager: Arc<Manager>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.tick().await; // consume the immediate first tick
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let reaped = manager.reap_stale().await;
                if reaped > 0 {
                    info!(reaped, "heartbeat reaped stale connections");
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_boundaries() {
        assert_eq!(classify(Duration::from_secs(0)), Liveness::Healthy);
        assert_eq!(classify(Duration::from_secs(29)), Liveness::Healthy);
        assert_eq!(classify(Duration::from_secs(30)), Liveness::Warning);
        assert_eq!(classify(Duration::from_secs(59)), Liveness::Warning);
        assert_eq!(classify(Duration::from_secs(60)), Liveness::Unhealthy);
        assert_eq!(classify(Duration::from_secs(600)), Liveness::Unhealthy);
    }

    #[tokio::test]
    async fn report_counts_buckets() {
        let (fresh, _rx1) = Connection::new("u1", None);
        let (stale, _rx2) = Connection::new("u2", None);
        stale.force_last_pong(0);

        let out = report(&[fresh, stale]);
        assert_eq!(out.healthy, 1);
        assert_eq!(out.unhealthy, 1);
        assert_eq!(out.warning, 0);
    }
}
