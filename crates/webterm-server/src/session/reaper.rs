//! Periodic sweep of idle, unattached sessions.

use super::registry::SessionRegistry;
use crate::auth::AuthRateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Start the reaper. Every `period` it tears down sessions that have had no
/// connections for longer than `session_timeout` and drops stale rate-limit
/// entries. Abort the returned handle to stop it.
pub fn spawn_reaper(
    registry: Arc<SessionRegistry>,
    rate_limits: Arc<Mutex<AuthRateLimiter>>,
    period: Duration,
    session_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;

            let reaped = registry.reap_idle(session_timeout).await;
            rate_limits.lock().await.gc();

            if !reaped.is_empty() {
                let remaining = registry.count().await;
                debug!(count = reaped.len(), remaining, "reaper pass");
            }
        }
    })
}
