//! 会话清理与分片暂存区清理的后台任务。

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::auth::SessionGate;
use crate::config::{ARENA_SWEEP_INTERVAL_SECS, SESSION_PRUNE_INTERVAL_SECS};
use crate::storage::MediaLayout;
use crate::upload::sweep_stale_chunks;

/// 启动后台任务（会话清理；`arena_ttl` 非零时清理过期分片）。
pub fn spawn_background_tasks(gate: Arc<SessionGate>, layout: MediaLayout, arena_ttl: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PRUNE_INTERVAL_SECS));
        loop {
            interval.tick().await;
            gate.prune_expired().await;
        }
    });

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(ARENA_SWEEP_INTERVAL_SECS));
        loop {
            interval.tick().await;
            if let Err(err) = sweep_stale_chunks(&layout, arena_ttl).await {
                warn!(error = %err, "chunk arena sweep failed");
            }
        }
    });
}
