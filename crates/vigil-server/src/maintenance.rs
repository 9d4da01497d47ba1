use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use vigil_common::clock::Clock;
use vigil_notify::dispatcher::DispatchEngine;

const PRUNE_INTERVAL_SECS: u64 = 3600;

/// Forgets finished messages older than `retention_secs`.
pub fn prune_expired(engine: &DispatchEngine, clock: &dyn Clock, retention_secs: u64) -> usize {
    let cutoff = i64::try_from(retention_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .and_then(|retention| clock.now().checked_sub_signed(retention));
    // Nothing can be older than an unrepresentable retention.
    let Some(cutoff) = cutoff else {
        return 0;
    };
    let removed = engine.prune_terminal(cutoff);
    if removed > 0 {
        tracing::info!(removed, retention_secs, "Pruned finished notifications");
    }
    removed
}

pub fn log_stats(engine: &DispatchEngine) {
    let stats = engine.stats();
    tracing::info!(
        sent = stats.total_sent,
        delivered = stats.total_delivered,
        failed = stats.total_failed,
        suppressed = stats.total_suppressed,
        cancelled = stats.total_cancelled,
        delivery_rate = stats.delivery_rate,
        queued = stats.queue_depth.values().sum::<usize>(),
        last_24h_sent = stats.last_24_hours.sent,
        "Dispatch statistics"
    );
    for channel in engine.registry().snapshot().iter().filter(|c| !c.healthy) {
        tracing::warn!(
            channel_id = %channel.id,
            consecutive_failures = channel.consecutive_failures,
            "Channel unhealthy"
        );
    }
}

/// Spawns the hourly prune task and, when `stats_interval_secs > 0`, the
/// periodic statistics log.
pub fn spawn(
    engine: Arc<DispatchEngine>,
    clock: Arc<dyn Clock>,
    retention_secs: u64,
    stats_interval_secs: u64,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let prune_engine = engine.clone();
    handles.push(tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(PRUNE_INTERVAL_SECS));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            prune_expired(&prune_engine, clock.as_ref(), retention_secs);
        }
    }));

    if stats_interval_secs > 0 {
        handles.push(tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(stats_interval_secs));
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            tick.tick().await;
            loop {
                tick.tick().await;
                log_stats(&engine);
            }
        }));
    } else {
        tracing::info!("Periodic statistics log disabled");
    }

    handles
}
