use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::cache::TenantCache;
use crate::metrics::CacheMetrics;

/// Background task that evicts expired tenant cache entries.
///
/// Reads already treat expired entries as absent; the sweep only bounds
/// memory held by entries nobody reads again.
pub struct CacheSweepTask {
    cache: Arc<dyn TenantCache>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl CacheSweepTask {
    pub fn new(
        cache: Arc<dyn TenantCache>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            cache,
            interval: interval.max(Duration::from_secs(1)),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Cache sweep task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Cache sweep task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("Cache sweep task stopped");
    }

    async fn sweep(&self) {
        match self.cache.sweep_expired().await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Swept expired cache entries"),
            Err(e) => tracing::warn!(error = %e, "Cache sweep failed"),
        }

        let stats = self.cache.stats().await;
        CacheMetrics::set_entries(stats.total_entries);
    }
}
