//! Background removal of closed usage windows.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::store::UsageStore;

/// Settings for the counter sweeper.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// How often to sweep.
    pub interval: Duration,
    /// How long a closed window is kept before it may be deleted.
    pub grace: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            grace: Duration::from_secs(60),
        }
    }
}

/// Spawn a task purging expired counters every `config.interval` until
/// `shutdown` flips to `true`.
///
/// The first sweep is delayed by a random fraction of the interval so that
/// gate instances started together do not sweep together.
pub fn spawn_cleanup(
    store: Arc<dyn UsageStore>,
    config: CleanupConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let jitter = config.interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
        info!(
            interval_secs = config.interval.as_secs(),
            jitter_ms = jitter.as_millis() as u64,
            "Starting counter cleanup"
        );

        let start = tokio::time::Instant::now() + jitter;
        let mut ticks = IntervalStream::new(tokio::time::interval_at(start, config.interval));

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                tick = ticks.next() => {
                    if tick.is_none() {
                        break;
                    }
                    match store.purge_expired(Utc::now(), config.grace).await {
                        Ok(0) => debug!("No expired counters"),
                        Ok(purged) => info!(purged, "Purged expired counters"),
                        Err(e) => warn!(error = %e, "Counter cleanup failed"),
                    }
                }
            }
        }

        info!("Counter cleanup stopped");
    })
}
