use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::store::{IntervalStore, StoreError};

const CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<IntervalStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = compact_if_needed(&store, threshold).await {
            tracing::error!("WAL compaction failed: {e}");
        }
    }
}

/// Compact when at least `threshold` appends happened since the last
/// compaction. Returns whether it ran.
pub async fn compact_if_needed(store: &IntervalStore, threshold: u64) -> Result<bool, StoreError> {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    store.compact_wal().await?;
    info!(
        "compacted WAL after {appends} appends ({} live bookings)",
        store.booking_count()
    );
    Ok(true)
}
