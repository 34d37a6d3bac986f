use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, warn};

use crate::store::SnapshotStore;

/// Periodically drop expired entries from the store.
pub fn spawn(store: Arc<dyn SnapshotStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(every);
        // first tick fires immediately; nothing has expired yet
        tick.tick().await;
        loop {
            tick.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(n) => debug!(purged = n, "expired entries removed"),
                Err(e) => warn!(error = %e, "expiry sweep failed"),
            }
        }
    })
}
