use std::time::Instant;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use crate::store::Store;

/// Background purge of expired entries. Lazy expiration on the read paths is
/// authoritative; this loop only bounds how long dead entries hold memory.
pub(crate) async fn run_sweeper(store: Store, interval_secs: u64) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let removed = store.write().await.purge_expired(Instant::now());
        if removed > 0 {
            debug!(removed, "swept expired keys");
        }
    }
}
