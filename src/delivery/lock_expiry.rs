use std::sync::Weak;
use std::time::Duration;

use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::delivery::destination::DestinationRegistry;

/// Periodically expires message locks and re-exposes hidden messages in all destinations.
///  Terminates when the registry is dropped.
pub async fn run_lock_expiry_loop(destinations: Weak<DestinationRegistry>, check_interval: Duration) {
    let mut ticks = interval(check_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;

        let Some(destinations) = destinations.upgrade() else {
            debug!("destinations are gone - stopping lock expiry loop");
            break;
        };

        let now = Instant::now();
        let num_affected = destinations.all().iter()
            .map(|d| d.expire(now))
            .sum::<usize>();
        if num_affected > 0 {
            trace!("lock expiry: {} messages available again", num_affected);
        }
    }
}
