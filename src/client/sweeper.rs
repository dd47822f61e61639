use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio::{select, time};
use tracing::{debug, info};

use crate::client::config::ClientConfig;
use crate::client::registry::RequestRegistry;


/// Periodically evicts pending requests that outlived [ClientConfig::max_request_lifetime]. This
///  is purely about bounding memory: the requester is not notified beyond its sink being closed.
pub async fn run_sweeper(config: Arc<ClientConfig>, registry: Arc<RequestRegistry>, mut cancel_receiver: broadcast::Receiver<()>) {
    let mut sweep_ticks = time::interval(config.sweep_interval);
    sweep_ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately
    sweep_ticks.tick().await;

    loop {
        select! {
            _ = sweep_ticks.tick() => {
                let evicted = registry.sweep_older_than(config.max_request_lifetime).await;
                if evicted > 0 {
                    info!("evicted {} timed out requests", evicted);
                }
            }
            _ = cancel_receiver.recv() => break,
        }
    }
    debug!("sweeper stopped");
}
