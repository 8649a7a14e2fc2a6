use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::info;

use crate::core::SystemState;
use crate::AsyncMutex;

/// Run a balance pass every `interval` on top of event-driven passes.
pub fn spawn_periodic_balance(
    state: Arc<AsyncMutex<SystemState>>,
    interval: Duration,
) -> JoinHandle<()> {
    info!("Starting periodic balancing every {:?}", interval);

    tokio::spawn(async move {
        let mut timer = time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately.
        timer.tick().await;
        loop {
            timer.tick().await;
            state.lock().await.balance().await;
        }
    })
}
