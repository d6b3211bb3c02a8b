use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use tokio::time;
use tracing::{debug, info, info_span, Instrument};
use trino_gateway_state::QueryBindings;

/// How often idle and grace-expired query bindings are collected. Eviction
/// timing only needs to be as precise as the terminal grace window, so a
/// coarse interval keeps the sweeper cheap.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct BindingSweeper {
    bindings: Arc<QueryBindings>,
}

impl BindingSweeper {
    pub fn new(bindings: Arc<QueryBindings>) -> Self {
        Self { bindings }
    }

    pub fn start_loop(self) {
        tokio::spawn(async move {
            let mut interval = time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                // First tick does not sleep, so let's put it at the start of the loop.
                interval.tick().await;

                async {
                    match self.bindings.sweep(SystemTime::now()) {
                        0 => debug!(
                            remaining = self.bindings.len(),
                            "BindingSweeper: No query bindings to remove"
                        ),
                        removed => info!(
                            removed,
                            remaining = self.bindings.len(),
                            "BindingSweeper: Removed expired query bindings"
                        ),
                    }
                }
                .instrument(info_span!("Sweeping expired query bindings"))
                .await;
            }
        });
    }
}
