use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::ControlMsg;

/// Periodic staleness sweep. Only the wall clock is sampled here; the
/// engine task owns the registry and applies the demotions.
pub(crate) fn spawn(
    ctl_tx: mpsc::Sender<ControlMsg>,
    mut shutdown: watch::Receiver<bool>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // interval fires immediately; skip the zeroth tick
        ticker.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    debug!(event = "staleness_tick");
                    if ctl_tx.send(ControlMsg::MarkStale(Utc::now())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(event = "staleness_monitor_stop");
    })
}
