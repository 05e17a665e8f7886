use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetdesk_core::{Backend, BackendError, ChangeEnvelope, Entity};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Resubscribe attempts after the feed closes before giving up and
    /// raising the degraded flag.
    pub retry_budget: u32,
    /// Base delay between resubscribe attempts; doubles per attempt.
    pub retry_delay: Duration,
    pub channel_capacity: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            retry_budget: 5,
            retry_delay: Duration::from_millis(500),
            channel_capacity: 256,
        }
    }
}

/// Wraps the backend's change bus into per-entity pump tasks feeding the
/// engine task. Transient lag and reconnects are absorbed here; only a
/// permanently lost feed surfaces, as the degraded flag.
pub(crate) struct ChangeFeedAdapter {
    backend: Arc<dyn Backend>,
    config: FeedConfig,
    degraded_tx: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
}

impl ChangeFeedAdapter {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        config: FeedConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, watch::Receiver<bool>) {
        let (degraded_tx, degraded_rx) = watch::channel(false);
        (
            Self {
                backend,
                config,
                degraded_tx: Arc::new(degraded_tx),
                shutdown,
            },
            degraded_rx,
        )
    }

    /// All-or-nothing subscription for every watched entity.
    pub(crate) fn subscribe_all(
        &self,
    ) -> Result<Vec<(Entity, broadcast::Receiver<ChangeEnvelope>)>, BackendError> {
        let mut subscriptions = Vec::with_capacity(Entity::ALL.len());
        for entity in Entity::ALL {
            subscriptions.push((entity, self.backend.subscribe(entity)?));
        }
        Ok(subscriptions)
    }

    pub(crate) fn spawn_pumps(
        &self,
        subscriptions: Vec<(Entity, broadcast::Receiver<ChangeEnvelope>)>,
        tx: mpsc::Sender<ChangeEnvelope>,
    ) -> Vec<JoinHandle<()>> {
        subscriptions
            .into_iter()
            .map(|(entity, rx)| {
                spawn_pump(
                    self.backend.clone(),
                    entity,
                    rx,
                    tx.clone(),
                    self.config.clone(),
                    self.degraded_tx.clone(),
                    self.shutdown.clone(),
                )
            })
            .collect()
    }

    pub(crate) fn clear_degraded(&self) {
        self.degraded_tx.send_if_modified(|flag| {
            let was = *flag;
            *flag = false;
            was
        });
    }
}

fn spawn_pump(
    backend: Arc<dyn Backend>,
    entity: Entity,
    initial: broadcast::Receiver<ChangeEnvelope>,
    tx: mpsc::Sender<ChangeEnvelope>,
    config: FeedConfig,
    degraded_tx: Arc<watch::Sender<bool>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = initial;
        let mut attempts: u32 = 0;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = rx.recv() => match received {
                    Ok(envelope) => {
                        if attempts > 0 {
                            info!(event = "feed_recovered", entity = entity.as_str(), attempts);
                            attempts = 0;
                        }
                        if envelope.entity != entity {
                            continue;
                        }
                        if tx.send(envelope).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "feed_lagged", entity = entity.as_str(), skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        attempts += 1;
                        if attempts > config.retry_budget {
                            warn!(
                                event = "feed_degraded",
                                entity = entity.as_str(),
                                attempts = attempts - 1
                            );
                            degraded_tx.send_if_modified(|flag| {
                                let was = *flag;
                                *flag = true;
                                !was
                            });
                            break;
                        }
                        let backoff = config
                            .retry_delay
                            .saturating_mul(2u32.saturating_pow(attempts.min(4) - 1));
                        debug!(
                            event = "feed_resubscribe",
                            entity = entity.as_str(),
                            attempt = attempts,
                            backoff_ms = backoff.as_millis() as u64
                        );
                        tokio::time::sleep(backoff).await;
                        match backend.subscribe(entity) {
                            Ok(next) => rx = next,
                            Err(err) => {
                                // Keep the closed receiver; the next recv
                                // burns another attempt.
                                warn!(event = "feed_subscribe_error", entity = entity.as_str(), error = %err);
                            }
                        }
                    }
                }
            }
        }
        debug!(event = "feed_pump_stop", entity = entity.as_str());
    })
}
