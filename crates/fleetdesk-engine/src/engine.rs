use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fleetdesk_core::{
    Agent, AgentStatus, Backend, ChangeEnvelope, ChangeOp, Command, CommandResult, Entity,
    FileListing, LogEntry, LogSeverity, Screenshot,
};

use crate::correlator::{CommandCorrelator, CommandOutcome};
use crate::error::EngineError;
use crate::feed::{ChangeFeedAdapter, FeedConfig};
use crate::monitor;
use crate::registry::{AgentChange, Applied, FleetRegistry, FleetSnapshot};
use crate::session_log::{SessionLogHandle, DEFAULT_LOG_CAPACITY};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub stale_check_interval: Duration,
    pub stale_threshold: chrono::Duration,
    pub command_timeout: Duration,
    pub log_capacity: usize,
    pub display_capacity: usize,
    pub feed: FeedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stale_check_interval: Duration::from_secs(30),
            stale_threshold: chrono::Duration::seconds(120),
            command_timeout: Duration::from_secs(30),
            log_capacity: DEFAULT_LOG_CAPACITY,
            display_capacity: 128,
            feed: FeedConfig::default(),
        }
    }
}

/// Events fanned out to attached consoles. Best effort; slow or absent
/// subscribers never block the engine task.
#[derive(Debug, Clone)]
pub enum DisplayEvent {
    Command(Command),
    Result(CommandResult),
    FileListing(FileListing),
    Screenshot(Screenshot),
    Log(LogEntry),
}

pub(crate) enum ControlMsg {
    MarkStale(DateTime<Utc>),
    LoadInitial {
        agents: Vec<Agent>,
        done: oneshot::Sender<()>,
    },
}

pub struct Engine {
    backend: Arc<dyn Backend>,
    config: EngineConfig,
    correlator: Arc<CommandCorrelator>,
    log: SessionLogHandle,
    adapter: ChangeFeedAdapter,
    change_tx: mpsc::Sender<ChangeEnvelope>,
    ctl_tx: mpsc::Sender<ControlMsg>,
    snapshot_rx: watch::Receiver<FleetSnapshot>,
    degraded_rx: watch::Receiver<bool>,
    display_tx: broadcast::Sender<DisplayEvent>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub async fn start(
        backend: Arc<dyn Backend>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let agents = backend.list_agents().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (adapter, degraded_rx) =
            ChangeFeedAdapter::new(backend.clone(), config.feed.clone(), shutdown_rx.clone());
        let (change_tx, change_rx) = mpsc::channel(config.feed.channel_capacity);
        let (ctl_tx, ctl_rx) = mpsc::channel(16);
        let (display_tx, _) = broadcast::channel(config.display_capacity);

        let log = SessionLogHandle::new(config.log_capacity, backend.clone());
        let correlator = Arc::new(CommandCorrelator::new(backend.clone()));

        let mut registry = FleetRegistry::new();
        registry.load_initial(agents);
        info!(event = "engine_start", agents = registry.len());
        let (snapshot_tx, snapshot_rx) = watch::channel(registry.snapshot(false));

        let subscriptions = adapter.subscribe_all()?;
        let mut tasks = adapter.spawn_pumps(subscriptions, change_tx.clone());

        let task = EngineTask {
            registry,
            change_rx,
            ctl_rx,
            snapshot_tx,
            degraded_rx: degraded_rx.clone(),
            shutdown_rx: shutdown_rx.clone(),
            correlator: correlator.clone(),
            log: log.clone(),
            display_tx: display_tx.clone(),
            stale_threshold: config.stale_threshold,
        };
        tasks.push(tokio::spawn(task.run()));
        tasks.push(monitor::spawn(
            ctl_tx.clone(),
            shutdown_rx,
            config.stale_check_interval,
        ));

        Ok(Self {
            backend,
            config,
            correlator,
            log,
            adapter,
            change_tx,
            ctl_tx,
            snapshot_rx,
            degraded_rx,
            display_tx,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch_snapshots(&self) -> watch::Receiver<FleetSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn feed_degraded(&self) -> bool {
        *self.degraded_rx.borrow()
    }

    pub fn subscribe_display(&self) -> broadcast::Receiver<DisplayEvent> {
        self.display_tx.subscribe()
    }

    pub fn log(&self) -> &SessionLogHandle {
        &self.log
    }

    /// Records an operator-visible entry locally and mirrors it to the
    /// shared event log so other console sessions see it.
    pub async fn record_log(&self, severity: LogSeverity, message: impl Into<String>) {
        self.log
            .record(LogEntry::new(severity, message.into(), None))
            .await;
    }

    /// Clears the local session log and best-effort purges the shared one.
    pub async fn clear_log(&self) -> usize {
        self.log.clear().await
    }

    /// Creates a command against a known, non-offline agent. The result
    /// arrives through the change feed; pair with [`Engine::await_result`].
    pub async fn dispatch(&self, agent_id: &str, command: &str) -> Result<Command, EngineError> {
        let dispatchable = {
            let snapshot = self.snapshot_rx.borrow();
            snapshot
                .agents
                .iter()
                .any(|agent| agent.agent_id == agent_id && agent.status != AgentStatus::Offline)
        };
        if !dispatchable {
            return Err(EngineError::AgentUnavailable(agent_id.to_string()));
        }
        self.correlator.dispatch(agent_id, command).await
    }

    pub async fn await_result(
        &self,
        command_id: &str,
        timeout: Duration,
    ) -> Result<CommandOutcome, EngineError> {
        self.correlator.await_result(command_id, timeout).await
    }

    pub async fn run_command(
        &self,
        agent_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<(Command, CommandOutcome), EngineError> {
        let command = self.dispatch(agent_id, command).await?;
        let timeout = timeout.unwrap_or(self.config.command_timeout);
        let outcome = self.await_result(&command.id, timeout).await?;
        Ok((command, outcome))
    }

    /// Re-reads the authoritative agent set and, if the feed had
    /// degraded, resubscribes every entity before clearing the flag.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        let agents = self.backend.list_agents().await?;
        let (done_tx, done_rx) = oneshot::channel();
        self.ctl_tx
            .send(ControlMsg::LoadInitial {
                agents,
                done: done_tx,
            })
            .await
            .map_err(|_| EngineError::Closed)?;
        done_rx.await.map_err(|_| EngineError::Closed)?;

        if self.feed_degraded() {
            let subscriptions = self.adapter.subscribe_all()?;
            let pumps = self.adapter.spawn_pumps(subscriptions, self.change_tx.clone());
            self.tasks.lock().unwrap().extend(pumps);
            self.adapter.clear_degraded();
            info!(event = "feed_resubscribed");
        }
        Ok(())
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = match self.tasks.into_inner() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        for task in tasks {
            let _ = task.await;
        }
        info!(event = "engine_stop");
    }
}

/// Single task owning the registry and applying every mutation, so no
/// snapshot can ever expose a half-applied change.
struct EngineTask {
    registry: FleetRegistry,
    change_rx: mpsc::Receiver<ChangeEnvelope>,
    ctl_rx: mpsc::Receiver<ControlMsg>,
    snapshot_tx: watch::Sender<FleetSnapshot>,
    degraded_rx: watch::Receiver<bool>,
    shutdown_rx: watch::Receiver<bool>,
    correlator: Arc<CommandCorrelator>,
    log: SessionLogHandle,
    display_tx: broadcast::Sender<DisplayEvent>,
    stale_threshold: chrono::Duration,
}

impl EngineTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                changed = self.degraded_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    self.on_degraded_flip();
                }
                envelope = self.change_rx.recv() => match envelope {
                    Some(envelope) => self.handle_change(envelope),
                    None => break,
                },
                ctl = self.ctl_rx.recv() => match ctl {
                    Some(ControlMsg::MarkStale(now)) => self.mark_stale(now),
                    Some(ControlMsg::LoadInitial { agents, done }) => {
                        self.registry.load_initial(agents);
                        info!(event = "fleet_reloaded", agents = self.registry.len());
                        self.publish();
                        let _ = done.send(());
                    }
                    None => break,
                },
            }
        }
        debug!(event = "engine_task_stop");
    }

    fn publish(&self) {
        let snapshot = self.registry.snapshot(*self.degraded_rx.borrow());
        let _ = self.snapshot_tx.send(snapshot);
    }

    fn display(&self, event: DisplayEvent) {
        let _ = self.display_tx.send(event);
    }

    fn on_degraded_flip(&mut self) {
        if *self.degraded_rx.borrow() {
            warn!(event = "feed_degraded_mode");
            self.log.append_local(LogEntry::new(
                LogSeverity::Warning,
                "Change feed lost; fleet view may be stale until refresh",
                None,
            ));
        } else {
            info!(event = "feed_restored");
            self.log.append_local(LogEntry::new(
                LogSeverity::Success,
                "Change feed restored",
                None,
            ));
        }
        self.publish();
    }

    fn handle_change(&mut self, envelope: ChangeEnvelope) {
        match envelope.entity {
            Entity::Agents => self.handle_agent_change(&envelope),
            Entity::Commands => self.handle_command_change(&envelope),
            Entity::CommandResults => self.handle_result_change(&envelope),
            Entity::FileListings => self.handle_file_listing_change(&envelope),
            Entity::Screenshots => self.handle_screenshot_change(&envelope),
            Entity::EventLogs => self.handle_event_log_change(&envelope),
        }
    }

    fn handle_agent_change(&mut self, envelope: &ChangeEnvelope) {
        let (change, agent_id, hostname, status) = match envelope.op {
            ChangeOp::Insert | ChangeOp::Update => {
                let Some(agent) = envelope.decode::<Agent>() else {
                    return self.malformed(envelope);
                };
                let agent_id = agent.agent_id.clone();
                let hostname = agent.hostname.clone();
                let status = agent.status;
                let change = if envelope.op == ChangeOp::Insert {
                    AgentChange::Insert(agent)
                } else {
                    AgentChange::Update(agent)
                };
                (change, agent_id, hostname, status)
            }
            ChangeOp::Delete => {
                let id = envelope
                    .payload()
                    .and_then(|row| row.get("agent_id"))
                    .and_then(|value| value.as_str());
                let Some(id) = id else {
                    return self.malformed(envelope);
                };
                let id = id.to_string();
                (
                    AgentChange::Delete(id.clone()),
                    id,
                    String::new(),
                    AgentStatus::Offline,
                )
            }
        };

        match self.registry.apply_change(change) {
            Applied::Inserted => {
                info!(event = "agent_joined", agent_id = %agent_id, hostname = %hostname);
                self.log.append_local(LogEntry::new(
                    LogSeverity::Success,
                    format!("Agent {hostname} connected"),
                    Some(agent_id),
                ));
                self.publish();
            }
            Applied::Updated { previous_status } => {
                if previous_status != status {
                    info!(
                        event = "agent_status_changed",
                        agent_id = %agent_id,
                        from = previous_status.as_str(),
                        to = status.as_str()
                    );
                    self.log.append_local(LogEntry::new(
                        LogSeverity::Info,
                        format!("Agent {hostname} is now {}", status.as_str()),
                        Some(agent_id),
                    ));
                }
                self.publish();
            }
            Applied::Removed(agent) => {
                info!(event = "agent_removed", agent_id = %agent.agent_id);
                self.log.append_local(LogEntry::new(
                    LogSeverity::Warning,
                    format!("Agent {} removed from fleet", agent.hostname),
                    Some(agent.agent_id.clone()),
                ));
                self.publish();
            }
            Applied::Ignored => {
                debug!(
                    event = "agent_change_ignored",
                    op = envelope.op.as_str(),
                    agent_id = %agent_id
                );
            }
        }
    }

    fn handle_command_change(&mut self, envelope: &ChangeEnvelope) {
        if envelope.op == ChangeOp::Delete {
            return;
        }
        let Some(command) = envelope.decode::<Command>() else {
            return self.malformed(envelope);
        };
        if envelope.op == ChangeOp::Insert {
            self.log.append_local(LogEntry::new(
                LogSeverity::Info,
                format!("Command sent to {}: {}", command.agent_id, command.command),
                Some(command.agent_id.clone()),
            ));
        }
        self.display(DisplayEvent::Command(command));
    }

    fn handle_result_change(&mut self, envelope: &ChangeEnvelope) {
        if envelope.op != ChangeOp::Insert {
            return;
        }
        let Some(result) = envelope.decode::<CommandResult>() else {
            return self.malformed(envelope);
        };
        let severity = if result.exit_code == 0 {
            LogSeverity::Success
        } else {
            LogSeverity::Error
        };
        self.log.append_local(LogEntry::new(
            severity,
            format!(
                "Result for command {} (exit {})",
                result.command_id, result.exit_code
            ),
            Some(result.agent_id.clone()),
        ));
        self.correlator.on_result(result.clone());
        self.display(DisplayEvent::Result(result));
    }

    fn handle_file_listing_change(&mut self, envelope: &ChangeEnvelope) {
        if envelope.op == ChangeOp::Delete {
            return;
        }
        let Some(listing) = envelope.decode::<FileListing>() else {
            return self.malformed(envelope);
        };
        self.log.append_local(LogEntry::new(
            LogSeverity::Info,
            format!(
                "File listing for {} from agent {}",
                listing.path, listing.agent_id
            ),
            Some(listing.agent_id.clone()),
        ));
        self.display(DisplayEvent::FileListing(listing));
    }

    fn handle_screenshot_change(&mut self, envelope: &ChangeEnvelope) {
        if envelope.op != ChangeOp::Insert {
            return;
        }
        let Some(shot) = envelope.decode::<Screenshot>() else {
            return self.malformed(envelope);
        };
        self.log.append_local(LogEntry::new(
            LogSeverity::Info,
            format!(
                "Screenshot from agent {} ({}x{})",
                shot.agent_id, shot.width, shot.height
            ),
            Some(shot.agent_id.clone()),
        ));
        self.display(DisplayEvent::Screenshot(shot));
    }

    fn handle_event_log_change(&mut self, envelope: &ChangeEnvelope) {
        if envelope.op != ChangeOp::Insert {
            return;
        }
        let Some(entry) = envelope.decode::<LogEntry>() else {
            return self.malformed(envelope);
        };
        if self.log.append_from_feed(entry.clone()) {
            self.display(DisplayEvent::Log(entry));
        }
    }

    fn malformed(&self, envelope: &ChangeEnvelope) {
        debug!(
            event = "malformed_change_ignored",
            entity = envelope.entity.as_str(),
            op = envelope.op.as_str()
        );
    }

    fn mark_stale(&mut self, now: DateTime<Utc>) {
        let demoted = self.registry.mark_stale(now, self.stale_threshold);
        if demoted.is_empty() {
            return;
        }
        for agent_id in &demoted {
            warn!(event = "agent_stale", agent_id = %agent_id);
            self.log.append_local(LogEntry::new(
                LogSeverity::Warning,
                format!("Agent {agent_id} marked offline after missed heartbeats"),
                Some(agent_id.clone()),
            ));
        }
        self.publish();
    }
}
