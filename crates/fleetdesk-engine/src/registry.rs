use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use fleetdesk_core::{Agent, AgentStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum AgentChange {
    Insert(Agent),
    Update(Agent),
    Delete(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Inserted,
    Updated { previous_status: AgentStatus },
    Removed(Box<Agent>),
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FleetSnapshot {
    pub agents: Vec<Agent>,
    pub online_count: usize,
    pub feed_degraded: bool,
    pub taken_at: DateTime<Utc>,
}

/// In-memory view of the fleet, insertion-ordered. Exclusively owned by the
/// engine task; all mutation goes through the operations below, which are
/// idempotent under the at-least-once delivery of the change feed.
#[derive(Debug, Default)]
pub struct FleetRegistry {
    agents: Vec<Agent>,
    index: HashMap<String, usize>,
}

impl FleetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn get(&self, agent_id: &str) -> Option<&Agent> {
        self.index.get(agent_id).map(|idx| &self.agents[*idx])
    }

    /// Known and not offline. Dispatch callers check this; the correlator
    /// itself does not re-validate.
    pub fn is_dispatchable(&self, agent_id: &str) -> bool {
        self.get(agent_id)
            .map(|agent| agent.status != AgentStatus::Offline)
            .unwrap_or(false)
    }

    /// Wholesale replacement from a point-in-time fetch. Later duplicates of
    /// the same identifier in `agents` are dropped, keeping the first.
    pub fn load_initial(&mut self, agents: Vec<Agent>) {
        self.agents.clear();
        self.index.clear();
        for agent in agents {
            if self.index.contains_key(&agent.agent_id) {
                continue;
            }
            self.index.insert(agent.agent_id.clone(), self.agents.len());
            self.agents.push(agent);
        }
    }

    pub fn apply_change(&mut self, change: AgentChange) -> Applied {
        match change {
            AgentChange::Insert(agent) => {
                if self.index.contains_key(&agent.agent_id) {
                    return Applied::Ignored;
                }
                self.index.insert(agent.agent_id.clone(), self.agents.len());
                self.agents.push(agent);
                Applied::Inserted
            }
            AgentChange::Update(agent) => match self.index.get(&agent.agent_id) {
                Some(idx) => {
                    let previous_status = self.agents[*idx].status;
                    self.agents[*idx] = agent;
                    Applied::Updated { previous_status }
                }
                None => Applied::Ignored,
            },
            AgentChange::Delete(agent_id) => match self.index.remove(&agent_id) {
                Some(idx) => {
                    let removed = self.agents.remove(idx);
                    for slot in self.index.values_mut() {
                        if *slot > idx {
                            *slot -= 1;
                        }
                    }
                    Applied::Removed(Box::new(removed))
                }
                None => Applied::Ignored,
            },
        }
    }

    /// Demotes every `online` agent whose last contact is older than
    /// `threshold` to `offline`. Never touches `sleeping` or `offline`
    /// agents and never upgrades. Returns the demoted identifiers.
    pub fn mark_stale(&mut self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        let mut demoted = Vec::new();
        for agent in &mut self.agents {
            if agent.status != AgentStatus::Online {
                continue;
            }
            if now.signed_duration_since(agent.last_seen) > threshold {
                agent.status = AgentStatus::Offline;
                demoted.push(agent.agent_id.clone());
            }
        }
        demoted
    }

    pub fn snapshot(&self, feed_degraded: bool) -> FleetSnapshot {
        FleetSnapshot {
            agents: self.agents.clone(),
            online_count: self
                .agents
                .iter()
                .filter(|agent| agent.status == AgentStatus::Online)
                .count(),
            feed_degraded,
            taken_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    fn agent(agent_id: &str, status: AgentStatus, last_seen: DateTime<Utc>) -> Agent {
        Agent {
            agent_id: agent_id.to_string(),
            hostname: format!("host-{agent_id}"),
            username: None,
            ip_address: None,
            os_info: None,
            status,
            last_seen,
            created_at: last_seen,
            system_info: StdHashMap::new(),
        }
    }

    #[test]
    fn insert_is_idempotent() {
        let mut registry = FleetRegistry::new();
        let a1 = agent("a1", AgentStatus::Online, Utc::now());

        assert_eq!(
            registry.apply_change(AgentChange::Insert(a1.clone())),
            Applied::Inserted
        );
        let first = registry.snapshot(false);
        assert_eq!(
            registry.apply_change(AgentChange::Insert(a1)),
            Applied::Ignored
        );
        let second = registry.snapshot(false);
        assert_eq!(first.agents, second.agents);
        assert_eq!(second.online_count, 1);
    }

    #[test]
    fn update_is_idempotent_and_ignores_unknown() {
        let mut registry = FleetRegistry::new();
        let now = Utc::now();
        registry.apply_change(AgentChange::Insert(agent("a1", AgentStatus::Online, now)));

        let updated = agent("a1", AgentStatus::Sleeping, now);
        assert_eq!(
            registry.apply_change(AgentChange::Update(updated.clone())),
            Applied::Updated {
                previous_status: AgentStatus::Online
            }
        );
        assert_eq!(
            registry.apply_change(AgentChange::Update(updated)),
            Applied::Updated {
                previous_status: AgentStatus::Sleeping
            }
        );
        assert_eq!(registry.snapshot(false).agents[0].status, AgentStatus::Sleeping);

        assert_eq!(
            registry.apply_change(AgentChange::Update(agent("ghost", AgentStatus::Online, now))),
            Applied::Ignored
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn delete_removes_and_preserves_order() {
        let mut registry = FleetRegistry::new();
        let now = Utc::now();
        for id in ["a1", "a2", "a3"] {
            registry.apply_change(AgentChange::Insert(agent(id, AgentStatus::Online, now)));
        }

        match registry.apply_change(AgentChange::Delete("a2".to_string())) {
            Applied::Removed(removed) => assert_eq!(removed.agent_id, "a2"),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(
            registry.apply_change(AgentChange::Delete("a2".to_string())),
            Applied::Ignored
        );

        let ids = registry
            .snapshot(false)
            .agents
            .iter()
            .map(|a| a.agent_id.clone())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["a1", "a3"]);
        assert_eq!(registry.get("a3").map(|a| a.agent_id.as_str()), Some("a3"));
    }

    #[test]
    fn mark_stale_demotes_only_stale_online_agents() {
        let mut registry = FleetRegistry::new();
        let now = Utc::now();
        let stale = now - Duration::seconds(200);
        registry.apply_change(AgentChange::Insert(agent("stale", AgentStatus::Online, stale)));
        registry.apply_change(AgentChange::Insert(agent("fresh", AgentStatus::Online, now)));
        registry.apply_change(AgentChange::Insert(agent(
            "asleep",
            AgentStatus::Sleeping,
            stale,
        )));
        registry.apply_change(AgentChange::Insert(agent(
            "gone",
            AgentStatus::Offline,
            stale,
        )));

        let demoted = registry.mark_stale(now, Duration::seconds(120));
        assert_eq!(demoted, vec!["stale".to_string()]);
        assert_eq!(registry.get("stale").map(|a| a.status), Some(AgentStatus::Offline));
        assert_eq!(registry.get("fresh").map(|a| a.status), Some(AgentStatus::Online));
        assert_eq!(
            registry.get("asleep").map(|a| a.status),
            Some(AgentStatus::Sleeping)
        );

        // Deterministic: a second pass with the same inputs changes nothing.
        assert!(registry.mark_stale(now, Duration::seconds(120)).is_empty());
    }

    #[test]
    fn load_initial_replaces_wholesale_and_dedups() {
        let mut registry = FleetRegistry::new();
        let now = Utc::now();
        registry.apply_change(AgentChange::Insert(agent("old", AgentStatus::Online, now)));

        registry.load_initial(vec![
            agent("a1", AgentStatus::Online, now),
            agent("a2", AgentStatus::Sleeping, now),
            agent("a1", AgentStatus::Offline, now),
        ]);

        let snapshot = registry.snapshot(false);
        assert_eq!(snapshot.agents.len(), 2);
        assert_eq!(snapshot.agents[0].agent_id, "a1");
        assert_eq!(snapshot.agents[0].status, AgentStatus::Online);
        assert_eq!(snapshot.online_count, 1);
        assert!(registry.get("old").is_none());
    }

    #[test]
    fn dispatchable_requires_known_and_not_offline() {
        let mut registry = FleetRegistry::new();
        let now = Utc::now();
        registry.apply_change(AgentChange::Insert(agent("up", AgentStatus::Online, now)));
        registry.apply_change(AgentChange::Insert(agent("nap", AgentStatus::Sleeping, now)));
        registry.apply_change(AgentChange::Insert(agent("down", AgentStatus::Offline, now)));

        assert!(registry.is_dispatchable("up"));
        assert!(registry.is_dispatchable("nap"));
        assert!(!registry.is_dispatchable("down"));
        assert!(!registry.is_dispatchable("ghost"));
    }
}
