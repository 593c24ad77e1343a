//! Agent heartbeat processing and the command channel.
//!
//! Heartbeats are the only server→agent channel: the response to each
//! heartbeat carries whatever commands queued up since the last one. The
//! queue is in-process state mutated by the heartbeat handler and the admin
//! terminate path; reads drain the full queue.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;

use gough_core::AgentId;
use gough_store::{AccessAgent, AgentStatus, Store};

use crate::error::{ControlError, Result};
use crate::types::{AgentCommand, HeartbeatRequest, HeartbeatResponse};
use crate::ControlConfig;

/// Heartbeat handler and per-agent command queues.
pub struct Heartbeats<S: Store> {
    store: Arc<S>,
    config: ControlConfig,
    queues: Mutex<HashMap<AgentId, Vec<AgentCommand>>>,
}

impl<S: Store> Heartbeats<S> {
    /// Create the heartbeat service.
    #[must_use]
    pub fn new(store: Arc<S>, config: ControlConfig) -> Self {
        Self {
            store,
            config,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Process one heartbeat, returning queued commands.
    ///
    /// Out-of-order heartbeats (timestamp at or before the stored
    /// `last_heartbeat_at`) are dropped without updating state; the agent
    /// still receives an empty command list rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::NotFound`] for unknown agents and
    /// [`ControlError::PermissionDenied`] for suspended ones.
    pub fn process(
        &self,
        agent_id: &AgentId,
        request: &HeartbeatRequest,
    ) -> Result<(HeartbeatResponse, Vec<gough_core::SessionId>)> {
        let mut agent = self
            .store
            .get_agent(agent_id)?
            .ok_or_else(|| ControlError::NotFound(format!("agent {agent_id}")))?;

        if agent.status == AgentStatus::Suspended {
            return Err(ControlError::PermissionDenied);
        }

        if let Some(previous) = agent.last_heartbeat_at {
            if request.timestamp <= previous {
                tracing::debug!(
                    agent_id = %agent_id,
                    timestamp = %request.timestamp,
                    previous = %previous,
                    "dropping out-of-order heartbeat"
                );
                return Ok((HeartbeatResponse::default(), Vec::new()));
            }
        }

        agent.last_heartbeat_at = Some(request.timestamp);
        agent.active_sessions = request.active_sessions;
        if matches!(
            agent.status,
            AgentStatus::Enrolled | AgentStatus::Unreachable | AgentStatus::Active
        ) {
            agent.status = AgentStatus::Active;
        }
        self.store.put_agent(&agent)?;

        let commands = self
            .queues
            .lock()
            .remove(agent_id)
            .unwrap_or_default();

        Ok((
            HeartbeatResponse { commands },
            request.closed_sessions.clone(),
        ))
    }

    /// Queue a command for delivery on the agent's next heartbeat.
    pub fn enqueue(&self, agent_id: AgentId, command: AgentCommand) {
        self.queues.lock().entry(agent_id).or_default().push(command);
    }

    /// One pass of the health monitor: mark silent agents unreachable, and
    /// long-silent ones suspended. Returns the number of status changes.
    ///
    /// # Errors
    ///
    /// Returns a store error if agent listings or writes fail.
    pub fn monitor_pass(&self) -> Result<usize> {
        let now = Utc::now();
        let unreachable_after = self.config.unreachable_after();
        let suspend_after = self.config.suspend_after();
        let mut changes = 0;

        for mut agent in self.store.list_agents()? {
            let Some(last) = agent.last_heartbeat_at else {
                continue;
            };
            let silence = now.signed_duration_since(last);

            let next_status = match agent.status {
                AgentStatus::Active if silence > unreachable_after => {
                    Some(AgentStatus::Unreachable)
                }
                AgentStatus::Unreachable if silence > suspend_after => {
                    Some(AgentStatus::Suspended)
                }
                _ => None,
            };

            if let Some(status) = next_status {
                tracing::warn!(
                    agent_id = %agent.agent_id,
                    silence_s = silence.num_seconds(),
                    ?status,
                    "agent heartbeat silence threshold crossed"
                );
                agent.status = status;
                self.store.put_agent(&agent)?;
                changes += 1;
            }
        }
        Ok(changes)
    }

    /// Select the least-loaded active agent offering a capability.
    ///
    /// # Errors
    ///
    /// Returns a store error if the agent listing fails.
    pub fn select_agent(&self, capability: &str) -> Result<Option<AccessAgent>> {
        let mut candidates: Vec<AccessAgent> = self
            .store
            .list_agents_by_status(AgentStatus::Active)?
            .into_iter()
            .filter(|a| a.capabilities.iter().any(|c| c == capability))
            .collect();
        candidates.sort_by_key(|a| a.active_sessions);
        Ok(candidates.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use gough_core::SessionId;
    use gough_store::RocksStore;
    use crate::types::ResourceUsage;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<RocksStore>,
        heartbeats: Heartbeats<RocksStore>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let heartbeats = Heartbeats::new(Arc::clone(&store), ControlConfig::default());
        Fixture {
            _dir: dir,
            store,
            heartbeats,
        }
    }

    fn add_agent(f: &Fixture, status: AgentStatus) -> AgentId {
        let agent = AccessAgent {
            agent_id: AgentId::generate(),
            hostname: "agent-1".to_string(),
            public_ip: "10.0.0.5".to_string(),
            rssh_port: 2222,
            enrollment_key_hash: "h".to_string(),
            refresh_token_id: None,
            last_heartbeat_at: None,
            status,
            capabilities: vec!["ssh".to_string()],
            agent_version: "1.0.0".to_string(),
            active_sessions: 0,
            created_at: Utc::now(),
        };
        f.store.put_agent(&agent).unwrap();
        agent.agent_id
    }

    fn heartbeat(agent_id: AgentId, timestamp: chrono::DateTime<Utc>) -> HeartbeatRequest {
        HeartbeatRequest {
            agent_id,
            status: "healthy".to_string(),
            active_sessions: 1,
            closed_sessions: vec![],
            resource_usage: ResourceUsage::default(),
            timestamp,
        }
    }

    #[test]
    fn first_heartbeat_activates() {
        let f = fixture();
        let agent_id = add_agent(&f, AgentStatus::Enrolled);

        let now = Utc::now();
        f.heartbeats.process(&agent_id, &heartbeat(agent_id, now)).unwrap();

        let agent = f.store.get_agent(&agent_id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.last_heartbeat_at, Some(now));
        assert_eq!(agent.active_sessions, 1);
    }

    #[test]
    fn out_of_order_heartbeat_is_dropped() {
        let f = fixture();
        let agent_id = add_agent(&f, AgentStatus::Enrolled);

        let now = Utc::now();
        f.heartbeats.process(&agent_id, &heartbeat(agent_id, now)).unwrap();

        let mut stale = heartbeat(agent_id, now - Duration::seconds(5));
        stale.active_sessions = 99;
        f.heartbeats.process(&agent_id, &stale).unwrap();

        let agent = f.store.get_agent(&agent_id).unwrap().unwrap();
        assert_eq!(agent.last_heartbeat_at, Some(now));
        assert_eq!(agent.active_sessions, 1);
    }

    #[test]
    fn suspended_agent_is_refused() {
        let f = fixture();
        let agent_id = add_agent(&f, AgentStatus::Suspended);

        let result = f
            .heartbeats
            .process(&agent_id, &heartbeat(agent_id, Utc::now()));
        assert!(matches!(result, Err(ControlError::PermissionDenied)));
    }

    #[test]
    fn commands_are_drained_once() {
        let f = fixture();
        let agent_id = add_agent(&f, AgentStatus::Enrolled);
        let session_id = SessionId::generate();
        f.heartbeats
            .enqueue(agent_id, AgentCommand::TerminateSession { session_id });
        f.heartbeats.enqueue(agent_id, AgentCommand::ReloadConfig);

        let (response, _) = f
            .heartbeats
            .process(&agent_id, &heartbeat(agent_id, Utc::now()))
            .unwrap();
        assert_eq!(response.commands.len(), 2);
        assert_eq!(
            response.commands[0],
            AgentCommand::TerminateSession { session_id }
        );

        let (response, _) = f
            .heartbeats
            .process(&agent_id, &heartbeat(agent_id, Utc::now() + Duration::seconds(1)))
            .unwrap();
        assert!(response.commands.is_empty());
    }

    #[test]
    fn monitor_marks_unreachable_then_suspended() {
        let f = fixture();
        let agent_id = add_agent(&f, AgentStatus::Enrolled);

        // Heartbeat far in the past.
        let stale = Utc::now() - Duration::seconds(120);
        f.heartbeats.process(&agent_id, &heartbeat(agent_id, stale)).unwrap();

        assert_eq!(f.heartbeats.monitor_pass().unwrap(), 1);
        let agent = f.store.get_agent(&agent_id).unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Unreachable);

        // Not yet an hour of silence, so a second pass changes nothing.
        assert_eq!(f.heartbeats.monitor_pass().unwrap(), 0);
    }

    #[test]
    fn selection_prefers_least_loaded() {
        let f = fixture();
        let busy = add_agent(&f, AgentStatus::Enrolled);
        let idle = add_agent(&f, AgentStatus::Enrolled);

        let mut request = heartbeat(busy, Utc::now());
        request.active_sessions = 5;
        f.heartbeats.process(&busy, &request).unwrap();

        let mut request = heartbeat(idle, Utc::now());
        request.active_sessions = 0;
        f.heartbeats.process(&idle, &request).unwrap();

        let selected = f.heartbeats.select_agent("ssh").unwrap().unwrap();
        assert_eq!(selected.agent_id, idle);

        assert!(f.heartbeats.select_agent("docker").unwrap().is_none());
    }
}
