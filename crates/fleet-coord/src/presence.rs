//! Agent presence. `decide` is the pure machine; `PresenceTracker` owns the
//! per-agent state and hands back persistence intents for the caller to run.

use fleet_core::model::{AgentId, Availability};
use fleet_core::CoordError;
use std::collections::{BTreeMap, HashMap};

pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEvent {
    Connected { session: SessionId },
    Disconnected { session: SessionId },
    Toggle { available: bool },
}

impl PresenceEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PresenceEvent::Connected { .. } => "connected",
            PresenceEvent::Disconnected { .. } => "disconnected",
            PresenceEvent::Toggle { .. } => "toggle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AgentPresence {
    pub session: Option<SessionId>,
    pub enabled: bool,
    pub busy: bool,
    pub last_event_ms: i64,
}

impl AgentPresence {
    pub fn availability(&self) -> Availability {
        match (self.session, self.enabled, self.busy) {
            (Some(_), true, true) => Availability::Busy,
            (Some(_), true, false) => Availability::Available,
            _ => Availability::Inactive,
        }
    }
}

/// Next presence for `event`, or `None` when the event is superseded and
/// must be ignored. Toggles older than the last applied event lose; connects
/// and disconnects are never dropped for age.
pub fn decide(
    agent_id: AgentId,
    current: &AgentPresence,
    event: PresenceEvent,
    at_ms: i64,
) -> Result<Option<AgentPresence>, CoordError> {
    let last_event_ms = current.last_event_ms.max(at_ms);
    match event {
        PresenceEvent::Connected { session } => Ok(Some(AgentPresence {
            session: Some(session),
            enabled: true,
            last_event_ms,
            ..*current
        })),
        PresenceEvent::Disconnected { session } => {
            if current.session != Some(session) {
                return Ok(None);
            }
            Ok(Some(AgentPresence {
                session: None,
                enabled: false,
                last_event_ms,
                ..*current
            }))
        }
        PresenceEvent::Toggle { available } => {
            if at_ms < current.last_event_ms {
                return Ok(None);
            }
            if available && current.session.is_none() {
                return Err(CoordError::InvalidTransition(format!(
                    "agent {agent_id} has no connected session"
                )));
            }
            Ok(Some(AgentPresence {
                enabled: available,
                last_event_ms,
                ..*current
            }))
        }
    }
}

/// Durable update the caller must persist. `rollback_to` is set when a failed
/// write should restore the previous in-memory presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceIntent {
    pub agent_id: AgentId,
    pub state: Availability,
    pub previous: Availability,
    version: u64,
    rollback_to: Option<AgentPresence>,
}

impl PresenceIntent {
    pub fn can_roll_back(&self) -> bool {
        self.rollback_to.is_some()
    }
}

#[derive(Debug, Clone, Default)]
struct Slot {
    name: String,
    presence: AgentPresence,
    version: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    agents: HashMap<AgentId, Slot>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an agent as Inactive, or refreshes the name of a known one.
    pub fn register(&mut self, agent_id: AgentId, name: &str) -> bool {
        match self.agents.get_mut(&agent_id) {
            Some(slot) => {
                slot.name = name.to_string();
                false
            }
            None => {
                self.agents.insert(
                    agent_id,
                    Slot {
                        name: name.to_string(),
                        ..Slot::default()
                    },
                );
                true
            }
        }
    }

    pub fn contains(&self, agent_id: AgentId) -> bool {
        self.agents.contains_key(&agent_id)
    }

    pub fn presence(&self, agent_id: AgentId) -> Option<AgentPresence> {
        self.agents.get(&agent_id).map(|slot| slot.presence)
    }

    pub fn availability(&self, agent_id: AgentId) -> Option<Availability> {
        self.presence(agent_id)
            .map(|presence| presence.availability())
    }

    pub fn session(&self, agent_id: AgentId) -> Option<SessionId> {
        self.presence(agent_id).and_then(|presence| presence.session)
    }

    pub fn is_live(&self, agent_id: AgentId, session: SessionId) -> bool {
        self.session(agent_id) == Some(session)
    }

    /// Name and availability for every known agent.
    pub fn roster(&self) -> BTreeMap<AgentId, (String, Availability)> {
        self.agents
            .iter()
            .map(|(id, slot)| (*id, (slot.name.clone(), slot.presence.availability())))
            .collect()
    }

    /// Runs `event` through `decide` and applies the result. Returns an
    /// intent only when the visible availability changed.
    pub fn apply(
        &mut self,
        agent_id: AgentId,
        event: PresenceEvent,
        at_ms: i64,
    ) -> Result<Option<PresenceIntent>, CoordError> {
        let slot = self
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| CoordError::NotFound(format!("agent {agent_id}")))?;
        let Some(next) = decide(agent_id, &slot.presence, event, at_ms)? else {
            return Ok(None);
        };
        // A failed disconnect write must not resurrect a closed session.
        let rollback = !matches!(event, PresenceEvent::Disconnected { .. });
        Ok(Self::replace(agent_id, slot, next, rollback))
    }

    /// Workload flag: active agents carrying packages report Busy.
    pub fn set_busy(&mut self, agent_id: AgentId, busy: bool) -> Option<PresenceIntent> {
        let slot = self.agents.get_mut(&agent_id)?;
        if slot.presence.busy == busy {
            return None;
        }
        let next = AgentPresence {
            busy,
            ..slot.presence
        };
        Self::replace(agent_id, slot, next, true)
    }

    /// Restores the pre-intent presence unless something newer has been
    /// applied since. Returns whether the rollback happened.
    pub fn rollback(&mut self, intent: &PresenceIntent) -> bool {
        let Some(previous) = intent.rollback_to else {
            return false;
        };
        match self.agents.get_mut(&intent.agent_id) {
            Some(slot) if slot.version == intent.version => {
                slot.presence = previous;
                slot.version += 1;
                true
            }
            _ => false,
        }
    }

    fn replace(
        agent_id: AgentId,
        slot: &mut Slot,
        next: AgentPresence,
        rollback: bool,
    ) -> Option<PresenceIntent> {
        let previous = slot.presence;
        slot.presence = next;
        slot.version += 1;
        let (before, after) = (previous.availability(), next.availability());
        if before == after {
            return None;
        }
        Some(PresenceIntent {
            agent_id,
            state: after,
            previous: before,
            version: slot.version,
            rollback_to: rollback.then_some(previous),
        })
    }
}
