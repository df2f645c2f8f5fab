use crate::assignment::{AssignmentCoordinator, PackageNotice, Transition};
use crate::presence::{PresenceEvent, PresenceIntent, PresenceTracker, SessionId};
use crate::reconciler::{
    LocationReconciler, PositionPolicy, PushOutcome, DEFAULT_DEBOUNCE_WINDOW,
    DEFAULT_POLL_INTERVAL,
};
use crate::view::{FleetView, DEFAULT_DIFF_CAPACITY};
use fleet_core::model::{
    Agent, AgentEntry, AgentId, Availability, FleetDiff, FleetSnapshot, Package, PackageId,
    PackageState, Room,
};
use fleet_core::wire::{
    Command, CommandResultPayload, LocationSnapshotPayload, LocationUpdatePayload,
    PackageAssignedPayload, PackageStatusPayload, PresencePayload, WireMsg,
};
use fleet_core::{now_ms, CoordError, FleetStore, StoreError};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub policy: PositionPolicy,
    pub debounce_window: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub persist_attempts: u32,
    pub persist_backoff: Duration,
    pub diff_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            policy: PositionPolicy::default(),
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: Duration::from_secs(5),
            persist_attempts: 3,
            persist_backoff: Duration::from_millis(200),
            diff_capacity: DEFAULT_DIFF_CAPACITY,
        }
    }
}

/// A message the hub should deliver to every session in `rooms`.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub rooms: Vec<Room>,
    pub msg: WireMsg,
}

impl Outbound {
    pub fn admin(msg: WireMsg) -> Self {
        Self {
            rooms: vec![Room::Admin],
            msg,
        }
    }

    pub fn to_package_rooms(package: &Package, msg: WireMsg) -> Self {
        let mut rooms = vec![Room::Admin];
        if let Some(owner) = package.agent_id {
            rooms.push(Room::Agent(owner));
        }
        Self { rooms, msg }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOutcome {
    /// Older live session of the same agent that the hub must close.
    pub superseded: Option<SessionId>,
    pub outbound: Vec<Outbound>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutcome {
    pub result: CommandResultPayload,
    pub outbound: Vec<Outbound>,
}

/// Serializing authority over the position, presence and package aggregates.
///
/// Each aggregate sits behind its own mutex. When more than one is held the
/// order is view, presence, positions, packages. Store calls never run under
/// an aggregate lock, and they block: async callers go through
/// `spawn_blocking`.
pub struct FleetCoordinator {
    config: CoordinatorConfig,
    store: Arc<dyn FleetStore>,
    positions: Mutex<LocationReconciler>,
    presence: Mutex<PresenceTracker>,
    packages: Mutex<AssignmentCoordinator>,
    view: Mutex<FleetView>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FleetCoordinator {
    pub fn new(store: Arc<dyn FleetStore>, config: CoordinatorConfig) -> Self {
        let positions =
            LocationReconciler::new(config.policy, config.debounce_window, config.poll_interval);
        let view = FleetView::new(config.diff_capacity);
        Self {
            config,
            store,
            positions: Mutex::new(positions),
            presence: Mutex::new(PresenceTracker::new()),
            packages: Mutex::new(AssignmentCoordinator::new()),
            view: Mutex::new(view),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn FleetStore> {
        self.store.clone()
    }

    /// Loads agents and packages from the store. Nobody is connected yet, so
    /// every agent starts Inactive and stale stored presence is corrected.
    pub fn bootstrap(&self) -> Result<(), CoordError> {
        let agents = self.store.fetch_agents().map_err(|err| fetch_error("agents", err))?;
        let packages = self
            .store
            .fetch_packages()
            .map_err(|err| fetch_error("packages", err))?;
        let package_count = packages.len();

        {
            let mut presence = lock(&self.presence);
            for agent in &agents {
                presence.register(agent.id, &agent.name);
            }
        }
        let positions: BTreeMap<AgentId, _> =
            agents.iter().map(|agent| (agent.id, agent.position)).collect();
        lock(&self.positions).apply_snapshot(&positions, now_ms());
        lock(&self.packages).load(packages);

        for agent in &agents {
            let busy = lock(&self.packages).has_workload(agent.id);
            // Every agent is still Inactive here, so the workload flag cannot
            // change what anyone observes.
            let intent = lock(&self.presence).set_busy(agent.id, busy);
            debug_assert!(intent.is_none(), "bootstrap busy flag changed presence");
            if agent.availability != Availability::Inactive {
                if let Err(err) = self.persist("presence", || {
                    self.store.persist_presence(agent.id, Availability::Inactive)
                }) {
                    warn!(event = "presence_reset_failed", agent_id = agent.id, error = %err);
                }
            }
        }

        self.refresh_view();
        info!(
            event = "coordinator_bootstrap",
            agents = agents.len(),
            packages = package_count,
            policy = %self.config.policy
        );
        Ok(())
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        lock(&self.view).snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetDiff> {
        lock(&self.view).subscribe()
    }

    pub fn location_snapshot(&self) -> LocationSnapshotPayload {
        LocationSnapshotPayload::from_positions(&lock(&self.positions).positions())
    }

    pub fn packages_for_agent(&self, agent_id: AgentId) -> Vec<Package> {
        lock(&self.packages).packages_for_agent(agent_id)
    }

    pub fn pending_packages(&self) -> Vec<Package> {
        lock(&self.packages).pending()
    }

    pub fn package(&self, package_id: PackageId) -> Option<Package> {
        lock(&self.packages).package(package_id).cloned()
    }

    pub fn availability(&self, agent_id: AgentId) -> Option<Availability> {
        lock(&self.presence).availability(agent_id)
    }

    pub fn is_known_agent(&self, agent_id: AgentId) -> bool {
        lock(&self.presence).contains(agent_id)
    }

    pub fn is_live(&self, agent_id: AgentId, session: SessionId) -> bool {
        lock(&self.presence).is_live(agent_id, session)
    }

    /// Rebuilds the projection from the aggregates and emits a diff when it
    /// changed.
    pub fn refresh_view(&self) -> Option<FleetDiff> {
        let mut view = lock(&self.view);
        let roster = lock(&self.presence).roster();
        let positions = lock(&self.positions).positions();
        let packages = lock(&self.packages).packages().clone();
        let agents = roster
            .into_iter()
            .map(|(agent_id, (name, availability))| {
                let entry = AgentEntry {
                    name,
                    availability,
                    position: positions.get(&agent_id).copied(),
                };
                (agent_id, entry)
            })
            .collect();
        let diff = view.refresh(agents, packages);
        if let Some(diff) = &diff {
            debug!(
                event = "fleet_diff",
                seq = diff.seq,
                agents = diff.agents.len(),
                packages = diff.packages.len()
            );
        }
        diff
    }

    /// Reconciles one pushed sample from `session`. Samples from a session
    /// that is no longer the agent's live one are dropped.
    pub fn handle_location(
        &self,
        session: SessionId,
        payload: &LocationUpdatePayload,
        received_at_ms: i64,
    ) -> Result<Vec<Outbound>, CoordError> {
        let sample = payload.to_sample(received_at_ms)?;
        let outcome = {
            let presence = lock(&self.presence);
            if !presence.is_live(sample.agent_id, session) {
                debug!(event = "location_detached", agent_id = sample.agent_id, session);
                return Ok(Vec::new());
            }
            lock(&self.positions).apply_push(sample, received_at_ms)
        };

        match outcome {
            PushOutcome::Debounced { since_last_ms } => {
                debug!(
                    event = "location_debounced",
                    agent_id = sample.agent_id,
                    since_last_ms
                );
                Ok(Vec::new())
            }
            PushOutcome::Applied(_) => {
                if let Err(err) = self.store.record_position(&sample) {
                    warn!(event = "position_record_failed", agent_id = sample.agent_id, error = %err);
                }
                self.refresh_view();
                Ok(vec![Outbound::admin(WireMsg::LocationUpdate(
                    LocationUpdatePayload::from_sample(&sample),
                ))])
            }
        }
    }

    /// Merges a pull of the agent table. Unknown agents are registered;
    /// returns the number of positions replaced.
    pub fn apply_agent_snapshot(&self, agents: Vec<Agent>, now_ms: i64) -> usize {
        let mut discovered = 0;
        {
            let mut presence = lock(&self.presence);
            for agent in &agents {
                if presence.register(agent.id, &agent.name) {
                    discovered += 1;
                }
            }
        }
        let snapshot: BTreeMap<AgentId, _> =
            agents.iter().map(|agent| (agent.id, agent.position)).collect();
        let changes = lock(&self.positions).apply_snapshot(&snapshot, now_ms);
        self.refresh_view();
        debug!(
            event = "snapshot_merged",
            agents = agents.len(),
            replaced = changes.len(),
            discovered
        );
        changes.len()
    }

    /// One pull cycle. On timeout or store failure the canonical state is
    /// left as it was.
    pub async fn poll_store(&self) -> Result<usize, CoordError> {
        let store = self.store.clone();
        let fetch = tokio::task::spawn_blocking(move || store.fetch_agents());
        let agents = match tokio::time::timeout(self.config.poll_timeout, fetch).await {
            Err(_) => {
                warn!(
                    event = "poll_timeout",
                    timeout_ms = self.config.poll_timeout.as_millis() as u64
                );
                return Err(CoordError::Transient("agent poll timed out".to_string()));
            }
            Ok(Err(err)) => {
                warn!(event = "poll_failed", error = %err);
                return Err(CoordError::Transient(err.to_string()));
            }
            Ok(Ok(Err(err))) => {
                warn!(event = "poll_failed", error = %err);
                return Err(CoordError::Transient(err.to_string()));
            }
            Ok(Ok(Ok(agents))) => agents,
        };
        Ok(self.apply_agent_snapshot(agents, now_ms()))
    }

    pub fn connect(
        &self,
        agent_id: AgentId,
        session: SessionId,
        at_ms: i64,
    ) -> Result<ConnectOutcome, CoordError> {
        let (superseded, intent) = {
            let mut presence = lock(&self.presence);
            let previous = presence.session(agent_id);
            let intent = presence.apply(agent_id, PresenceEvent::Connected { session }, at_ms)?;
            (previous.filter(|old| *old != session), intent)
        };
        let mut outbound = Vec::new();
        self.settle_presence(intent, &mut outbound)?;
        self.refresh_view();
        info!(event = "agent_connected", agent_id, session, superseded = ?superseded);
        Ok(ConnectOutcome {
            superseded,
            outbound,
        })
    }

    /// Session teardown. Idempotent, and a no-op for superseded sessions.
    pub fn disconnect(
        &self,
        agent_id: AgentId,
        session: SessionId,
        at_ms: i64,
    ) -> Result<Vec<Outbound>, CoordError> {
        let intent = lock(&self.presence).apply(
            agent_id,
            PresenceEvent::Disconnected { session },
            at_ms,
        )?;
        let changed = intent.is_some();
        let mut outbound = Vec::new();
        let settled = self.settle_presence(intent, &mut outbound);
        self.refresh_view();
        if changed {
            info!(event = "agent_disconnected", agent_id, session);
        }
        settled.map(|_| outbound)
    }

    pub fn toggle_availability(
        &self,
        agent_id: AgentId,
        available: bool,
        at_ms: i64,
    ) -> Result<Vec<Outbound>, CoordError> {
        let intent =
            lock(&self.presence).apply(agent_id, PresenceEvent::Toggle { available }, at_ms)?;
        let mut outbound = Vec::new();
        let settled = self.settle_presence(intent, &mut outbound);
        self.refresh_view();
        settled.map(|_| outbound)
    }

    pub fn transition(
        &self,
        package_id: PackageId,
        transition: Transition,
    ) -> Result<(PackageNotice, Vec<Outbound>), CoordError> {
        if let Transition::Assign { agent_id } = transition {
            if !self.is_known_agent(agent_id) {
                return Err(CoordError::NotFound(format!("agent {agent_id}")));
            }
        }

        let claim = lock(&self.packages).begin(package_id, transition)?;
        let persisted = match transition {
            Transition::Assign { agent_id } => self.persist("assignment", || {
                self.store.persist_assignment(package_id, agent_id)
            }),
            Transition::Deliver | Transition::Cancel => {
                let state = claim.next.state;
                self.persist("package_state", || {
                    self.store.persist_package_state(package_id, state)
                })
            }
        };
        if let Err(err) = persisted {
            lock(&self.packages).release(claim);
            return Err(err);
        }
        let notice = lock(&self.packages).commit(claim);
        info!(
            event = "package_transition",
            package_id,
            transition = notice.transition.name(),
            from = %notice.previous,
            to = %notice.package.state,
            agent_id = ?notice.package.agent_id
        );

        let mut outbound = Vec::new();
        if let Transition::Assign { agent_id } = transition {
            outbound.push(Outbound::to_package_rooms(
                &notice.package,
                WireMsg::PackageAssigned(PackageAssignedPayload {
                    package_id,
                    agent_id,
                }),
            ));
        }
        outbound.push(Outbound::to_package_rooms(
            &notice.package,
            WireMsg::PackageStatusChanged(PackageStatusPayload {
                package_id,
                state: notice.package.state,
                previous: Some(notice.previous),
                agent_id: notice.package.agent_id,
            }),
        ));
        if let Some(owner) = notice.package.agent_id {
            self.sync_workload(owner, &mut outbound);
        }
        self.refresh_view();
        Ok((notice, outbound))
    }

    pub fn add_package(&self, destination: &str) -> Result<(Package, Vec<Outbound>), CoordError> {
        let destination = destination.trim();
        if destination.is_empty() {
            return Err(CoordError::MalformedInput(
                "destination must not be empty".to_string(),
            ));
        }
        let package = self.persist("create_package", || self.store.create_package(destination))?;
        lock(&self.packages).insert(package.clone());
        info!(event = "package_added", package_id = package.id);
        self.refresh_view();
        let outbound = vec![Outbound::admin(WireMsg::PackageStatusChanged(
            PackageStatusPayload {
                package_id: package.id,
                state: PackageState::Pending,
                previous: None,
                agent_id: None,
            },
        ))];
        Ok((package, outbound))
    }

    /// Runs a console or agent command. State-machine errors come back in the
    /// result; they are never swallowed.
    pub fn execute(&self, command: &Command, at_ms: i64) -> CommandOutcome {
        let outcome = match command {
            Command::Assign {
                package_id,
                agent_id,
            } => self
                .transition(
                    *package_id,
                    Transition::Assign {
                        agent_id: *agent_id,
                    },
                )
                .map(|(notice, outbound)| (Some(notice.package), outbound)),
            Command::Deliver { package_id } => self
                .transition(*package_id, Transition::Deliver)
                .map(|(notice, outbound)| (Some(notice.package), outbound)),
            Command::Cancel { package_id } => self
                .transition(*package_id, Transition::Cancel)
                .map(|(notice, outbound)| (Some(notice.package), outbound)),
            Command::ToggleAvailability {
                agent_id,
                available,
            } => self
                .toggle_availability(*agent_id, *available, at_ms)
                .map(|outbound| (None, outbound)),
            Command::AddPackage { destination } => self
                .add_package(destination)
                .map(|(package, outbound)| (Some(package), outbound)),
        };

        match outcome {
            Ok((package, outbound)) => CommandOutcome {
                result: CommandResultPayload::ok(command, package),
                outbound,
            },
            Err(err) => {
                info!(
                    event = "command_rejected",
                    action = command.action(),
                    code = err.code(),
                    error = %err
                );
                CommandOutcome {
                    result: CommandResultPayload::rejected(command, &err),
                    outbound: Vec::new(),
                }
            }
        }
    }

    fn sync_workload(&self, agent_id: AgentId, outbound: &mut Vec<Outbound>) {
        let busy = lock(&self.packages).has_workload(agent_id);
        let intent = lock(&self.presence).set_busy(agent_id, busy);
        if let Err(err) = self.settle_presence(intent, outbound) {
            warn!(event = "workload_presence_failed", agent_id, error = %err);
        }
    }

    fn settle_presence(
        &self,
        intent: Option<PresenceIntent>,
        outbound: &mut Vec<Outbound>,
    ) -> Result<(), CoordError> {
        let Some(intent) = intent else {
            return Ok(());
        };
        match self.persist("presence", || {
            self.store.persist_presence(intent.agent_id, intent.state)
        }) {
            Ok(()) => {
                info!(
                    event = "presence_changed",
                    agent_id = intent.agent_id,
                    from = %intent.previous,
                    to = %intent.state
                );
                outbound.push(Outbound::admin(WireMsg::PresenceChanged(PresencePayload {
                    agent_id: intent.agent_id,
                    state: intent.state,
                })));
                Ok(())
            }
            Err(err) => {
                if lock(&self.presence).rollback(&intent) {
                    warn!(
                        event = "presence_rolled_back",
                        agent_id = intent.agent_id,
                        restored = %intent.previous
                    );
                }
                Err(err)
            }
        }
    }

    /// Store write with the retry budget. Outages that outlast it, and writes
    /// the store refuses, escalate as `Fatal`.
    fn persist<T>(
        &self,
        op: &'static str,
        mut write: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, CoordError> {
        let attempts = self.config.persist_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match write() {
                Ok(value) => return Ok(value),
                Err(StoreError::NotFound(message)) => return Err(CoordError::NotFound(message)),
                Err(err) if err.is_transient() && attempt < attempts => {
                    warn!(event = "persist_retry", op, attempt, error = %err);
                    std::thread::sleep(self.config.persist_backoff);
                }
                Err(err) => {
                    error!(event = "operator_escalation", op, attempts = attempt, error = %err);
                    return Err(CoordError::Fatal(format!("{op}: {err}")));
                }
            }
        }
    }
}

fn fetch_error(what: &str, err: StoreError) -> CoordError {
    if err.is_transient() {
        CoordError::Transient(format!("fetch {what}: {err}"))
    } else {
        CoordError::Fatal(format!("fetch {what}: {err}"))
    }
}
