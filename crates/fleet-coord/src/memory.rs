//! In-process `FleetStore`. Backs demos and tests; failures, latency and a
//! one-shot persist gate can be injected to exercise the retry and race paths.

use fleet_core::model::{
    Agent, AgentId, Availability, Coordinates, Package, PackageId, PackageState, PositionSample,
};
use fleet_core::{FleetStore, StoreError};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{mpsc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Default)]
struct MemoryInner {
    agents: BTreeMap<AgentId, Agent>,
    packages: BTreeMap<PackageId, Package>,
    next_package_id: PackageId,
    write_failures: VecDeque<StoreError>,
    fetch_failures: VecDeque<StoreError>,
    fetch_delay: Option<Duration>,
    gate: Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>,
    writes: Vec<String>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

/// Test handle for a gated write: the store signals `entered` and then
/// blocks until `release` is called.
pub struct PersistGate {
    entered: mpsc::Receiver<()>,
    release: mpsc::Sender<()>,
}

impl PersistGate {
    pub fn wait_entered(&self, timeout: Duration) -> bool {
        self.entered.recv_timeout(timeout).is_ok()
    }

    pub fn release(&self) {
        let _ = self.release.send(());
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agents(agents: impl IntoIterator<Item = (AgentId, &'static str)>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for (id, name) in agents {
                inner.agents.insert(
                    id,
                    Agent {
                        id,
                        name: name.to_string(),
                        availability: Availability::Inactive,
                        position: None,
                    },
                );
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_package(&self, package: Package) {
        let mut inner = self.lock();
        inner.next_package_id = inner.next_package_id.max(package.id);
        inner.packages.insert(package.id, package);
    }

    /// What the next pull snapshot will report for the agent.
    pub fn set_position(&self, agent_id: AgentId, position: Option<Coordinates>) {
        if let Some(agent) = self.lock().agents.get_mut(&agent_id) {
            agent.position = position;
        }
    }

    pub fn agent(&self, agent_id: AgentId) -> Option<Agent> {
        self.lock().agents.get(&agent_id).cloned()
    }

    pub fn package(&self, package_id: PackageId) -> Option<Package> {
        self.lock().packages.get(&package_id).cloned()
    }

    pub fn fail_next_writes(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.lock().write_failures.extend(errors);
    }

    pub fn fail_next_fetch(&self, error: StoreError) {
        self.lock().fetch_failures.push_back(error);
    }

    pub fn set_fetch_delay(&self, delay: Option<Duration>) {
        self.lock().fetch_delay = delay;
    }

    /// Blocks the next write until the returned gate is released.
    pub fn gate_next_write(&self) -> PersistGate {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        self.lock().gate = Some((entered_tx, release_rx));
        PersistGate {
            entered: entered_rx,
            release: release_tx,
        }
    }

    /// Every successful write, as `"<op> <id> <value>"`.
    pub fn writes(&self) -> Vec<String> {
        self.lock().writes.clone()
    }

    fn before_fetch(&self) -> Result<(), StoreError> {
        let (delay, failure) = {
            let mut inner = self.lock();
            (inner.fetch_delay, inner.fetch_failures.pop_front())
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        failure.map_or(Ok(()), Err)
    }

    fn before_write(&self) -> Result<(), StoreError> {
        let gate = self.lock().gate.take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.recv();
        }
        match self.lock().write_failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl FleetStore for MemoryStore {
    fn fetch_agents(&self) -> Result<Vec<Agent>, StoreError> {
        self.before_fetch()?;
        Ok(self.lock().agents.values().cloned().collect())
    }

    fn fetch_pending_packages(&self) -> Result<Vec<Package>, StoreError> {
        self.before_fetch()?;
        Ok(self
            .lock()
            .packages
            .values()
            .filter(|package| package.state == PackageState::Pending)
            .cloned()
            .collect())
    }

    fn fetch_packages(&self) -> Result<Vec<Package>, StoreError> {
        self.before_fetch()?;
        Ok(self.lock().packages.values().cloned().collect())
    }

    fn persist_presence(&self, agent_id: AgentId, state: Availability) -> Result<(), StoreError> {
        self.before_write()?;
        let mut inner = self.lock();
        let agent = inner
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| StoreError::NotFound(format!("agent {agent_id}")))?;
        agent.availability = state;
        inner.writes.push(format!("presence {agent_id} {state}"));
        Ok(())
    }

    fn persist_assignment(
        &self,
        package_id: PackageId,
        agent_id: AgentId,
    ) -> Result<(), StoreError> {
        self.before_write()?;
        let mut inner = self.lock();
        let package = inner
            .packages
            .get_mut(&package_id)
            .ok_or_else(|| StoreError::NotFound(format!("package {package_id}")))?;
        if package.state != PackageState::Pending {
            return Err(StoreError::Rejected(format!(
                "package {package_id} is {}",
                package.state
            )));
        }
        package.state = PackageState::InTransit;
        package.agent_id = Some(agent_id);
        inner.writes.push(format!("assign {package_id} {agent_id}"));
        Ok(())
    }

    fn persist_package_state(
        &self,
        package_id: PackageId,
        state: PackageState,
    ) -> Result<(), StoreError> {
        self.before_write()?;
        let mut inner = self.lock();
        let package = inner
            .packages
            .get_mut(&package_id)
            .ok_or_else(|| StoreError::NotFound(format!("package {package_id}")))?;
        package.state = state;
        inner.writes.push(format!("state {package_id} {state}"));
        Ok(())
    }

    fn create_package(&self, destination: &str) -> Result<Package, StoreError> {
        self.before_write()?;
        let mut inner = self.lock();
        inner.next_package_id += 1;
        let package = Package::pending(inner.next_package_id, destination);
        inner.packages.insert(package.id, package.clone());
        inner.writes.push(format!("create {} {destination}", package.id));
        Ok(package)
    }

    fn record_position(&self, sample: &PositionSample) -> Result<(), StoreError> {
        if let Some(agent) = self.lock().agents.get_mut(&sample.agent_id) {
            agent.position = Some(sample.position);
        }
        Ok(())
    }
}
