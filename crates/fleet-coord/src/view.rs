use fleet_core::model::{
    AgentChange, AgentEntry, AgentId, ChangeOp, FleetDiff, FleetSnapshot, Package, PackageChange,
    PackageId,
};
use std::collections::BTreeMap;
use tokio::sync::broadcast;

pub const DEFAULT_DIFF_CAPACITY: usize = 256;

/// Read-side cache of the fleet. Holds the last emitted snapshot and fans out
/// the diff of every refresh that changed something.
#[derive(Debug)]
pub struct FleetView {
    current: FleetSnapshot,
    diffs: broadcast::Sender<FleetDiff>,
}

impl Default for FleetView {
    fn default() -> Self {
        Self::new(DEFAULT_DIFF_CAPACITY)
    }
}

impl FleetView {
    pub fn new(capacity: usize) -> Self {
        let (diffs, _) = broadcast::channel(capacity.max(1));
        Self {
            current: FleetSnapshot::default(),
            diffs,
        }
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.current.clone()
    }

    pub fn seq(&self) -> u64 {
        self.current.seq
    }

    /// A lagging receiver sees `RecvError::Lagged`, the cue to re-request a
    /// full snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<FleetDiff> {
        self.diffs.subscribe()
    }

    /// Replaces the cached projection. Returns the emitted diff, or `None`
    /// when nothing changed.
    pub fn refresh(
        &mut self,
        agents: BTreeMap<AgentId, AgentEntry>,
        packages: BTreeMap<PackageId, Package>,
    ) -> Option<FleetDiff> {
        let seq = self.current.seq + 1;
        let next = FleetSnapshot {
            seq,
            agents,
            packages,
        };
        let diff = diff_snapshots(&self.current, &next);
        if diff.is_empty() {
            return None;
        }
        self.current = next;
        let _ = self.diffs.send(diff.clone());
        Some(diff)
    }
}

/// Changes that turn `previous` into `next`, stamped with `next.seq`.
pub fn diff_snapshots(previous: &FleetSnapshot, next: &FleetSnapshot) -> FleetDiff {
    let mut agents = Vec::new();
    for (agent_id, entry) in &next.agents {
        let op = match previous.agents.get(agent_id) {
            None => ChangeOp::Added,
            Some(old) if old != entry => ChangeOp::Updated,
            Some(_) => continue,
        };
        agents.push(AgentChange {
            op,
            agent_id: *agent_id,
            entry: Some(entry.clone()),
        });
    }
    for agent_id in previous.agents.keys() {
        if !next.agents.contains_key(agent_id) {
            agents.push(AgentChange {
                op: ChangeOp::Removed,
                agent_id: *agent_id,
                entry: None,
            });
        }
    }

    let mut packages = Vec::new();
    for (package_id, package) in &next.packages {
        let op = match previous.packages.get(package_id) {
            None => ChangeOp::Added,
            Some(old) if old != package => ChangeOp::Updated,
            Some(_) => continue,
        };
        packages.push(PackageChange {
            op,
            package: package.clone(),
        });
    }

    FleetDiff {
        seq: next.seq,
        agents,
        packages,
    }
}

/// Applies a diff to a client-side copy. Returns false on a seq gap, in which
/// case the copy is left untouched and the caller should fetch a snapshot.
pub fn apply_diff(snapshot: &mut FleetSnapshot, diff: &FleetDiff) -> bool {
    if diff.seq != snapshot.seq + 1 {
        return false;
    }
    for change in &diff.agents {
        match (&change.op, &change.entry) {
            (ChangeOp::Removed, _) | (_, None) => {
                snapshot.agents.remove(&change.agent_id);
            }
            (_, Some(entry)) => {
                snapshot.agents.insert(change.agent_id, entry.clone());
            }
        }
    }
    for change in &diff.packages {
        if change.op == ChangeOp::Removed {
            snapshot.packages.remove(&change.package.id);
        } else {
            snapshot
                .packages
                .insert(change.package.id, change.package.clone());
        }
    }
    snapshot.seq = diff.seq;
    true
}
