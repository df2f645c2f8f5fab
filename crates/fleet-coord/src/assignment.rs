//! Package lifecycle. Transitions run in two phases so the store write can
//! happen outside the package lock: `begin` claims the package, the caller
//! persists, then `commit` or `release` settles the claim.

use fleet_core::model::{AgentId, Package, PackageId, PackageState};
use fleet_core::CoordError;
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Assign { agent_id: AgentId },
    Deliver,
    Cancel,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Assign { .. } => "assign",
            Transition::Deliver => "deliver",
            Transition::Cancel => "cancel",
        }
    }
}

/// Target package for `transition`, or `InvalidTransition` for every edge
/// outside the lifecycle.
pub fn next_package(package: &Package, transition: Transition) -> Result<Package, CoordError> {
    let next_state = match (package.state, transition) {
        (PackageState::Pending, Transition::Assign { agent_id }) => {
            return Ok(Package {
                state: PackageState::InTransit,
                agent_id: Some(agent_id),
                ..package.clone()
            });
        }
        (PackageState::InTransit, Transition::Deliver) => PackageState::Delivered,
        (PackageState::InTransit, Transition::Cancel) | (PackageState::Pending, Transition::Cancel) => {
            PackageState::Cancelled
        }
        (state, transition) => {
            return Err(CoordError::InvalidTransition(format!(
                "cannot {} package {} while {}",
                transition.name(),
                package.id,
                state
            )));
        }
    };
    Ok(Package {
        state: next_state,
        ..package.clone()
    })
}

/// An in-flight transition. Holding one keeps every other transition on the
/// same package out until it is committed or released.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a claim must be committed or released"]
pub struct PackageClaim {
    pub transition: Transition,
    pub previous: Package,
    pub next: Package,
}

impl PackageClaim {
    pub fn package_id(&self) -> PackageId {
        self.next.id
    }
}

/// Settled transition, the input for room notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageNotice {
    pub package: Package,
    pub previous: PackageState,
    pub transition: Transition,
}

#[derive(Debug, Clone, Default)]
pub struct AssignmentCoordinator {
    packages: BTreeMap<PackageId, Package>,
    claims: HashSet<PackageId>,
}

impl AssignmentCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the package map wholesale. Claimed packages keep their
    /// in-memory value.
    pub fn load(&mut self, packages: impl IntoIterator<Item = Package>) {
        for package in packages {
            if self.claims.contains(&package.id) {
                continue;
            }
            self.packages.insert(package.id, package);
        }
    }

    pub fn insert(&mut self, package: Package) -> bool {
        if self.packages.contains_key(&package.id) {
            return false;
        }
        self.packages.insert(package.id, package);
        true
    }

    pub fn begin(
        &mut self,
        package_id: PackageId,
        transition: Transition,
    ) -> Result<PackageClaim, CoordError> {
        let package = self
            .packages
            .get(&package_id)
            .ok_or_else(|| CoordError::NotFound(format!("package {package_id}")))?;
        if self.claims.contains(&package_id) {
            return Err(CoordError::Conflict(format!(
                "package {package_id} has a transition in flight"
            )));
        }
        let next = next_package(package, transition)?;
        let claim = PackageClaim {
            transition,
            previous: package.clone(),
            next,
        };
        self.claims.insert(package_id);
        Ok(claim)
    }

    pub fn commit(&mut self, claim: PackageClaim) -> PackageNotice {
        self.claims.remove(&claim.package_id());
        let previous = claim.previous.state;
        self.packages.insert(claim.package_id(), claim.next.clone());
        PackageNotice {
            package: claim.next,
            previous,
            transition: claim.transition,
        }
    }

    pub fn release(&mut self, claim: PackageClaim) {
        self.claims.remove(&claim.package_id());
    }

    pub fn is_claimed(&self, package_id: PackageId) -> bool {
        self.claims.contains(&package_id)
    }

    pub fn package(&self, package_id: PackageId) -> Option<&Package> {
        self.packages.get(&package_id)
    }

    pub fn packages(&self) -> &BTreeMap<PackageId, Package> {
        &self.packages
    }

    pub fn pending(&self) -> Vec<Package> {
        self.packages
            .values()
            .filter(|package| package.state == PackageState::Pending)
            .cloned()
            .collect()
    }

    pub fn packages_for_agent(&self, agent_id: AgentId) -> Vec<Package> {
        self.packages
            .values()
            .filter(|package| package.visible_to(agent_id))
            .cloned()
            .collect()
    }

    /// Whether the agent currently carries anything.
    pub fn has_workload(&self, agent_id: AgentId) -> bool {
        self.packages
            .values()
            .any(|package| package.state == PackageState::InTransit && package.visible_to(agent_id))
    }
}
