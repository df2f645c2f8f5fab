use crate::error::StoreError;
use crate::model::{
    Agent, AgentId, Availability, Package, PackageId, PackageState, PositionSample,
};

/// Data-access collaborator. Implementations own durability; the coordination
/// core only issues these calls and reacts to their outcome.
pub trait FleetStore: Send + Sync {
    fn fetch_agents(&self) -> Result<Vec<Agent>, StoreError>;

    fn fetch_pending_packages(&self) -> Result<Vec<Package>, StoreError>;

    /// Every package regardless of state or owner.
    fn fetch_packages(&self) -> Result<Vec<Package>, StoreError> {
        self.fetch_pending_packages()
    }

    fn persist_presence(&self, agent_id: AgentId, state: Availability) -> Result<(), StoreError>;

    fn persist_assignment(&self, package_id: PackageId, agent_id: AgentId)
        -> Result<(), StoreError>;

    fn persist_package_state(
        &self,
        package_id: PackageId,
        state: PackageState,
    ) -> Result<(), StoreError>;

    fn create_package(&self, destination: &str) -> Result<Package, StoreError>;

    /// Last known position, read back by the pull snapshot. Stores without a
    /// position column may ignore it.
    fn record_position(&self, _sample: &PositionSample) -> Result<(), StoreError> {
        Ok(())
    }
}
