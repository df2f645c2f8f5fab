//! Shared vocabulary for the fleet coordination services: domain model,
//! error taxonomy, the data-access seam and the realtime wire protocol.

pub mod error;
pub mod model;
pub mod store;
pub mod wire;

pub use error::{CoordError, StoreError};
pub use model::{
    Agent, AgentChange, AgentEntry, AgentId, Availability, ChangeOp, Coordinates, FleetDiff,
    FleetSnapshot, Package, PackageChange, PackageId, PackageState, PositionSample, Room,
};
pub use store::FleetStore;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
