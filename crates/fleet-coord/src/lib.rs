//! Coordination core: location reconciliation, presence, the package
//! lifecycle and the read-side fleet view, wired together by
//! [`FleetCoordinator`].

pub mod assignment;
pub mod engine;
pub mod memory;
pub mod presence;
pub mod reconciler;
pub mod view;

pub use assignment::{AssignmentCoordinator, PackageClaim, PackageNotice, Transition};
pub use engine::{CommandOutcome, ConnectOutcome, CoordinatorConfig, FleetCoordinator, Outbound};
pub use memory::MemoryStore;
pub use presence::{PresenceEvent, PresenceTracker, SessionId};
pub use reconciler::{LocationReconciler, PositionPolicy, PositionSource};
pub use view::{apply_diff, FleetView};
