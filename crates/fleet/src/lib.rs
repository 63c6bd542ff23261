//! Fleet-wide address coordination: the durable registry, the per-worker
//! allocator, heartbeats and the leader-elected reclaimer.

pub mod allocator;
pub mod heartbeat;
pub mod reclaimer;
pub mod registry;

pub use allocator::{Allocator, ReservedAddresses};
pub use heartbeat::{read_heartbeats, write_heartbeat};
pub use reclaimer::{elect_leader, ReclaimOutcome, Reclaimer};
pub use registry::RegistryStore;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FleetErrorKind {
    /// Conditional writes kept losing; retry budget exhausted.
    Contention,
    /// Not enough unassigned addresses left for a full slice.
    Exhausted,
    /// `registry.json` does not exist yet; the controller may still be
    /// seeding.
    NotSeeded,
    /// The registry fails its structural invariants.
    Config,
    Store,
}

#[derive(Clone, Debug)]
pub struct FleetError {
    pub kind: FleetErrorKind,
    pub message: String,
}

impl FleetError {
    pub fn new(kind: FleetErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn store(err: minecloud_store::StoreError) -> Self {
        Self::new(FleetErrorKind::Store, err.to_string())
    }
}

impl std::fmt::Display for FleetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FleetError {}
