//! Shared data model for the minecloud fleet.

pub mod challenge;
pub mod clock;
pub mod registry;
pub mod solutions;

pub use challenge::{ChallengeCache, Difficulty, QueuedChallenge};
pub use clock::{Clock, ManualClock, RetryPolicy, SystemClock};
pub use registry::{Assignment, Heartbeat, Registry, RegistryValidationError};
pub use solutions::{
    AddressSolutions, RecentError, RecentSolution, SolutionRecord, SolutionsStats, RECENT_CAP,
};
