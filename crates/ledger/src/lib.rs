//! Shared ledgers: the challenge cache, per-address solution files and
//! the fleet-wide stats document.

pub mod challenges;
pub mod solutions;
pub mod stats;

pub use challenges::ChallengeLedger;
pub use solutions::SolutionsLedger;
pub use stats::StatsLedger;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LedgerErrorKind {
    /// Conditional writes kept losing; retry budget exhausted.
    Contention,
    Store,
}

#[derive(Clone, Debug)]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

impl LedgerError {
    pub fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn store(err: minecloud_store::StoreError) -> Self {
        Self::new(LedgerErrorKind::Store, err.to_string())
    }
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LedgerError {}
