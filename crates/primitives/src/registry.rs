use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A registry record binding one worker to a contiguous address range.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub worker_id: String,
    pub public_endpoint: String,
    pub start_address: usize,
    pub end_address: usize,
    pub addresses: Vec<String>,
    pub assigned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl Assignment {
    /// Most recent sign of life: heartbeat if any, else assignment time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        match self.last_heartbeat {
            Some(beat) => beat.max(self.assigned_at),
            None => self.assigned_at,
        }
    }

    pub fn overlaps(&self, other: &Assignment) -> bool {
        self.start_address <= other.end_address && other.start_address <= self.end_address
    }
}

/// Per-worker liveness file (`heartbeats/{workerId}.json`).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_endpoint: Option<String>,
}

/// The fleet-wide address assignment ledger (`registry.json`).
///
/// `addresses` is immutable once seeded; `next_available` is a cursor
/// into it that only the allocator advances. The reclaimer removes
/// assignments but never lowers the cursor, so freed ranges become
/// holes that are simply skipped.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub addresses: Vec<String>,
    pub next_available: usize,
    pub assignments: BTreeMap<String, Assignment>,
    pub addresses_per_instance: usize,
}

#[derive(Clone, Debug)]
pub struct RegistryValidationError {
    pub message: String,
}

impl std::fmt::Display for RegistryValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for RegistryValidationError {}

fn invalid(message: impl Into<String>) -> RegistryValidationError {
    RegistryValidationError {
        message: message.into(),
    }
}

impl Registry {
    pub fn new(addresses: Vec<String>, addresses_per_instance: usize) -> Self {
        Self {
            addresses,
            next_available: 0,
            assignments: BTreeMap::new(),
            addresses_per_instance,
        }
    }

    /// Number of address slots not yet covered by the cursor.
    pub fn remaining(&self) -> usize {
        self.addresses.len().saturating_sub(self.next_available)
    }

    /// Check the structural invariants: every assignment is a contiguous
    /// in-bounds interval whose address list matches the master list,
    /// intervals are pairwise disjoint, and the cursor covers them all.
    pub fn validate(&self) -> Result<(), RegistryValidationError> {
        if self.addresses_per_instance == 0 {
            return Err(invalid("addressesPerInstance must be positive"));
        }
        if self.next_available > self.addresses.len() {
            return Err(invalid(format!(
                "nextAvailable {} exceeds address count {}",
                self.next_available,
                self.addresses.len()
            )));
        }

        let mut seen: Vec<&Assignment> = Vec::with_capacity(self.assignments.len());
        for (worker_id, assignment) in &self.assignments {
            if assignment.worker_id != *worker_id {
                return Err(invalid(format!(
                    "assignment keyed {worker_id} carries workerId {}",
                    assignment.worker_id
                )));
            }
            if assignment.start_address > assignment.end_address {
                return Err(invalid(format!(
                    "assignment {worker_id} has inverted range {}..{}",
                    assignment.start_address, assignment.end_address
                )));
            }
            if assignment.end_address >= self.addresses.len() {
                return Err(invalid(format!(
                    "assignment {worker_id} ends at {} beyond address count {}",
                    assignment.end_address,
                    self.addresses.len()
                )));
            }
            let width = assignment.end_address - assignment.start_address + 1;
            if assignment.addresses.len() != width {
                return Err(invalid(format!(
                    "assignment {worker_id} lists {} addresses for a range of {width}",
                    assignment.addresses.len()
                )));
            }
            if assignment.addresses
                != self.addresses[assignment.start_address..=assignment.end_address]
            {
                return Err(invalid(format!(
                    "assignment {worker_id} address list diverges from the registry"
                )));
            }
            if self.next_available <= assignment.end_address {
                return Err(invalid(format!(
                    "nextAvailable {} does not cover assignment {worker_id} ending at {}",
                    self.next_available, assignment.end_address
                )));
            }
            for other in &seen {
                if assignment.overlaps(other) {
                    return Err(invalid(format!(
                        "assignments {worker_id} and {} overlap",
                        other.worker_id
                    )));
                }
            }
            seen.push(assignment);
        }
        Ok(())
    }
}
