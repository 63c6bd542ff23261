use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use minecloud_fleet::RegistryStore;
use minecloud_ledger::StatsLedger;
use minecloud_mineapi::{ComputeProvider, MineApi, Signer};
use minecloud_primitives::RetryPolicy;
use minecloud_store::{put_json, ObjectStore, MINER_CODE_KEY};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sidecar metadata for the miner-code blob.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct MinerCodeMeta {
    checksum: String,
    uploaded_at: DateTime<Utc>,
}

fn miner_code_meta_key() -> String {
    format!("{MINER_CODE_KEY}.meta.json")
}

/// Read one address per line, skipping blanks and `#` comments.
pub fn load_address_file(path: &Path) -> Result<Vec<String>, String> {
    let content =
        fs::read_to_string(path).map_err(|err| format!("{}: {err}", path.display()))?;
    let addresses: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();
    if addresses.is_empty() {
        return Err(format!("no addresses found in {}", path.display()));
    }
    Ok(addresses)
}

/// Create or refresh `registry.json` from an address file.
pub async fn seed_registry<S: ObjectStore>(
    store: S,
    path: &Path,
    addresses_per_instance: usize,
) -> Result<(), String> {
    let addresses = load_address_file(path)?;
    let count = addresses.len();
    let registry = RegistryStore::new(store)
        .seed(addresses, addresses_per_instance, RetryPolicy::allocator())
        .await
        .map_err(|err| err.to_string())?;
    println!(
        "seeded registry: {count} address(es), {addresses_per_instance} per worker, \
         {} assignment(s) preserved, cursor at {}",
        registry.assignments.len(),
        registry.next_available
    );
    Ok(())
}

/// Ship the miner payload into the bucket with its checksum.
pub fn upload_miner_code<S: ObjectStore>(
    store: S,
    path: &Path,
    now: DateTime<Utc>,
) -> Result<(), String> {
    let bytes = fs::read(path).map_err(|err| format!("{}: {err}", path.display()))?;
    let checksum = hex::encode(Sha256::digest(&bytes));
    store
        .put(MINER_CODE_KEY, &bytes)
        .map_err(|err| err.to_string())?;
    put_json(
        &store,
        &miner_code_meta_key(),
        &MinerCodeMeta {
            checksum: checksum.clone(),
            uploaded_at: now,
        },
    )
    .map_err(|err| err.to_string())?;
    println!(
        "uploaded {} ({} bytes, sha256 {checksum})",
        MINER_CODE_KEY,
        bytes.len()
    );
    Ok(())
}

/// Print the fleet stats document.
pub fn show_stats<S: ObjectStore>(store: S) -> Result<(), String> {
    let stats = StatsLedger::new(store).load().map_err(|err| err.to_string())?;
    println!(
        "solutions {} (donation {}) errors {} last updated {}",
        stats.total_solutions,
        stats.donation_solutions,
        stats.total_errors,
        stats
            .last_updated
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    for entry in &stats.recent_solutions {
        println!(
            "  solved {} on {} at {} by {}",
            entry.address,
            entry.challenge_id,
            entry.submitted_at.to_rfc3339(),
            entry.worker_id.as_deref().unwrap_or("?")
        );
    }
    for entry in &stats.recent_errors {
        println!(
            "  error {} on {}: {}",
            entry.address, entry.challenge_id, entry.message
        );
    }
    Ok(())
}

/// Accept the terms and register an address: fetch the T&C message,
/// sign it verbatim with the external signer, post the registration.
pub async fn register_address<M: MineApi, G: Signer>(
    api: &M,
    signer: &G,
    address: &str,
    terms_version: &str,
) -> Result<(), String> {
    let terms = api
        .fetch_terms(terms_version)
        .await
        .map_err(|err| format!("terms fetch failed: {err}"))?;
    let signed = signer
        .sign(address, &terms.message)
        .await
        .map_err(|err| format!("signing failed: {err}"))?;
    api.register(address, &signed.signature, &signed.pubkey)
        .await
        .map_err(|err| format!("registration failed: {err}"))?;
    println!("registered {address} under terms {}", terms.version);
    Ok(())
}

/// Set the desired fleet size through the compute provider.
pub async fn scale_fleet<C: ComputeProvider>(compute: &C, count: usize) -> Result<(), String> {
    compute
        .set_desired_count(count)
        .await
        .map_err(|err| err.to_string())?;
    println!("desired worker count set to {count}");
    Ok(())
}
