use std::collections::BTreeMap;

use minecloud_primitives::{Clock, Heartbeat};
use minecloud_store::{get_json, heartbeat_key, put_json, ObjectStore, HEARTBEATS_PREFIX};

use crate::FleetError;

/// Blind-write this worker's liveness file. One writer per key, so no
/// locking discipline applies.
pub fn write_heartbeat(
    store: &impl ObjectStore,
    clock: &dyn Clock,
    worker_id: &str,
    public_endpoint: Option<&str>,
) -> Result<(), FleetError> {
    let beat = Heartbeat {
        last_heartbeat: clock.now(),
        public_endpoint: public_endpoint.map(str::to_string),
    };
    put_json(store, &heartbeat_key(worker_id), &beat)
        .map(|_| ())
        .map_err(FleetError::store)
}

/// Read every worker's last heartbeat. Unparseable files are skipped:
/// a worker that cannot write valid JSON is indistinguishable from a
/// dead one and will be reclaimed on the same schedule.
pub fn read_heartbeats(
    store: &impl ObjectStore,
) -> Result<BTreeMap<String, Heartbeat>, FleetError> {
    let mut beats = BTreeMap::new();
    for key in store.list(HEARTBEATS_PREFIX).map_err(FleetError::store)? {
        let Some(worker_id) = key
            .strip_prefix(HEARTBEATS_PREFIX)
            .and_then(|name| name.strip_suffix(".json"))
        else {
            continue;
        };
        match get_json::<Heartbeat>(store, &key) {
            Ok(Some((beat, _))) => {
                beats.insert(worker_id.to_string(), beat);
            }
            Ok(None) => {}
            Err(_) => {}
        }
    }
    Ok(beats)
}
