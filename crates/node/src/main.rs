mod controller;
mod miner;
mod orchestrator;
mod pool;
mod queue;
mod status;
mod submit;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use minecloud_fleet::{Allocator, FleetErrorKind};
use minecloud_ledger::StatsLedger;
use minecloud_mineapi::{
    CommandSigner, HttpDonationSource, HttpMineApi, ImdsMetadataProvider, MetadataProvider,
    StaticComputeProvider, StaticMetadata, WorkerIdentity,
};
use minecloud_primitives::{Clock, SystemClock};
use minecloud_store::dir::DirObjectStore;
use minecloud_store::memory::MemoryObjectStore;
use minecloud_store::{
    bucket_name, CasOutcome, ETag, Object, ObjectMeta, ObjectStore, Precondition, StoreError,
};
use tokio::sync::watch;

use crate::miner::SubprocessMiner;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::status::SessionCounters;

const DEFAULT_STORE_ROOT: &str = "data/store";
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_BUCKET_PREFIX: &str = "minecloud";
const DEFAULT_ACCOUNT: &str = "local";
const DEFAULT_REGION: &str = "local";
const DEFAULT_API_URL: &str = "https://mine.defensio.io/api";
const DEFAULT_MINER_BINARY: &str = "night-cloud";
const DEFAULT_MINER_MAX_ATTEMPTS: u64 = 10_000_000;
const DEFAULT_ADDRESSES_PER_WORKER: usize = 25;
const DEFAULT_WORK_CHECK_SECS: u64 = 5;
const DEFAULT_CHALLENGE_FETCH_SECS: i64 = 300;
const DEFAULT_EXPIRY_SCAN_SECS: u64 = 10;
const DEFAULT_HEARTBEAT_SECS: u64 = 60;
const DEFAULT_RECLAIM_SECS: u64 = 20 * 60;
const DEFAULT_STATUS_SECS: u64 = 60;
const DEFAULT_TERMS_VERSION: &str = "1";
const ADDRESS_CACHE_FILE: &str = "addresses.json";

#[derive(Clone, Copy, Debug)]
enum Backend {
    Memory,
    Dir,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "dir" => Some(Self::Dir),
            _ => None,
        }
    }
}

pub(crate) enum Store {
    Memory(MemoryObjectStore),
    Dir(DirObjectStore),
}

impl ObjectStore for Store {
    fn get(&self, key: &str) -> Result<Option<Object>, StoreError> {
        match self {
            Store::Memory(store) => store.get(key),
            Store::Dir(store) => store.get(key),
        }
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<ETag, StoreError> {
        match self {
            Store::Memory(store) => store.put(key, bytes),
            Store::Dir(store) => store.put(key, bytes),
        }
    }

    fn put_conditional(
        &self,
        key: &str,
        bytes: &[u8],
        precondition: Precondition,
    ) -> Result<CasOutcome, StoreError> {
        match self {
            Store::Memory(store) => store.put_conditional(key, bytes, precondition),
            Store::Dir(store) => store.put_conditional(key, bytes, precondition),
        }
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        match self {
            Store::Memory(store) => store.head(key),
            Store::Dir(store) => store.head(key),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        match self {
            Store::Memory(store) => store.list(prefix),
            Store::Dir(store) => store.list(prefix),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(key),
            Store::Dir(store) => store.delete(key),
        }
    }
}

#[derive(Clone, Debug)]
enum Mode {
    Worker,
    /// Reserve a slice and print it to stdout for a wrapper script.
    ReserveOnly,
    Seed(PathBuf),
    UploadMiner(PathBuf),
    ShowStats,
    Register(String),
    Scale(usize),
}

struct Config {
    mode: Mode,
    backend: Backend,
    store_root: PathBuf,
    data_dir: PathBuf,
    bucket_prefix: String,
    account: String,
    region: Option<String>,
    worker_id: Option<String>,
    public_endpoint: Option<String>,
    use_imds: bool,
    api_url: String,
    donation_url: Option<String>,
    miner_binary: PathBuf,
    miner_max_attempts: u64,
    signer_binary: Option<PathBuf>,
    peers: Vec<String>,
    workers: usize,
    addresses_per_worker: usize,
    work_check_secs: u64,
    challenge_fetch_secs: i64,
    expiry_scan_secs: u64,
    heartbeat_secs: u64,
    reclaim_secs: u64,
    status_secs: u64,
    allocator_stale_secs: i64,
    reclaim_stale_secs: i64,
    terms_version: String,
    release_on_exit: bool,
}

fn usage() -> String {
    format!(
        "usage: minecloudd [options]

modes (default: run as a mining worker)
  --reserve-only             reserve this worker's address slice, print it, exit
  --seed <file>              seed the registry from an address file (one per line)
  --upload-miner <file>      upload the miner payload with its checksum
  --show-stats               print the fleet stats document
  --register <address>       fetch the T&C, sign, and register an address
  --scale <n>                set the desired worker count

store
  --backend <memory|dir>     object store backend (default dir)
  --store-root <path>        base directory for the dir backend (default {DEFAULT_STORE_ROOT})
  --bucket-prefix <name>     bucket name prefix (default {DEFAULT_BUCKET_PREFIX})
  --account <id>             account used in the bucket name (default {DEFAULT_ACCOUNT})

identity
  --worker-id <id>           this worker's id (required unless --imds)
  --region <region>          region / bucket suffix (default {DEFAULT_REGION})
  --public-endpoint <url>    endpoint recorded in the registry
  --imds                     resolve identity from the instance metadata service
  --peer <id>                add a peer worker id for leader election (repeatable)

mining
  --api-url <url>            Mine API base URL (default {DEFAULT_API_URL})
  --donation-url <url>       donation address endpoint (disables donations if omitted)
  --miner <path>             miner binary (default {DEFAULT_MINER_BINARY})
  --miner-max-attempts <n>   per-pass attempt budget (default {DEFAULT_MINER_MAX_ATTEMPTS})
  --workers <n>              concurrent miner subprocesses (default: CPU count)
  --signer <path>            external signing tool (for --register)
  --addresses-per-worker <n> slice width used by --seed (default {DEFAULT_ADDRESSES_PER_WORKER})
  --terms-version <v>        T&C version for --register (default {DEFAULT_TERMS_VERSION})
  --release-on-exit          drop this worker's assignment on clean shutdown

timing (seconds)
  --work-check-interval <n>      queue rebuild cadence (default {DEFAULT_WORK_CHECK_SECS})
  --challenge-fetch-interval <n> Mine API poll cadence (default {DEFAULT_CHALLENGE_FETCH_SECS})
  --expiry-scan-interval <n>     in-flight expiry scan cadence (default {DEFAULT_EXPIRY_SCAN_SECS})
  --heartbeat-interval <n>       heartbeat cadence (default {DEFAULT_HEARTBEAT_SECS})
  --reclaim-interval <n>         reclaimer cadence (default {DEFAULT_RECLAIM_SECS})
  --status-interval <n>          status line cadence, 0 disables (default {DEFAULT_STATUS_SECS})
  --allocator-stale <n>          boot-path reclaim threshold (default 90)
  --reclaim-stale <n>            periodic reclaim threshold (default 1800)
  --data-dir <path>              local state directory (default {DEFAULT_DATA_DIR})"
    )
}

fn parse_args() -> Result<Config, String> {
    let mut mode = Mode::Worker;
    let mut backend = Backend::Dir;
    let mut store_root = PathBuf::from(DEFAULT_STORE_ROOT);
    let mut data_dir = PathBuf::from(DEFAULT_DATA_DIR);
    let mut bucket_prefix = DEFAULT_BUCKET_PREFIX.to_string();
    let mut account = DEFAULT_ACCOUNT.to_string();
    let mut region: Option<String> = None;
    let mut worker_id: Option<String> = None;
    let mut public_endpoint: Option<String> = None;
    let mut use_imds = false;
    let mut api_url = DEFAULT_API_URL.to_string();
    let mut donation_url: Option<String> = None;
    let mut miner_binary = PathBuf::from(DEFAULT_MINER_BINARY);
    let mut miner_max_attempts = DEFAULT_MINER_MAX_ATTEMPTS;
    let mut signer_binary: Option<PathBuf> = None;
    let mut peers: Vec<String> = Vec::new();
    let mut workers = num_cpus::get();
    let mut addresses_per_worker = DEFAULT_ADDRESSES_PER_WORKER;
    let mut work_check_secs = DEFAULT_WORK_CHECK_SECS;
    let mut challenge_fetch_secs = DEFAULT_CHALLENGE_FETCH_SECS;
    let mut expiry_scan_secs = DEFAULT_EXPIRY_SCAN_SECS;
    let mut heartbeat_secs = DEFAULT_HEARTBEAT_SECS;
    let mut reclaim_secs = DEFAULT_RECLAIM_SECS;
    let mut status_secs = DEFAULT_STATUS_SECS;
    let mut allocator_stale_secs = 90i64;
    let mut reclaim_stale_secs = 30 * 60i64;
    let mut terms_version = DEFAULT_TERMS_VERSION.to_string();
    let mut release_on_exit = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Err(usage()),
            "--reserve-only" => mode = Mode::ReserveOnly,
            "--seed" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --seed\n{}", usage()))?;
                mode = Mode::Seed(PathBuf::from(value));
            }
            "--upload-miner" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --upload-miner\n{}", usage()))?;
                mode = Mode::UploadMiner(PathBuf::from(value));
            }
            "--show-stats" => mode = Mode::ShowStats,
            "--register" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --register\n{}", usage()))?;
                mode = Mode::Register(value);
            }
            "--scale" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --scale\n{}", usage()))?;
                let count = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid worker count '{value}'\n{}", usage()))?;
                mode = Mode::Scale(count);
            }
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --backend\n{}", usage()))?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--store-root" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --store-root\n{}", usage()))?;
                store_root = PathBuf::from(value);
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = PathBuf::from(value);
            }
            "--bucket-prefix" => {
                bucket_prefix = args
                    .next()
                    .ok_or_else(|| format!("missing value for --bucket-prefix\n{}", usage()))?;
            }
            "--account" => {
                account = args
                    .next()
                    .ok_or_else(|| format!("missing value for --account\n{}", usage()))?;
            }
            "--region" => {
                region = Some(
                    args.next()
                        .ok_or_else(|| format!("missing value for --region\n{}", usage()))?,
                );
            }
            "--worker-id" => {
                worker_id = Some(
                    args.next()
                        .ok_or_else(|| format!("missing value for --worker-id\n{}", usage()))?,
                );
            }
            "--public-endpoint" => {
                public_endpoint = Some(
                    args.next().ok_or_else(|| {
                        format!("missing value for --public-endpoint\n{}", usage())
                    })?,
                );
            }
            "--imds" => use_imds = true,
            "--api-url" => {
                api_url = args
                    .next()
                    .ok_or_else(|| format!("missing value for --api-url\n{}", usage()))?;
            }
            "--donation-url" => {
                donation_url = Some(
                    args.next()
                        .ok_or_else(|| format!("missing value for --donation-url\n{}", usage()))?,
                );
            }
            "--miner" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --miner\n{}", usage()))?;
                miner_binary = PathBuf::from(value);
            }
            "--miner-max-attempts" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --miner-max-attempts\n{}", usage())
                })?;
                miner_max_attempts = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid attempt budget '{value}'\n{}", usage()))?;
            }
            "--signer" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --signer\n{}", usage()))?;
                signer_binary = Some(PathBuf::from(value));
            }
            "--peer" => {
                peers.push(
                    args.next()
                        .ok_or_else(|| format!("missing value for --peer\n{}", usage()))?,
                );
            }
            "--workers" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --workers\n{}", usage()))?;
                workers = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid worker count '{value}'\n{}", usage()))?;
                if workers == 0 {
                    return Err(format!("workers must be > 0\n{}", usage()));
                }
            }
            "--addresses-per-worker" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --addresses-per-worker\n{}", usage())
                })?;
                addresses_per_worker = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid slice width '{value}'\n{}", usage()))?;
                if addresses_per_worker == 0 {
                    return Err(format!("slice width must be > 0\n{}", usage()));
                }
            }
            "--work-check-interval" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --work-check-interval\n{}", usage())
                })?;
                work_check_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid interval '{value}'\n{}", usage()))?;
            }
            "--challenge-fetch-interval" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --challenge-fetch-interval\n{}", usage())
                })?;
                challenge_fetch_secs = value
                    .parse::<i64>()
                    .map_err(|_| format!("invalid interval '{value}'\n{}", usage()))?;
            }
            "--expiry-scan-interval" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --expiry-scan-interval\n{}", usage())
                })?;
                expiry_scan_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid interval '{value}'\n{}", usage()))?;
            }
            "--heartbeat-interval" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --heartbeat-interval\n{}", usage())
                })?;
                heartbeat_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid interval '{value}'\n{}", usage()))?;
            }
            "--reclaim-interval" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --reclaim-interval\n{}", usage())
                })?;
                reclaim_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid interval '{value}'\n{}", usage()))?;
            }
            "--status-interval" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --status-interval\n{}", usage()))?;
                status_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid interval '{value}'\n{}", usage()))?;
            }
            "--allocator-stale" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --allocator-stale\n{}", usage()))?;
                allocator_stale_secs = value
                    .parse::<i64>()
                    .map_err(|_| format!("invalid threshold '{value}'\n{}", usage()))?;
            }
            "--reclaim-stale" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --reclaim-stale\n{}", usage()))?;
                reclaim_stale_secs = value
                    .parse::<i64>()
                    .map_err(|_| format!("invalid threshold '{value}'\n{}", usage()))?;
            }
            "--terms-version" => {
                terms_version = args
                    .next()
                    .ok_or_else(|| format!("missing value for --terms-version\n{}", usage()))?;
            }
            "--release-on-exit" => release_on_exit = true,
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    Ok(Config {
        mode,
        backend,
        store_root,
        data_dir,
        bucket_prefix,
        account,
        region,
        worker_id,
        public_endpoint,
        use_imds,
        api_url,
        donation_url,
        miner_binary,
        miner_max_attempts,
        signer_binary,
        peers,
        workers,
        addresses_per_worker,
        work_check_secs,
        challenge_fetch_secs,
        expiry_scan_secs,
        heartbeat_secs,
        reclaim_secs,
        status_secs,
        allocator_stale_secs,
        reclaim_stale_secs,
        terms_version,
        release_on_exit,
    })
}

async fn resolve_identity(config: &Config) -> Result<WorkerIdentity, String> {
    if config.use_imds {
        let provider = ImdsMetadataProvider::default_endpoint().map_err(|err| err.to_string())?;
        return provider.identity().await.map_err(|err| err.to_string());
    }
    let worker_id = config
        .worker_id
        .clone()
        .ok_or_else(|| format!("--worker-id is required without --imds\n{}", usage()))?;
    let provider = StaticMetadata::new(
        &worker_id,
        config.region.as_deref().unwrap_or(DEFAULT_REGION),
        config.public_endpoint.as_deref().unwrap_or_default(),
    );
    provider.identity().await.map_err(|err| err.to_string())
}

fn open_store(config: &Config, region: &str) -> Result<Arc<Store>, String> {
    match config.backend {
        Backend::Memory => Ok(Arc::new(Store::Memory(MemoryObjectStore::new()))),
        Backend::Dir => {
            let bucket = bucket_name(&config.bucket_prefix, &config.account, region);
            let root = config.store_root.join(bucket);
            let store = DirObjectStore::open(root).map_err(|err| err.to_string())?;
            Ok(Arc::new(Store::Dir(store)))
        }
    }
}

fn spawn_shutdown_listener() -> watch::Receiver<bool> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            {
                Ok(term) => term,
                Err(err) => {
                    eprintln!("failed to install SIGTERM handler: {err}");
                    let _ = ctrl_c.await;
                    let _ = shutdown_tx.send(true);
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        println!("shutdown requested");
        let _ = shutdown_tx.send(true);
    });
    shutdown_rx
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<i32, String> {
    let config = parse_args()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Controller modes that do not need a worker identity.
    match &config.mode {
        Mode::Seed(path) => {
            let store = open_store(&config, config.region.as_deref().unwrap_or(DEFAULT_REGION))?;
            controller::seed_registry(store, path, config.addresses_per_worker).await?;
            return Ok(0);
        }
        Mode::UploadMiner(path) => {
            let store = open_store(&config, config.region.as_deref().unwrap_or(DEFAULT_REGION))?;
            controller::upload_miner_code(store, path, clock.now())?;
            return Ok(0);
        }
        Mode::ShowStats => {
            let store = open_store(&config, config.region.as_deref().unwrap_or(DEFAULT_REGION))?;
            controller::show_stats(store)?;
            return Ok(0);
        }
        Mode::Register(address) => {
            let api = HttpMineApi::new(config.api_url.as_str()).map_err(|err| err.to_string())?;
            let signer_binary = config
                .signer_binary
                .clone()
                .ok_or_else(|| format!("--register needs --signer\n{}", usage()))?;
            let signer = CommandSigner::new(signer_binary);
            controller::register_address(&api, &signer, address, &config.terms_version).await?;
            return Ok(0);
        }
        Mode::Scale(count) => {
            let compute = StaticComputeProvider::new(config.peers.clone());
            controller::scale_fleet(&compute, *count).await?;
            return Ok(0);
        }
        Mode::Worker | Mode::ReserveOnly => {}
    }

    let identity = resolve_identity(&config).await?;
    println!(
        "worker {} in {} ({} miner slot(s))",
        identity.worker_id, identity.region, config.workers
    );

    let store = open_store(&config, &identity.region)?;

    let mut allocator = Allocator::new(
        Arc::clone(&store),
        Arc::clone(&clock),
        config.data_dir.join(ADDRESS_CACHE_FILE),
    );
    allocator.stale_threshold = chrono::Duration::seconds(config.allocator_stale_secs);

    let addresses = match allocator
        .reserve(&identity.worker_id, &identity.public_endpoint)
        .await
    {
        Ok(addresses) => addresses,
        Err(err) if err.kind == FleetErrorKind::Exhausted || err.kind == FleetErrorKind::NotSeeded => {
            eprintln!("{err}");
            return Ok(2);
        }
        Err(err) => return Err(err.to_string()),
    };
    println!("reserved {} address(es)", addresses.len());

    if matches!(config.mode, Mode::ReserveOnly) {
        let out = serde_json::json!({
            "workerId": identity.worker_id,
            "addresses": addresses,
        });
        println!("{out}");
        return Ok(0);
    }

    let api = HttpMineApi::new(config.api_url.as_str()).map_err(|err| err.to_string())?;
    let donation = match &config.donation_url {
        Some(url) => Some(HttpDonationSource::new(url.as_str()).map_err(|err| err.to_string())?),
        None => None,
    };
    let mut peers = config.peers.clone();
    if peers.is_empty() {
        peers.push(identity.worker_id.clone());
    }
    let compute = StaticComputeProvider::new(peers);
    let runner = Arc::new(SubprocessMiner::new(
        config.miner_binary.clone(),
        config.miner_max_attempts,
    ));
    let counters = Arc::new(SessionCounters::default());

    let orchestrator_config = OrchestratorConfig {
        work_check_interval: Duration::from_secs(config.work_check_secs.max(1)),
        challenge_fetch_interval: chrono::Duration::seconds(config.challenge_fetch_secs.max(1)),
        expiry_scan_interval: Duration::from_secs(config.expiry_scan_secs.max(1)),
        heartbeat_interval: Duration::from_secs(config.heartbeat_secs.max(1)),
        reclaim_interval: Duration::from_secs(config.reclaim_secs.max(1)),
        shutdown_grace: Duration::from_secs(10),
    };

    let mut orchestrator = Orchestrator::new(
        Arc::clone(&store),
        api,
        runner,
        donation,
        compute,
        Arc::clone(&clock),
        identity.worker_id.as_str(),
        identity.public_endpoint.as_str(),
        identity.region.as_str(),
        addresses,
        config.workers,
        orchestrator_config,
        Arc::clone(&counters),
    );
    orchestrator.set_reclaim_stale(chrono::Duration::seconds(config.reclaim_stale_secs));

    {
        let stats = StatsLedger::new(Arc::clone(&store));
        let counters = Arc::clone(&counters);
        let reward_rate = orchestrator.reward_rate_handle();
        let interval = config.status_secs;
        let started = Instant::now();
        std::thread::spawn(move || {
            status::status_loop(stats, counters, reward_rate, interval, started)
        });
    }

    let shutdown_rx = spawn_shutdown_listener();
    orchestrator.run(shutdown_rx).await;

    if config.release_on_exit {
        if let Err(err) = allocator.release(&identity.worker_id).await {
            eprintln!("failed to release assignment: {err}");
        }
    }

    Ok(0)
}
