use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::queue::WorkItem;

pub type MineFuture = Pin<Box<dyn Future<Output = MinerResult> + Send + 'static>>;

/// Outcome of one miner pass over one work item.
#[derive(Clone, Debug)]
pub enum MinerResult {
    Solved { nonce: String, hash: String },
    /// Clean exit without a solution; the item goes back in the queue.
    NoSolution,
    /// Terminated by the expiry scanner or shutdown.
    Aborted,
    Crashed(String),
}

/// Executes the hash search for one work item. The production runner
/// spawns the native miner binary; tests inject scripted runners.
pub trait MinerRunner: Send + Sync {
    fn mine(&self, item: WorkItem, abort: watch::Receiver<bool>) -> MineFuture;
}

/// The miner binary's single stdout JSON object.
#[derive(Debug, Deserialize)]
struct MinerOutput {
    success: bool,
    #[serde(default)]
    nonce: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn parse_miner_output(stdout: &str) -> MinerResult {
    let output: MinerOutput = match serde_json::from_str(stdout.trim()) {
        Ok(output) => output,
        Err(err) => return MinerResult::Crashed(format!("unparseable miner output: {err}")),
    };
    if !output.success {
        return MinerResult::NoSolution;
    }
    match output.nonce {
        Some(nonce) => MinerResult::Solved {
            nonce,
            hash: output.hash.unwrap_or_default(),
        },
        None => MinerResult::Crashed(
            output
                .message
                .unwrap_or_else(|| "miner reported success without a nonce".to_string()),
        ),
    }
}

/// Spawns the external miner binary once per work item.
pub struct SubprocessMiner {
    binary: PathBuf,
    max_attempts: u64,
}

impl SubprocessMiner {
    pub fn new(binary: impl Into<PathBuf>, max_attempts: u64) -> Self {
        Self {
            binary: binary.into(),
            max_attempts,
        }
    }
}

impl MinerRunner for SubprocessMiner {
    fn mine(&self, item: WorkItem, abort: watch::Receiver<bool>) -> MineFuture {
        let binary = self.binary.clone();
        let max_attempts = self.max_attempts;
        Box::pin(run_miner_process(binary, item, max_attempts, abort))
    }
}

async fn run_miner_process(
    binary: PathBuf,
    item: WorkItem,
    max_attempts: u64,
    mut abort: watch::Receiver<bool>,
) -> MinerResult {
    let mut child = match tokio::process::Command::new(&binary)
        .arg("--address")
        .arg(&item.address)
        .arg("--challenge-id")
        .arg(&item.challenge.challenge_id)
        .arg("--difficulty")
        .arg(item.challenge.difficulty.as_str())
        .arg("--no-pre-mine")
        .arg(&item.challenge.no_pre_mine)
        .arg("--latest-submission")
        .arg(item.challenge.latest_submission.to_rfc3339())
        .arg("--no-pre-mine-hour")
        .arg(&item.challenge.no_pre_mine_hour)
        .arg("--max-attempts")
        .arg(max_attempts.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return MinerResult::Crashed(format!("failed to spawn {}: {err}", binary.display()))
        }
    };

    let mut stdout = child.stdout.take().expect("stdout piped");

    let status = tokio::select! {
        status = child.wait() => status,
        changed = abort.changed() => {
            if changed.is_err() && !*abort.borrow() {
                // Pool went away without raising the flag; let the child
                // finish its pass.
                child.wait().await
            } else {
                terminate_child(&mut child).await;
                return MinerResult::Aborted;
            }
        }
    };

    let status = match status {
        Ok(status) => status,
        Err(err) => return MinerResult::Crashed(err.to_string()),
    };

    let mut buffer = String::new();
    if let Err(err) = stdout.read_to_string(&mut buffer).await {
        return MinerResult::Crashed(format!("failed to read miner output: {err}"));
    }

    if !status.success() {
        return MinerResult::Crashed(format!("miner exited with {status}"));
    }
    parse_miner_output(&buffer)
}

/// Ask the miner to stop with SIGTERM (it honors it promptly), falling
/// back to a hard kill if it lingers past a short grace.
async fn terminate_child(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
                .await
                .is_ok()
            {
                return;
            }
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solved_output_parses() {
        let result = parse_miner_output(
            r#"{
                "success": true,
                "nonce": "0019c96b6a30ee38",
                "preimage": "0019c96b6a30ee38addr...",
                "hash": "000694200fb04137"
            }"#,
        );
        match result {
            MinerResult::Solved { nonce, hash } => {
                assert_eq!(nonce, "0019c96b6a30ee38");
                assert_eq!(hash, "000694200fb04137");
            }
            other => panic!("expected solved, got {other:?}"),
        }
    }

    #[test]
    fn clean_miss_is_no_solution() {
        let result = parse_miner_output(
            r#"{"success": false, "message": "No solution found in 10000000 attempts"}"#,
        );
        assert!(matches!(result, MinerResult::NoSolution));
    }

    #[test]
    fn garbage_output_is_a_crash() {
        assert!(matches!(
            parse_miner_output("segfault"),
            MinerResult::Crashed(_)
        ));
        assert!(matches!(
            parse_miner_output(r#"{"success": true}"#),
            MinerResult::Crashed(_)
        ));
    }
}
