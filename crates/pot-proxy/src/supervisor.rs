//! Backend worker lifecycle.
//!
//! One supervisor thread per store: it owns the worker's ephemeral endpoint
//! directory, launches the process, fetches the store configuration through
//! the request relay, and respawns the worker after a fixed pause whenever
//! it exits. Socket endpoints are reused across restarts; transactions
//! pending at the moment of an exit are abandoned.

use std::process::{Child, Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tracing::{error, info, warn};

use pot_wire::WorkerRequest;

use crate::cache::{ConfigBlock, ConfigCache};
use crate::error::{ProxyError, ProxyResult};
use crate::relay::RequestRelay;

/// How often the supervisor looks at the child and the shutdown flag.
const WATCH_INTERVAL: Duration = Duration::from_millis(250);

/// Everything a supervisor thread needs for one store.
pub(crate) struct WorkerPlan {
    pub store: String,
    /// Holds the ipc endpoints; deleted when the supervisor stops.
    pub endpoint_dir: TempDir,
    pub request_endpoint: String,
    pub publish_endpoint: String,
    pub command: Vec<String>,
    pub relay: Arc<RequestRelay>,
    pub cache: Arc<ConfigCache>,
    pub restart_delay: Duration,
}

pub(crate) fn spawn_supervisor(
    plan: WorkerPlan,
    shutdown: Arc<AtomicBool>,
) -> ProxyResult<JoinHandle<()>> {
    let name = format!("potd-supervisor-{}", plan.store);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || supervise(plan, &shutdown))?;
    Ok(handle)
}

fn supervise(plan: WorkerPlan, shutdown: &AtomicBool) {
    let WorkerPlan {
        store,
        endpoint_dir,
        request_endpoint,
        publish_endpoint,
        command,
        relay,
        cache,
        restart_delay,
    } = plan;

    // The endpoint directory lives exactly as long as this thread.
    let _endpoints = endpoint_dir;

    while !shutdown.load(Ordering::Relaxed) {
        let mut child = match spawn_worker(&command, &request_endpoint, &publish_endpoint, &store) {
            Ok(child) => child,
            Err(e) => {
                error!(store = %store, error = %e, "failed to spawn worker");
                if !pause(shutdown, restart_delay) {
                    break;
                }
                continue;
            }
        };
        info!(store = %store, pid = child.id(), "worker started");

        fetch_config(&store, &relay, &cache);

        match watch(&mut child, shutdown) {
            WaitOutcome::Exited(status) => {
                warn!(store = %store, %status, "worker exited");
            }
            WaitOutcome::Shutdown => {
                let _ = child.kill();
                let _ = child.wait();
                break;
            }
        }

        relay.abandon_all();

        if !pause(shutdown, restart_delay) {
            break;
        }
    }

    info!(store = %store, "supervisor stopped");
}

fn spawn_worker(
    command: &[String],
    request_endpoint: &str,
    publish_endpoint: &str,
    store: &str,
) -> ProxyResult<Child> {
    let (program, fixed_args) = command.split_first().ok_or_else(|| ProxyError::SpawnFailed {
        store: store.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty worker command"),
    })?;

    Command::new(program)
        .args(fixed_args)
        .arg(request_endpoint)
        .arg(publish_endpoint)
        .arg(store)
        .spawn()
        .map_err(|source| ProxyError::SpawnFailed {
            store: store.to_string(),
            source,
        })
}

/// Fetches the store configuration and caches it. A failure is surfaced to
/// operators but does not stop the supervisor; CONFIG requests for the store
/// then answer with a KeyError until a later fetch succeeds.
fn fetch_config(store: &str, relay: &RequestRelay, cache: &ConfigCache) {
    let response = match relay.internal_request(WorkerRequest::config(store)) {
        Ok(response) => response,
        Err(e) => {
            error!(store, error = %e, "configuration request failed");
            return;
        }
    };

    if let Some(err) = &response.error {
        error!(
            store,
            kind = %err.kind,
            text = %err.text,
            "worker rejected the configuration request"
        );
        return;
    }

    let Some(block) = response.data else {
        error!(store, "configuration response carried no data");
        return;
    };

    match ConfigBlock::new(block) {
        Ok(block) => {
            info!(store, id = %block.id(), "configuration cached");
            cache.store(store, block);
        }
        Err(e) => error!(store, error = %e, "unusable configuration block"),
    }
}

enum WaitOutcome {
    Exited(ExitStatus),
    Shutdown,
}

/// Waits on the child in short slices so shutdown stays observable.
fn watch(child: &mut Child, shutdown: &AtomicBool) -> WaitOutcome {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return WaitOutcome::Shutdown;
        }
        match child.try_wait() {
            Ok(Some(status)) => return WaitOutcome::Exited(status),
            Ok(None) => thread::sleep(WATCH_INTERVAL),
            Err(e) => {
                warn!(error = %e, "wait on worker failed");
                thread::sleep(WATCH_INTERVAL);
            }
        }
    }
}

/// Sleeps for `delay`, waking early on shutdown. Returns false when the
/// shutdown flag was raised.
fn pause(shutdown: &AtomicBool, delay: Duration) -> bool {
    let deadline = Instant::now() + delay;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(WATCH_INTERVAL.min(deadline - now));
    }
}
