//! Top-level proxy assembly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::cache::ConfigCache;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::publish;
use crate::relay::RequestRelay;
use crate::server::{self, StoreRegistry};
use crate::supervisor::{self, WorkerPlan};

/// A running broker proxy.
///
/// Owns every proxy thread: the external publisher, the request server, and
/// one publish relay, request relay dispatcher, and supervisor per store.
/// Dropping the proxy (or calling [`Proxy::stop`]) raises the shared
/// shutdown flag, kills the workers, joins the threads, and removes the
/// ephemeral endpoint directories.
pub struct Proxy {
    shutdown: Arc<AtomicBool>,
    cache: Arc<ConfigCache>,
    registry: Arc<StoreRegistry>,
    threads: Vec<JoinHandle<()>>,
}

impl Proxy {
    /// Binds the external sockets and starts every proxy thread.
    pub fn start(config: ProxyConfig) -> ProxyResult<Self> {
        if config.stores.is_empty() {
            return Err(ProxyError::NoStores);
        }

        let ctx = zmq::Context::new();
        let shutdown = Arc::new(AtomicBool::new(false));
        let cache = Arc::new(ConfigCache::new());
        let poll_ms = config.poll_interval.as_millis() as i64;
        let mut threads = Vec::new();

        threads.push(publish::spawn_publisher(
            &ctx,
            &config.publish_endpoint,
            shutdown.clone(),
            poll_ms,
        )?);

        // The reply sink exists before any relay connects to it.
        let reply_sink = server::bind_reply_sink(&ctx)?;

        // Per-store plumbing: a private endpoint directory, the publish
        // relay, and the request relay. Supervisors start last so every
        // relay is in place before the first worker comes up.
        let mut registry: StoreRegistry = StoreRegistry::new();
        let mut plans = Vec::new();
        for store in &config.stores {
            let endpoint_dir = tempfile::Builder::new()
                .prefix(&format!("potd-{store}-"))
                .tempdir()?;
            let request_endpoint = format!("ipc://{}/req", endpoint_dir.path().display());
            let publish_endpoint = format!("ipc://{}/pub", endpoint_dir.path().display());

            threads.push(publish::spawn_publish_relay(
                &ctx,
                store.clone(),
                &publish_endpoint,
                shutdown.clone(),
                poll_ms,
            )?);

            let (relay, dispatcher) = RequestRelay::start(
                &ctx,
                store.clone(),
                &request_endpoint,
                shutdown.clone(),
                poll_ms,
                config.config_timeout,
            )?;
            threads.push(dispatcher);
            registry.insert(store.clone(), relay.clone());

            plans.push(WorkerPlan {
                store: store.clone(),
                endpoint_dir,
                request_endpoint,
                publish_endpoint,
                command: config.worker_command.clone(),
                relay,
                cache: cache.clone(),
                restart_delay: config.restart_delay,
            });
        }

        let registry = Arc::new(registry);
        threads.push(server::spawn_server(
            &ctx,
            &config.request_endpoint,
            reply_sink,
            registry.clone(),
            cache.clone(),
            shutdown.clone(),
            poll_ms,
        )?);

        for plan in plans {
            threads.push(supervisor::spawn_supervisor(plan, shutdown.clone())?);
        }

        info!(stores = config.stores.len(), "proxy running");

        Ok(Self {
            shutdown,
            cache,
            registry,
            threads,
        })
    }

    /// Blocks until every proxy thread has finished. The threads only
    /// finish once [`Proxy::stop`] is called (or the process is killed), so
    /// this is the daemon's park position.
    pub fn wait(&mut self) {
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("proxy thread panicked");
            }
        }
    }

    /// Stops every proxy thread, kills the workers, and removes the
    /// ephemeral endpoint directories.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wait();
    }

    /// The configuration cache, for inspection.
    pub fn cache(&self) -> &ConfigCache {
        &self.cache
    }

    /// Transactions currently outstanding across all stores.
    pub fn pending_total(&self) -> usize {
        self.registry.values().map(|relay| relay.pending_len()).sum()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("stores", &self.registry.len())
            .field("cached_configs", &self.cache.len())
            .finish_non_exhaustive()
    }
}
