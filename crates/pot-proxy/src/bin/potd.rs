//! Broker proxy daemon.

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pot_proxy::{Proxy, ProxyConfig};

#[derive(Debug, Parser)]
#[command(name = "potd", about = "POT telemetry broker proxy")]
struct Args {
    /// Stores to serve; one backend worker is launched per store.
    #[arg(required = true)]
    stores: Vec<String>,

    /// External request (router) endpoint.
    #[arg(long, default_value = "tcp://*:10111")]
    request_endpoint: String,

    /// External publish endpoint.
    #[arg(long, default_value = "tcp://*:10133")]
    publish_endpoint: String,

    /// Backend worker program; invoked as `<worker> <req> <pub> <store>`.
    #[arg(long, default_value = "pot-worker")]
    worker: String,

    /// Seconds to wait before respawning an exited worker.
    #[arg(long, default_value_t = 10)]
    restart_delay: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = ProxyConfig::new(args.stores)
        .with_request_endpoint(args.request_endpoint)
        .with_publish_endpoint(args.publish_endpoint)
        .with_worker_command([args.worker])
        .with_restart_delay(Duration::from_secs(args.restart_delay));

    match Proxy::start(config) {
        Ok(mut proxy) => proxy.wait(),
        Err(e) => {
            eprintln!("potd: {e}");
            std::process::exit(1);
        }
    }
}
