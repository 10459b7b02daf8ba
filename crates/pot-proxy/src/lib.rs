//! # pot-proxy: POT telemetry broker proxy
//!
//! The proxy exposes two external messaging endpoints and multiplexes them
//! across a fleet of per-store backend worker processes.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                              potd                                │
//! │                                                                  │
//! │  clients ──▶ router ──▶ RequestServer ──▶ RequestRelay ──▶ worker│
//! │  clients ◀── router ◀────── sink ◀─────── RequestRelay ◀── worker│
//! │                                                                  │
//! │  clients ◀── pub ◀── publisher ◀── PublishRelay ◀── worker pub   │
//! │                                                                  │
//! │  WorkerSupervisor: spawn / CONFIG fetch / watch / respawn        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Client requests carry client-chosen transaction ids; the relays re-stamp
//! them with per-worker internal ids on the way in and restore them on the
//! way out, so concurrent clients never collide. Broadcasts are forwarded
//! byte-exact. ID and CONFIG requests are answered locally from the
//! configuration cache each supervisor fills at worker start-up.
//!
//! The proxy follows an explicit-thread model: every socket is owned by one
//! thread, and threads communicate over inproc pipes and shared tables.

mod cache;
mod config;
mod error;
mod ids;
mod pending;
mod proxy;
mod publish;
mod relay;
mod server;
mod supervisor;

pub use cache::{ConfigBlock, ConfigCache};
pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use proxy::Proxy;
pub use relay::RequestRelay;
