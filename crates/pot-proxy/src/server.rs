//! External request server.
//!
//! Owns the router socket every client talks to. Inbound frames are
//! classified and either answered locally (ID, CONFIG) or handed to the
//! owning store's request relay (READ, WRITE). Responses produced by the
//! relays come back through an inproc sink so that this thread is the only
//! writer on the router.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use pot_wire::{store_of, ClientRequest, ErrorBody, RequestKind, Response, TransactionId};

use crate::cache::ConfigCache;
use crate::error::{ProxyError, ProxyResult};
use crate::ids::IdAllocator;
use crate::relay::RequestRelay;

/// Inproc endpoint on which relays deposit frames for client delivery.
pub(crate) const REPLY_SINK_ENDPOINT: &str = "inproc://potd/replies";

/// Immutable mapping from store name to its request relay, built once at
/// start-up.
pub(crate) type StoreRegistry = HashMap<String, Arc<RequestRelay>>;

/// Binds the inproc sink the relays deposit responses into. Done before any
/// relay starts so their pipes always find the endpoint.
pub(crate) fn bind_reply_sink(ctx: &zmq::Context) -> ProxyResult<zmq::Socket> {
    let sink = ctx.socket(zmq::PULL)?;
    sink.bind(REPLY_SINK_ENDPOINT)?;
    Ok(sink)
}

pub(crate) fn spawn_server(
    ctx: &zmq::Context,
    endpoint: &str,
    sink: zmq::Socket,
    registry: Arc<StoreRegistry>,
    cache: Arc<ConfigCache>,
    shutdown: Arc<AtomicBool>,
    poll_ms: i64,
) -> ProxyResult<JoinHandle<()>> {
    let router = ctx.socket(zmq::ROUTER)?;
    router.set_linger(0)?;
    router
        .bind(endpoint)
        .map_err(|source| ProxyError::BindFailed {
            endpoint: endpoint.to_string(),
            source,
        })?;

    info!(endpoint, "request server listening");

    let handle = thread::Builder::new()
        .name("potd-server".to_string())
        .spawn(move || {
            let ids = IdAllocator::new();
            run_server(&router, &sink, &registry, &cache, &ids, &shutdown, poll_ms);
        })?;

    Ok(handle)
}

fn run_server(
    router: &zmq::Socket,
    sink: &zmq::Socket,
    registry: &StoreRegistry,
    cache: &ConfigCache,
    ids: &IdAllocator,
    shutdown: &AtomicBool,
    poll_ms: i64,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let mut items = [
            router.as_poll_item(zmq::POLLIN),
            sink.as_poll_item(zmq::POLLIN),
        ];
        match zmq::poll(&mut items, poll_ms) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(zmq::Error::EINTR) => continue,
            Err(e) => {
                warn!(error = %e, "server poll failed");
                break;
            }
        }
        let inbound_ready = items[0].is_readable();
        let sink_ready = items[1].is_readable();

        if sink_ready {
            loop {
                match sink.recv_multipart(zmq::DONTWAIT) {
                    Ok(parts) => deliver(router, parts),
                    Err(zmq::Error::EAGAIN) => break,
                    Err(e) => {
                        warn!(error = %e, "response sink read failed");
                        break;
                    }
                }
            }
        }

        if inbound_ready {
            loop {
                match router.recv_multipart(zmq::DONTWAIT) {
                    Ok(mut parts) => {
                        if parts.len() != 2 {
                            warn!(parts = parts.len(), "malformed client message");
                            continue;
                        }
                        let frame = parts.pop().expect("length checked above");
                        let route = parts.pop().expect("length checked above");
                        handle_request(router, registry, cache, ids, &route, &frame);
                    }
                    Err(zmq::Error::EAGAIN) => break,
                    Err(e) => {
                        warn!(error = %e, "router read failed");
                        break;
                    }
                }
            }
        }
    }

    debug!("request server stopped");
}

/// Emits relay-produced frames. The first part is the client route; every
/// following part goes out as its own message, back to back, so a two-frame
/// reply is never interleaved with another transaction.
fn deliver(router: &zmq::Socket, mut parts: Vec<Vec<u8>>) {
    if parts.len() < 2 {
        warn!(parts = parts.len(), "malformed sink message");
        return;
    }
    let route = parts.remove(0);
    for frame in parts {
        if let Err(e) = router.send_multipart([route.clone(), frame], 0) {
            warn!(error = %e, "failed to address response to client");
        }
    }
}

fn handle_request(
    router: &zmq::Socket,
    registry: &StoreRegistry,
    cache: &ConfigCache,
    ids: &IdAllocator,
    route: &[u8],
    frame: &[u8],
) {
    let request = match ClientRequest::parse(frame) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "rejecting unparseable request");
            // READ/WRITE never get an ACK from this server, broken or not;
            // everything else is acknowledged before the error reply.
            let id = ids.next();
            if !looks_like_worker_request(frame) {
                send_descriptor(router, route, &Response::ack(id));
            }
            send_descriptor(
                router,
                route,
                &Response::rep(id).with_error(ErrorBody::from_wire(&e)),
            );
            return;
        }
    };

    // Every request carries an id from here on, client-chosen or generated
    // for ACK symmetry.
    let id = request.id.unwrap_or_else(|| ids.next());

    match request.kind {
        // READ/WRITE are acknowledged by the worker, not here; the relay
        // forwards the worker's ACK and REP under the client's id.
        RequestKind::Read | RequestKind::Write => {
            if let Err(error) = dispatch_to_worker(registry, route, &request, id) {
                send_descriptor(router, route, &Response::rep(id).with_error(error));
            }
        }
        RequestKind::Id | RequestKind::Hash => {
            send_descriptor(router, route, &Response::ack(id));
            let reply = match cache.identities(request.name.as_deref()) {
                Ok(data) => Response::rep(id).with_data(data),
                Err(error) => Response::rep(id).with_error(error),
            };
            send_descriptor(router, route, &reply);
        }
        RequestKind::Config => {
            send_descriptor(router, route, &Response::ack(id));
            let store = request.name.as_deref().unwrap_or_default();
            let reply = match cache.block(store) {
                Some(block) => Response::rep(id).with_name(store).with_data(block),
                None => Response::rep(id).with_error(ErrorBody::new(
                    "KeyError",
                    format!("no local configuration for '{store}'"),
                )),
            };
            send_descriptor(router, route, &reply);
        }
    }
}

/// True when a frame that failed to parse was still recognizably a READ or
/// WRITE, whose ACKs belong to the worker.
fn looks_like_worker_request(frame: &[u8]) -> bool {
    frame.starts_with(b"READ ") || frame.starts_with(b"WRITE ")
}

fn dispatch_to_worker(
    registry: &StoreRegistry,
    route: &[u8],
    request: &ClientRequest,
    id: TransactionId,
) -> Result<(), ErrorBody> {
    let name = request
        .name
        .as_deref()
        .ok_or_else(|| ErrorBody::new("KeyError", "missing required field: name"))?;
    let store = store_of(name)
        .ok_or_else(|| ErrorBody::new("KeyError", format!("no local store for '{name}'")))?;
    let relay = registry
        .get(store)
        .ok_or_else(|| ErrorBody::new("KeyError", format!("no local store for '{store}'")))?;

    relay
        .external_request(route, request, id)
        .map_err(|e| ErrorBody::new("RuntimeError", e.to_string()))
}

fn send_descriptor(router: &zmq::Socket, route: &[u8], response: &Response) {
    match response.to_bytes() {
        Ok(frame) => {
            if let Err(e) = router.send_multipart([route.to_vec(), frame], 0) {
                warn!(error = %e, "failed to send descriptor to client");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode descriptor"),
    }
}
