//! Per-worker request multiplexing.
//!
//! One relay sits between the external request server and a single backend
//! worker. Outbound, client requests are re-stamped with a locally-unique
//! internal id; inbound, worker frames are matched against the pending
//! table, the client's original id is restored, and the frame is handed to
//! the server for delivery. Proxy-originated requests block on a completion
//! channel instead.
//!
//! The dispatcher thread owns the worker-facing dealer socket. Other threads
//! reach it through an inproc pipe, so the socket itself never crosses a
//! thread boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use pot_wire::{
    is_bulk_topic, BulkFrame, ClientRequest, MessageKind, Response, TransactionId, WorkerRequest,
};

use crate::error::{ProxyError, ProxyResult};
use crate::ids::IdAllocator;
use crate::pending::{PendingEntry, PendingTable};
use crate::server::REPLY_SINK_ENDPOINT;

/// Request relay for one store.
pub struct RequestRelay {
    store: String,
    ids: IdAllocator,
    pending: Arc<PendingTable>,
    /// Feeds serialized requests into the dispatcher's outbound pipe.
    /// Shared by the server and supervisor threads, hence the mutex.
    outbound: Mutex<zmq::Socket>,
    config_timeout: Duration,
}

impl RequestRelay {
    /// Binds the worker-facing dealer at `endpoint` and starts the
    /// dispatcher thread.
    pub(crate) fn start(
        ctx: &zmq::Context,
        store: String,
        endpoint: &str,
        shutdown: Arc<AtomicBool>,
        poll_ms: i64,
        config_timeout: Duration,
    ) -> ProxyResult<(Arc<Self>, JoinHandle<()>)> {
        let dealer = ctx.socket(zmq::DEALER)?;
        dealer.set_linger(0)?;
        // Bounded so a send cannot wedge the dispatcher while the worker is
        // still coming up; an undeliverable request is dropped and the
        // caller times out.
        dealer.set_sndtimeo(2000)?;
        dealer
            .bind(endpoint)
            .map_err(|source| ProxyError::BindFailed {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let pipe_endpoint = format!("inproc://potd/out/{store}");
        let outbound_rx = ctx.socket(zmq::PULL)?;
        outbound_rx.bind(&pipe_endpoint)?;

        let sink = ctx.socket(zmq::PUSH)?;
        sink.set_linger(0)?;
        sink.set_sndtimeo(1000)?;
        sink.connect(REPLY_SINK_ENDPOINT)?;

        let outbound = ctx.socket(zmq::PUSH)?;
        outbound.set_linger(0)?;
        outbound.set_sndtimeo(1000)?;
        outbound.connect(&pipe_endpoint)?;

        let pending = Arc::new(PendingTable::new());
        let relay = Arc::new(Self {
            store: store.clone(),
            ids: IdAllocator::new(),
            pending: pending.clone(),
            outbound: Mutex::new(outbound),
            config_timeout,
        });

        let dispatcher = thread::Builder::new()
            .name(format!("potd-relay-{store}"))
            .spawn(move || {
                dispatch_loop(&store, &dealer, &outbound_rx, &sink, &pending, &shutdown, poll_ms);
            })?;

        Ok((relay, dispatcher))
    }

    /// Forwards a client READ/WRITE to the worker under a fresh internal id.
    ///
    /// `original_id` is the id the client chose (or was assigned on entry);
    /// it is restored on every frame delivered back to `route`.
    pub fn external_request(
        &self,
        route: &[u8],
        request: &ClientRequest,
        original_id: TransactionId,
    ) -> ProxyResult<()> {
        let entry = PendingEntry::External {
            route: route.to_vec(),
            original_id,
            held_descriptor: None,
        };
        let internal_id = self.pending.register(&self.ids, entry);
        let frame = WorkerRequest::from_client(request, internal_id).to_bytes()?;
        trace!(
            store = %self.store,
            client_id = %original_id,
            internal_id = %internal_id,
            "forwarding request to worker"
        );
        self.send_outbound(frame)
    }

    /// Issues a proxy-originated request and blocks until its terminal REP.
    ///
    /// The worker's ACK is not consumed by internal callers. The wait is
    /// bounded so a dead worker cannot wedge its supervisor.
    pub fn internal_request(&self, mut request: WorkerRequest) -> ProxyResult<Response> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let internal_id = self
            .pending
            .register(&self.ids, PendingEntry::Internal { reply: reply_tx });
        request.id = internal_id;
        let frame = request.to_bytes()?;
        self.send_outbound(frame)?;

        match reply_rx.recv_timeout(self.config_timeout) {
            Ok(response) => Ok(response),
            Err(_) => {
                self.pending.remove(internal_id);
                Err(ProxyError::InternalRequest {
                    store: self.store.clone(),
                    reason: format!("no response within {:?}", self.config_timeout),
                })
            }
        }
    }

    /// Drops every pending transaction. Called when the worker exits; the
    /// abandoned clients time out on their end.
    pub fn abandon_all(&self) {
        let abandoned = self.pending.abandon_all();
        if abandoned > 0 {
            debug!(store = %self.store, abandoned, "dropped pending transactions");
        }
    }

    /// Number of transactions currently outstanding.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The store this relay serves.
    pub fn store(&self) -> &str {
        &self.store
    }

    fn send_outbound(&self, frame: Vec<u8>) -> ProxyResult<()> {
        let outbound = self.outbound.lock().expect("outbound pipe lock poisoned");
        outbound.send(frame, 0)?;
        Ok(())
    }
}

impl std::fmt::Debug for RequestRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRelay")
            .field("store", &self.store)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

fn dispatch_loop(
    store: &str,
    dealer: &zmq::Socket,
    outbound_rx: &zmq::Socket,
    sink: &zmq::Socket,
    pending: &PendingTable,
    shutdown: &AtomicBool,
    poll_ms: i64,
) {
    debug!(store, "request relay dispatcher started");

    while !shutdown.load(Ordering::Relaxed) {
        let mut items = [
            dealer.as_poll_item(zmq::POLLIN),
            outbound_rx.as_poll_item(zmq::POLLIN),
        ];
        match zmq::poll(&mut items, poll_ms) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(zmq::Error::EINTR) => continue,
            Err(e) => {
                warn!(store, error = %e, "relay poll failed");
                break;
            }
        }
        let worker_ready = items[0].is_readable();
        let pipe_ready = items[1].is_readable();

        if pipe_ready {
            loop {
                match outbound_rx.recv_bytes(zmq::DONTWAIT) {
                    Ok(frame) => {
                        if let Err(e) = dealer.send(frame, 0) {
                            warn!(store, error = %e, "failed to hand request to worker");
                        }
                    }
                    Err(zmq::Error::EAGAIN) => break,
                    Err(e) => {
                        warn!(store, error = %e, "outbound pipe read failed");
                        break;
                    }
                }
            }
        }

        if worker_ready {
            loop {
                match dealer.recv_bytes(zmq::DONTWAIT) {
                    Ok(frame) => handle_worker_frame(store, &frame, pending, sink),
                    Err(zmq::Error::EAGAIN) => break,
                    Err(e) => {
                        warn!(store, error = %e, "worker socket read failed");
                        break;
                    }
                }
            }
        }
    }

    debug!(store, "request relay dispatcher stopped");
}

fn handle_worker_frame(store: &str, frame: &[u8], pending: &PendingTable, sink: &zmq::Socket) {
    if is_bulk_topic(frame) {
        match BulkFrame::parse(frame) {
            Ok(bulk) => forward_bulk(store, bulk, pending, sink),
            Err(e) => warn!(store, error = %e, "dropping malformed bulk frame"),
        }
        return;
    }

    let response = match Response::parse(frame) {
        Ok(response) => response,
        Err(e) => {
            warn!(store, error = %e, "dropping malformed worker frame");
            return;
        }
    };
    handle_descriptor(store, response, pending, sink);
}

/// Snapshot of the pending entry, taken under the table lock.
enum EntryKind {
    Internal,
    External {
        route: Vec<u8>,
        original_id: TransactionId,
    },
}

fn handle_descriptor(store: &str, response: Response, pending: &PendingTable, sink: &zmq::Socket) {
    let internal_id = response.id;
    let kind = response.kind();

    if matches!(kind, MessageKind::Pub | MessageKind::PubBulk) {
        warn!(store, id = %internal_id, "unexpected broadcast on the request socket");
        return;
    }

    let Some(entry) = pending.with_entry(internal_id, |entry| match entry {
        PendingEntry::Internal { .. } => EntryKind::Internal,
        PendingEntry::External {
            route, original_id, ..
        } => EntryKind::External {
            route: route.clone(),
            original_id: *original_id,
        },
    }) else {
        // The worker answered a transaction nobody is waiting on, most
        // likely one abandoned across a restart.
        debug!(store, id = %internal_id, "dropping response for unknown transaction");
        return;
    };

    match entry {
        EntryKind::Internal => match kind {
            // Internal callers do not consume ACKs.
            MessageKind::Ack => trace!(store, id = %internal_id, "internal request acknowledged"),
            MessageKind::Rep | MessageKind::RepBulk => {
                if kind == MessageKind::RepBulk {
                    warn!(store, id = %internal_id, "bulk reply to an internal request");
                }
                if let Some(PendingEntry::Internal { reply }) = pending.remove(internal_id) {
                    if reply.send(response).is_err() {
                        debug!(store, id = %internal_id, "internal waiter already gone");
                    }
                }
            }
            MessageKind::Pub | MessageKind::PubBulk => unreachable!("filtered above"),
        },
        EntryKind::External { route, original_id } => {
            // Restore the id the client chose before anything goes out.
            let mut response = response;
            response.id = original_id;
            let frame = match response.to_bytes() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(store, id = %internal_id, error = %e, "failed to rebuild descriptor");
                    return;
                }
            };

            match kind {
                MessageKind::Ack => {
                    send_to_route(store, sink, &route, vec![frame]);
                }
                MessageKind::Rep => {
                    send_to_route(store, sink, &route, vec![frame]);
                    pending.remove(internal_id);
                }
                MessageKind::RepBulk => {
                    // Hold the descriptor; it leaves together with the bulk
                    // frame so no other transaction can interleave.
                    pending.with_entry(internal_id, |entry| {
                        if let PendingEntry::External { held_descriptor, .. } = entry {
                            *held_descriptor = Some(frame);
                        }
                    });
                }
                MessageKind::Pub | MessageKind::PubBulk => unreachable!("filtered above"),
            }
        }
    }
}

fn forward_bulk(store: &str, bulk: BulkFrame, pending: &PendingTable, sink: &zmq::Socket) {
    let internal_id = bulk.id;

    let Some(parts) = pending.with_entry(internal_id, |entry| match entry {
        PendingEntry::External {
            route,
            original_id,
            held_descriptor,
        } => {
            let descriptor = held_descriptor.take()?;
            let rewritten = bulk.clone().with_id(*original_id).encode();
            Some((route.clone(), descriptor, rewritten))
        }
        PendingEntry::Internal { .. } => None,
    }) else {
        debug!(store, id = %internal_id, "dropping bulk frame for unknown transaction");
        return;
    };

    let Some((route, descriptor, rewritten)) = parts else {
        warn!(store, id = %internal_id, "bulk frame without a held descriptor");
        return;
    };

    send_to_route(store, sink, &route, vec![descriptor, rewritten]);
    pending.remove(internal_id);
}

/// Ships one or more frames to a client route through the server's sink.
/// Frames grouped in a single push are delivered back to back.
fn send_to_route(store: &str, sink: &zmq::Socket, route: &[u8], frames: Vec<Vec<u8>>) {
    let mut parts = Vec::with_capacity(frames.len() + 1);
    parts.push(route.to_vec());
    parts.extend(frames);
    if let Err(e) = sink.send_multipart(parts, 0) {
        warn!(store, error = %e, "failed to hand response to the server");
    }
}
