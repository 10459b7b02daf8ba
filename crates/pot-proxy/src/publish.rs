//! Broadcast forwarding.
//!
//! Each worker gets a relay that subscribes to everything the worker
//! publishes and forwards it, byte for byte, into the shared external
//! publisher. Forwarding is byte-exact: frames are never rewritten. The
//! relay reads just enough of a frame to keep two-frame messages together —
//! the leading topic token, and the `bulk` marker of a publish descriptor.
//! A descriptor that announces a continuation is held until the `;bulk`
//! frame arrives on this worker's socket, and the pair goes into the
//! external publisher as one atomic group; a lone descriptor racing other
//! stores' relays through the shared sink could otherwise end up separated
//! from its continuation on the external socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use pot_wire::{is_bulk_topic, BUNDLE_SUFFIX};

use crate::error::{ProxyError, ProxyResult};

/// Inproc endpoint feeding the external publisher.
const PUBLISH_SINK_ENDPOINT: &str = "inproc://potd/broadcasts";

/// Bound on holding a descriptor for its continuation. The worker emits the
/// pair back to back on one socket, so a miss means it died mid-message.
const PAIRING_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts the thread owning the external publish socket.
pub(crate) fn spawn_publisher(
    ctx: &zmq::Context,
    endpoint: &str,
    shutdown: Arc<AtomicBool>,
    poll_ms: i64,
) -> ProxyResult<JoinHandle<()>> {
    let publisher = ctx.socket(zmq::PUB)?;
    publisher.set_linger(0)?;
    publisher
        .bind(endpoint)
        .map_err(|source| ProxyError::BindFailed {
            endpoint: endpoint.to_string(),
            source,
        })?;

    let sink = ctx.socket(zmq::PULL)?;
    sink.bind(PUBLISH_SINK_ENDPOINT)?;

    info!(endpoint, "publish socket bound");

    let handle = thread::Builder::new()
        .name("potd-publisher".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Relaxed) {
                let mut items = [sink.as_poll_item(zmq::POLLIN)];
                match zmq::poll(&mut items, poll_ms) {
                    Ok(0) => continue,
                    Ok(_) => {}
                    Err(zmq::Error::EINTR) => continue,
                    Err(e) => {
                        warn!(error = %e, "publisher poll failed");
                        break;
                    }
                }
                loop {
                    match sink.recv_multipart(zmq::DONTWAIT) {
                        Ok(frames) => {
                            // Frames grouped into one multipart message are
                            // emitted consecutively.
                            for frame in frames {
                                if let Err(e) = publisher.send(frame, 0) {
                                    warn!(error = %e, "broadcast send failed");
                                }
                            }
                        }
                        Err(zmq::Error::EAGAIN) => break,
                        Err(e) => {
                            warn!(error = %e, "broadcast sink read failed");
                            break;
                        }
                    }
                }
            }
            debug!("publisher stopped");
        })?;

    Ok(handle)
}

/// Starts the forwarding thread for one worker's publish socket.
pub(crate) fn spawn_publish_relay(
    ctx: &zmq::Context,
    store: String,
    endpoint: &str,
    shutdown: Arc<AtomicBool>,
    poll_ms: i64,
) -> ProxyResult<JoinHandle<()>> {
    let subscriber = ctx.socket(zmq::SUB)?;
    subscriber.set_linger(0)?;
    subscriber
        .bind(endpoint)
        .map_err(|source| ProxyError::BindFailed {
            endpoint: endpoint.to_string(),
            source,
        })?;
    subscriber.set_subscribe(b"")?;

    let sink = ctx.socket(zmq::PUSH)?;
    sink.set_linger(0)?;
    sink.set_sndtimeo(1000)?;
    sink.connect(PUBLISH_SINK_ENDPOINT)?;

    let handle = thread::Builder::new()
        .name(format!("potd-pub-{store}"))
        .spawn(move || {
            relay_loop(&store, &subscriber, &sink, &shutdown, poll_ms);
        })?;

    Ok(handle)
}

/// One poll slice on the worker's publish socket.
enum Polled {
    Frame(Vec<u8>),
    Idle,
    Failed,
}

fn relay_loop(
    store: &str,
    subscriber: &zmq::Socket,
    sink: &zmq::Socket,
    shutdown: &AtomicBool,
    poll_ms: i64,
) {
    debug!(store, "publish relay started");

    // A frame received while waiting for a continuation that turned out to
    // be something else, carried into the next iteration.
    let mut carry: Option<Vec<u8>> = None;

    while !shutdown.load(Ordering::Relaxed) {
        let frame = match carry.take() {
            Some(frame) => frame,
            None => match poll_frame(store, subscriber, poll_ms) {
                Polled::Frame(frame) => frame,
                Polled::Idle => continue,
                Polled::Failed => break,
            },
        };

        if !announces_continuation(&frame) {
            // Plain publishes, bundles, and stray continuations go out as
            // they arrive.
            forward(store, sink, vec![frame]);
            continue;
        }

        // Hold the descriptor until its continuation shows up on this
        // worker's socket; only this thread reads it, so the wait cannot
        // stall any other store.
        match await_continuation(store, subscriber, shutdown, poll_ms) {
            Some(next) if is_bulk_topic(&next) => forward(store, sink, vec![frame, next]),
            Some(next) => {
                warn!(store, "descriptor announced a bulk frame that never came");
                forward(store, sink, vec![frame]);
                carry = Some(next);
            }
            None => {
                warn!(store, "descriptor announced a bulk frame that never came");
                forward(store, sink, vec![frame]);
            }
        }
    }

    debug!(store, "publish relay stopped");
}

fn poll_frame(store: &str, subscriber: &zmq::Socket, poll_ms: i64) -> Polled {
    let mut items = [subscriber.as_poll_item(zmq::POLLIN)];
    match zmq::poll(&mut items, poll_ms) {
        Ok(0) => return Polled::Idle,
        Ok(_) => {}
        Err(zmq::Error::EINTR) => return Polled::Idle,
        Err(e) => {
            warn!(store, error = %e, "publish relay poll failed");
            return Polled::Failed;
        }
    }
    match subscriber.recv_bytes(zmq::DONTWAIT) {
        Ok(frame) => Polled::Frame(frame),
        Err(zmq::Error::EAGAIN) => Polled::Idle,
        Err(e) => {
            warn!(store, error = %e, "worker publish read failed");
            Polled::Failed
        }
    }
}

/// Blocks on this worker's socket until the next frame, the pairing
/// deadline, or shutdown.
fn await_continuation(
    store: &str,
    subscriber: &zmq::Socket,
    shutdown: &AtomicBool,
    poll_ms: i64,
) -> Option<Vec<u8>> {
    let deadline = Instant::now() + PAIRING_TIMEOUT;
    while !shutdown.load(Ordering::Relaxed) && Instant::now() < deadline {
        match poll_frame(store, subscriber, poll_ms) {
            Polled::Frame(frame) => return Some(frame),
            Polled::Idle => continue,
            Polled::Failed => return None,
        }
    }
    None
}

/// True when a frame is a publish descriptor carrying the `bulk` marker,
/// meaning the worker's next frame is its raw continuation. Continuations
/// and bundles are settled by their topic suffix alone; everything else
/// needs a look at the descriptor body.
fn announces_continuation(frame: &[u8]) -> bool {
    if is_bulk_topic(frame) {
        return false;
    }
    let Some(space) = frame.iter().position(|&byte| byte == b' ') else {
        return false;
    };
    if frame[..space].ends_with(BUNDLE_SUFFIX.as_bytes()) {
        return false;
    }
    serde_json::from_slice::<serde_json::Value>(&frame[space + 1..])
        .ok()
        .and_then(|body| body.get("bulk").and_then(serde_json::Value::as_bool))
        .unwrap_or(false)
}

fn forward(store: &str, sink: &zmq::Socket, frames: Vec<Vec<u8>>) {
    if let Err(e) = sink.send_multipart(frames, 0) {
        warn!(store, error = %e, "failed to forward broadcast");
    }
}

#[cfg(test)]
mod tests {
    use super::announces_continuation;

    #[test]
    fn only_bulk_marked_descriptors_announce_a_continuation() {
        assert!(announces_continuation(
            br#"s.LASTIMAGE {"message":"PUB","id":"00000001","time":0.0,"bulk":true}"#
        ));
        assert!(!announces_continuation(
            br#"s.DISP2MSG {"message":"PUB","id":"00000001","time":0.0}"#
        ));
        assert!(!announces_continuation(b"s.LASTIMAGE;bulk 00000001 raw"));
        assert!(!announces_continuation(br#"s;bundle [{"message":"PUB","id":"00000001","time":0.0}]"#));
        assert!(!announces_continuation(b"s.EL not-json"));
        assert!(!announces_continuation(b"lonely-topic"));
    }
}
