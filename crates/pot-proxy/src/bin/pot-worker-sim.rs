//! Simulated backend worker.
//!
//! Speaks the worker side of the broker protocol: a router connected to the
//! proxy's per-store request endpoint and a publisher connected to the
//! per-store publish endpoint. Elements are synthetic; names containing
//! `IMAGE` answer READ with a two-frame bulk reply, names containing `EXIT`
//! terminate the process after the ACK (exercising supervisor respawn), and
//! every WRITE triggers a broadcast of the written value.
//!
//! Used by the integration tests and handy for poking at a proxy by hand.

use std::sync::atomic::{AtomicU32, Ordering};

use clap::Parser;
use serde_json::json;

use pot_proxy::ProxyResult;
use pot_wire::{
    Broadcast, BulkFrame, RequestKind, Response, TransactionId, WorkerRequest,
};

/// Payload of every bulk reply; contains spaces and non-UTF-8 octets on
/// purpose.
const BULK_PAYLOAD: &[u8] = b"\x00\x01 simulated image bytes \xff\xfe";

static PUB_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Debug, Parser)]
#[command(name = "pot-worker-sim", about = "Simulated POT backend worker")]
struct Args {
    request_endpoint: String,
    publish_endpoint: String,
    store: String,
}

fn main() {
    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("pot-worker-sim: {e}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> ProxyResult<()> {
    let ctx = zmq::Context::new();

    let router = ctx.socket(zmq::ROUTER)?;
    router.set_linger(0)?;
    router.connect(&args.request_endpoint)?;

    let publisher = ctx.socket(zmq::PUB)?;
    publisher.set_linger(0)?;
    publisher.connect(&args.publish_endpoint)?;

    loop {
        let mut items = [router.as_poll_item(zmq::POLLIN)];
        zmq::poll(&mut items, 1000)?;
        if !items[0].is_readable() {
            continue;
        }
        let mut parts = router.recv_multipart(0)?;
        if parts.len() != 2 {
            continue;
        }
        let frame = parts.pop().expect("length checked above");
        let route = parts.pop().expect("length checked above");
        handle(&router, &publisher, &route, &frame, &args.store)?;
    }
}

fn handle(
    router: &zmq::Socket,
    publisher: &zmq::Socket,
    route: &[u8],
    frame: &[u8],
    store: &str,
) -> ProxyResult<()> {
    let request: WorkerRequest = match serde_json::from_slice(frame) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("pot-worker-sim: unparseable request: {e}");
            return Ok(());
        }
    };

    send(router, route, &Response::ack(request.id))?;

    let name = request.name.clone().unwrap_or_default();
    match request.request {
        RequestKind::Config => {
            send(router, route, &Response::rep(request.id).with_data(config_block(store)))?;
        }
        RequestKind::Read if name.contains("EXIT") => {
            std::process::exit(0);
        }
        RequestKind::Read if name.contains("IMAGE") => {
            let descriptor = Response::rep(request.id)
                .with_name(&name)
                .with_data(json!({"shape": [2, 4], "dtype": "uint8"}))
                .with_bulk();
            send(router, route, &descriptor)?;
            let bulk = BulkFrame::new(name, request.id, BULK_PAYLOAD);
            router.send_multipart([route.to_vec(), bulk.encode()], 0)?;
        }
        RequestKind::Read => {
            let reply = Response::rep(request.id)
                .with_name(&name)
                .with_data(json!({"asc": "42", "bin": 42}));
            send(router, route, &reply)?;
        }
        RequestKind::Write => {
            send(router, route, &Response::rep(request.id).with_name(&name))?;
            broadcast(publisher, &name, request.data.unwrap_or(json!(null)))?;
        }
        RequestKind::Id | RequestKind::Hash => {
            // The proxy answers these locally; reply empty for strays.
            send(router, route, &Response::rep(request.id))?;
        }
    }

    Ok(())
}

fn send(router: &zmq::Socket, route: &[u8], response: &Response) -> ProxyResult<()> {
    let frame = response.to_bytes()?;
    router.send_multipart([route.to_vec(), frame], 0)?;
    Ok(())
}

/// Publishes the new value of `name`, the way a live daemon announces every
/// accepted write. Names containing `IMAGE` broadcast a bulk pair.
fn broadcast(publisher: &zmq::Socket, name: &str, data: serde_json::Value) -> ProxyResult<()> {
    let pub_id = TransactionId::new(PUB_ID.fetch_add(1, Ordering::Relaxed));

    if name.contains("IMAGE") {
        let descriptor = Response::publish(pub_id).with_name(name).with_data(data).with_bulk();
        publisher.send(Broadcast::encode_message(name, &descriptor)?, 0)?;
        let bulk = BulkFrame::new(name, pub_id, BULK_PAYLOAD);
        publisher.send(bulk.encode(), 0)?;
        return Ok(());
    }

    let descriptor = Response::publish(pub_id).with_name(name).with_data(data);
    publisher.send(Broadcast::encode_message(name, &descriptor)?, 0)?;
    Ok(())
}

fn config_block(store: &str) -> serde_json::Value {
    // Stable synthetic identifier derived from the store name.
    let id = store
        .bytes()
        .fold(0x811c_9dc5_u32, |hash, byte| {
            (hash ^ u32::from(byte)).wrapping_mul(0x0100_0193)
        });

    json!({
        "name": store,
        "id": format!("{id:08x}"),
        "elements": [
            {"name": "DISP2MSG", "type": "string"},
            {"name": "EXPTIME", "type": "double", "units": "seconds"},
            {"name": "LASTIMAGE", "type": "integer array", "bulk": true},
        ],
    })
}
