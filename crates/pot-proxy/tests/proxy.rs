//! End-to-end tests: a proxy instance in front of the simulated worker,
//! driven through the client crate.

use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use pot_client::{ClientError, RequestClient, RequestClientConfig, SubscribeClient};
use pot_proxy::{Proxy, ProxyConfig};
use pot_wire::{Broadcast, ClientRequest, MessageKind, TransactionId};

/// Matches the payload the simulated worker attaches to bulk replies.
const SIM_BULK_PAYLOAD: &[u8] = b"\x00\x01 simulated image bytes \xff\xfe";

fn start_proxy_with_stores(stores: &[&str], request_port: u16, publish_port: u16) -> Proxy {
    let config = ProxyConfig::new(stores.iter().copied())
        .with_request_endpoint(format!("tcp://127.0.0.1:{request_port}"))
        .with_publish_endpoint(format!("tcp://127.0.0.1:{publish_port}"))
        .with_worker_command([env!("CARGO_BIN_EXE_pot-worker-sim")])
        .with_restart_delay(Duration::from_millis(500))
        .with_poll_interval(Duration::from_millis(100));
    Proxy::start(config).expect("proxy starts")
}

fn start_proxy(store: &str, request_port: u16, publish_port: u16) -> Proxy {
    start_proxy_with_stores(&[store], request_port, publish_port)
}

fn client(request_port: u16) -> RequestClient {
    let config = RequestClientConfig {
        ack_timeout: Duration::from_millis(500),
        reply_timeout: Duration::from_secs(5),
    };
    RequestClient::connect_with(&format!("tcp://127.0.0.1:{request_port}"), config)
        .expect("client connects")
}

/// Blocks until the worker is up and its configuration is cached.
fn wait_until_serving(client: &RequestClient, store: &str) {
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(reply) = client.config(store) {
            if reply.response.error.is_none() {
                return;
            }
        }
        assert!(
            Instant::now() < deadline,
            "worker for '{store}' never became ready"
        );
        thread::sleep(Duration::from_millis(100));
    }
}

#[test]
fn read_round_trips_the_client_id() {
    let _proxy = start_proxy("kpfguide", 19311, 19312);
    let client = client(19311);
    wait_until_serving(&client, "kpfguide");

    let request = ClientRequest::read("kpfguide.DISP2MSG").with_id(TransactionId::new(0x0a));
    let reply = client.request(&request).expect("read completes");

    assert_eq!(reply.response.kind(), MessageKind::Rep);
    assert_eq!(reply.id(), TransactionId::new(0x0a));
    assert_eq!(reply.response.name.as_deref(), Some("kpfguide.DISP2MSG"));
    assert!(reply.response.data.is_some());
    assert!(reply.response.error.is_none());
}

#[test]
fn write_round_trips_without_error() {
    let _proxy = start_proxy("kpfguide", 19321, 19322);
    let client = client(19321);
    wait_until_serving(&client, "kpfguide");

    let request =
        ClientRequest::write("kpfguide.EXPTIME", json!(4)).with_id(TransactionId::new(0x0b));
    let reply = client.request(&request).expect("write completes");

    assert_eq!(reply.id(), TransactionId::new(0x0b));
    assert!(reply.response.error.is_none());
}

#[test]
fn id_lists_every_configured_store() {
    let _proxy = start_proxy("kpfguide", 19331, 19332);
    let client = client(19331);
    wait_until_serving(&client, "kpfguide");

    let reply = client.send_raw(b"ID").expect("ID completes");
    let data = reply.response.data.expect("ID carries data");
    let entries = data.as_array().expect("data is an array");

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], "kpfguide");
    let id = entries[0]["id"].as_str().expect("id is a string");
    assert_eq!(id.len(), 8);
    assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));

    // HASH is processed identically.
    let via_hash = client.send_raw(b"HASH kpfguide").expect("HASH completes");
    assert_eq!(via_hash.response.data.expect("data")[0]["name"], "kpfguide");
}

#[test]
fn config_for_an_unknown_store_is_a_key_error() {
    let _proxy = start_proxy("kpfguide", 19341, 19342);
    let client = client(19341);
    wait_until_serving(&client, "kpfguide");

    let reply = client.send_raw(b"CONFIG nosuch").expect("CONFIG answered");
    let error = reply.response.error.expect("error body present");
    assert_eq!(error.kind, "KeyError");
    assert!(error.text.contains("nosuch"));
}

#[test]
fn unknown_request_kind_is_a_value_error() {
    let _proxy = start_proxy("kpfguide", 19351, 19352);
    let client = client(19351);
    wait_until_serving(&client, "kpfguide");

    let reply = client.send_raw(b"FROB widget").expect("answered");
    let error = reply.response.error.expect("error body present");
    assert_eq!(error.kind, "ValueError");
    assert!(error.text.contains("unhandled request type"));
}

#[test]
fn read_of_an_unknown_store_is_a_key_error() {
    let _proxy = start_proxy("kpfguide", 19361, 19362);
    let client = client(19361);
    wait_until_serving(&client, "kpfguide");

    let reply = client.read("nosuch.ELEMENT").expect("answered");
    let error = reply.response.error.expect("error body present");
    assert_eq!(error.kind, "KeyError");
    assert!(error.text.contains("no local store"));
}

#[test]
fn bulk_reply_carries_the_original_id_and_exact_payload() {
    let _proxy = start_proxy("kpfguide", 19371, 19372);
    let client = client(19371);
    wait_until_serving(&client, "kpfguide");

    let request = ClientRequest::read("kpfguide.LASTIMAGE").with_id(TransactionId::new(0x42));
    let reply = client.request(&request).expect("bulk read completes");

    assert_eq!(reply.response.kind(), MessageKind::RepBulk);
    assert_eq!(reply.id(), TransactionId::new(0x42));

    let bulk = reply.bulk.expect("bulk frame follows the descriptor");
    assert_eq!(bulk.id, TransactionId::new(0x42));
    assert_eq!(bulk.name, "kpfguide.LASTIMAGE");
    assert_eq!(&bulk.payload[..], SIM_BULK_PAYLOAD);
}

#[test]
fn pending_table_drains_after_a_burst() {
    let proxy = start_proxy("kpfguide", 19381, 19382);
    let client = client(19381);
    wait_until_serving(&client, "kpfguide");

    for i in 0..50u32 {
        let request =
            ClientRequest::read("kpfguide.DISP2MSG").with_id(TransactionId::new(i + 1));
        let reply = client.request(&request).expect("read completes");
        assert_eq!(reply.id(), TransactionId::new(i + 1));
    }

    // Every transaction got its terminal response, so nothing may linger.
    let deadline = Instant::now() + Duration::from_secs(2);
    while proxy.pending_total() != 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(proxy.pending_total(), 0);
}

#[test]
fn identical_client_ids_stay_isolated_per_route() {
    let _proxy = start_proxy("kpfguide", 19391, 19392);
    let probe = client(19391);
    wait_until_serving(&probe, "kpfguide");

    const REQUESTS: u32 = 1000;

    let worker = |port: u16, marker: &'static str| {
        thread::spawn(move || {
            let client = client(port);
            for i in 1..=REQUESTS {
                let request = ClientRequest::read(format!("kpfguide.{marker}"))
                    .with_id(TransactionId::new(i));
                let reply = client.request(&request).expect("read completes");
                // Each route gets its own responses under its own ids.
                assert_eq!(reply.id(), TransactionId::new(i));
                assert_eq!(
                    reply.response.name.as_deref(),
                    Some(format!("kpfguide.{marker}").as_str())
                );
            }
        })
    };

    let first = worker(19391, "DISP2MSG");
    let second = worker(19391, "EXPTIME");
    first.join().expect("first client finishes");
    second.join().expect("second client finishes");
}

#[test]
fn broadcasts_are_forwarded_byte_exact() {
    let _proxy = start_proxy("kpfguide", 19401, 19402);
    let client = client(19401);
    wait_until_serving(&client, "kpfguide");

    let subscriber =
        SubscribeClient::connect("tcp://127.0.0.1:19402").expect("subscriber connects");
    subscriber.subscribe_all().expect("subscribe");
    // Let the subscription reach the publisher before triggering traffic.
    thread::sleep(Duration::from_millis(300));

    client
        .write("kpfguide.DISP2MSG", json!("exposure started"))
        .expect("write completes");

    let frame = subscriber
        .recv_raw(Duration::from_secs(5))
        .expect("broadcast arrives");
    assert!(frame.starts_with(b"kpfguide.DISP2MSG "));

    match Broadcast::parse(&frame).expect("broadcast parses") {
        Broadcast::Message { topic, descriptor } => {
            assert_eq!(topic, "kpfguide.DISP2MSG");
            assert_eq!(descriptor.name.as_deref(), Some("kpfguide.DISP2MSG"));
            assert_eq!(descriptor.data, Some(json!("exposure started")));
        }
        other => panic!("expected a plain broadcast, got {other:?}"),
    }
}

#[test]
fn bulk_broadcasts_arrive_as_consecutive_frames() {
    let _proxy = start_proxy("kpfguide", 19411, 19412);
    let client = client(19411);
    wait_until_serving(&client, "kpfguide");

    let subscriber =
        SubscribeClient::connect("tcp://127.0.0.1:19412").expect("subscriber connects");
    subscriber.subscribe_all().expect("subscribe");
    thread::sleep(Duration::from_millis(300));

    client
        .write("kpfguide.LASTIMAGE", json!([1, 2, 3]))
        .expect("write completes");

    let descriptor = subscriber
        .recv(Duration::from_secs(5))
        .expect("descriptor arrives");
    let descriptor_id = match descriptor {
        Broadcast::Message { descriptor, .. } => {
            assert_eq!(descriptor.kind(), MessageKind::PubBulk);
            descriptor.id
        }
        other => panic!("expected the bulk descriptor first, got {other:?}"),
    };

    match subscriber.recv(Duration::from_secs(5)).expect("bulk follows") {
        Broadcast::Bulk(bulk) => {
            assert_eq!(bulk.id, descriptor_id);
            assert_eq!(&bulk.payload[..], SIM_BULK_PAYLOAD);
        }
        other => panic!("expected the bulk frame second, got {other:?}"),
    }
}

#[test]
fn bulk_broadcast_pairs_stay_adjacent_across_stores() {
    let _proxy = start_proxy_with_stores(&["kpfguide", "deimot"], 19431, 19432);
    let first = client(19431);
    let second = client(19431);
    wait_until_serving(&first, "kpfguide");
    wait_until_serving(&second, "deimot");

    let subscriber =
        SubscribeClient::connect("tcp://127.0.0.1:19432").expect("subscriber connects");
    subscriber.subscribe_all().expect("subscribe");
    thread::sleep(Duration::from_millis(300));

    // Both workers broadcast descriptor+bulk pairs concurrently; whatever
    // way the stores interleave, each pair must stay adjacent.
    const WRITES: u32 = 30;
    let hammer = |client: RequestClient, store: &'static str| {
        thread::spawn(move || {
            for i in 0..WRITES {
                client
                    .write(&format!("{store}.LASTIMAGE"), json!([i]))
                    .expect("write completes");
            }
        })
    };
    let kpf = hammer(first, "kpfguide");
    let dei = hammer(second, "deimot");
    kpf.join().expect("first writer finishes");
    dei.join().expect("second writer finishes");

    let mut frames = Vec::new();
    while let Ok(frame) = subscriber.recv_raw(Duration::from_secs(2)) {
        frames.push(frame);
        if frames.len() == (2 * WRITES * 2) as usize {
            break;
        }
    }

    let mut descriptors = 0;
    let mut index = 0;
    while index < frames.len() {
        match Broadcast::parse(&frames[index]).expect("broadcast parses") {
            Broadcast::Message { descriptor, .. }
                if descriptor.kind() == MessageKind::PubBulk =>
            {
                descriptors += 1;
                let next = frames
                    .get(index + 1)
                    .unwrap_or_else(|| panic!("descriptor {index} has no following frame"));
                match Broadcast::parse(next).expect("continuation parses") {
                    Broadcast::Bulk(bulk) => {
                        assert_eq!(Some(bulk.name.as_str()), descriptor.name.as_deref());
                        assert_eq!(bulk.id, descriptor.id);
                    }
                    other => panic!("frame after descriptor {index} is {other:?}"),
                }
                index += 2;
            }
            Broadcast::Bulk(_) => panic!("bulk frame at {index} without its descriptor"),
            _ => index += 1,
        }
    }
    assert!(
        descriptors >= WRITES as usize,
        "expected bulk pairs from both stores, saw {descriptors}"
    );
}

#[test]
fn worker_restart_refreshes_the_cache_and_keeps_serving() {
    let _proxy = start_proxy("kpfguide", 19421, 19422);
    let client = client(19421);
    wait_until_serving(&client, "kpfguide");

    // The worker ACKs this read, then exits before replying.
    let poison = ClientRequest::read("kpfguide.EXITNOW").with_id(TransactionId::new(0x99));
    match client.request(&poison) {
        Err(ClientError::Timeout(_)) => {}
        other => panic!("expected the poisoned read to time out, got {other:?}"),
    }

    // ID and CONFIG keep answering from the cached block during the gap.
    let reply = client.config("kpfguide").expect("CONFIG still answered");
    assert!(reply.response.error.is_none());

    // The supervisor respawns the worker and READs come back.
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        if let Ok(reply) = client.read("kpfguide.DISP2MSG") {
            if reply.response.error.is_none() {
                break;
            }
        }
        assert!(
            Instant::now() < deadline,
            "worker never came back after the restart"
        );
        thread::sleep(Duration::from_millis(200));
    }
}
