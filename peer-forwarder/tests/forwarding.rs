use std::collections::HashMap;
use std::time::Duration;

use envconfig::Envconfig;
use reqwest::StatusCode;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use peer_forwarder::config::Config;
use peer_forwarder::event::{Event, EventType, IdentificationKeys, Record};
use peer_forwarder::forwarder::PeerForwarder;
use peer_forwarder::router::FORWARD_PATH;
use peer_forwarder::server::{build, Node};

fn config(peers: &[String]) -> Config {
    let env: HashMap<String, String> = [
        ("DISCOVERY_MODE", "static".to_string()),
        ("STATIC_ENDPOINTS", peers.join(",")),
        ("DESTINATIONS", "traces:service-map".to_string()),
        ("BATCH_DELAY_MS", "50".to_string()),
        ("CLIENT_TIMEOUT_MS", "2000".to_string()),
        ("FAILED_FORWARDING_REQUESTS_LOCAL_WRITE_TIMEOUT_MS", "500".to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value))
    .collect();

    Config::init_from_hashmap(&env).expect("valid config")
}

async fn start(listener: TcpListener, peers: &[String], shutdown: &CancellationToken) -> Node {
    let port = listener.local_addr().unwrap().port();
    let node = build(&config(peers), port, shutdown).await.expect("node builds");

    let router = node.router.clone();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await
            .unwrap();
    });

    node
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    (listener, address)
}

fn spans(count: usize) -> Vec<Record> {
    (0..count)
        .map(|n| Record::new(Event::new(EventType::Span, json!({ "trace_id": format!("trace-{n}") }))))
        .collect()
}

async fn drain(forwarder: &PeerForwarder) -> Vec<Record> {
    let mut received = Vec::new();
    loop {
        let records = forwarder.receive_records().await;
        if records.is_empty() {
            return received;
        }
        received.extend(records);
    }
}

fn trace_ids(records: &[Record]) -> Vec<String> {
    let mut ids: Vec<String> = records
        .iter()
        .map(|record| record.event().data()["trace_id"].as_str().unwrap().to_string())
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn records_reach_the_node_that_owns_their_trace() {
    let shutdown = CancellationToken::new();
    let (first_listener, first) = bind().await;
    let (second_listener, second) = bind().await;
    let peers = vec![first.clone(), second.clone()];

    let sender = start(first_listener, &peers, &shutdown).await;
    let receiver = start(second_listener, &peers, &shutdown).await;

    let records = spans(200);
    let keys = IdentificationKeys::new(["trace_id"]);
    let ring = sender.ring.snapshot();
    let (expected_local, expected_remote): (Vec<Record>, Vec<Record>) =
        records.iter().cloned().partition(|record| {
            let key = keys.hash_key(record.event()).unwrap();
            ring.resolve(&key).unwrap() == first
        });
    assert!(!expected_local.is_empty());
    assert!(!expected_remote.is_empty());

    let handled = sender.forwarders[0]
        .forward_records(records)
        .await
        .expect("forwarding succeeds");

    assert_eq!(trace_ids(&handled), trace_ids(&expected_local));
    assert_eq!(
        trace_ids(&drain(&sender.forwarders[0]).await),
        trace_ids(&expected_local)
    );
    assert_eq!(
        trace_ids(&drain(&receiver.forwarders[0]).await),
        trace_ids(&expected_remote)
    );

    shutdown.cancel();
}

#[tokio::test]
async fn unreachable_peer_falls_back_to_the_local_buffer() {
    let shutdown = CancellationToken::new();
    let (listener, address) = bind().await;
    // Bound then dropped so nothing listens on the port.
    let (dead_listener, dead) = bind().await;
    drop(dead_listener);

    let node = start(listener, &[address, dead], &shutdown).await;
    let records = spans(100);

    let handled = node.forwarders[0]
        .forward_records(records.clone())
        .await
        .expect("fallback succeeds");

    assert_eq!(trace_ids(&handled), trace_ids(&records));
    assert_eq!(
        trace_ids(&drain(&node.forwarders[0]).await),
        trace_ids(&records)
    );

    shutdown.cancel();
}

#[tokio::test]
async fn undecodable_requests_are_rejected() {
    let shutdown = CancellationToken::new();
    let (listener, address) = bind().await;
    let _node = start(listener, &[address.clone()], &shutdown).await;

    let response = reqwest::Client::new()
        .post(format!("http://{address}{FORWARD_PATH}"))
        .body("definitely not a batch")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let readiness = reqwest::get(format!("http://{address}/_readiness"))
        .await
        .unwrap();
    assert_eq!(readiness.status(), StatusCode::OK);

    shutdown.cancel();
}
