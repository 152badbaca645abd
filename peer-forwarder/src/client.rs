use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use metrics::{Counter, Histogram};
use reqwest::header;
use thiserror::Error;
use tokio::sync::{OnceCell, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::{EncodeError, ForwardingBatch, ForwardingCodec};
use crate::router::FORWARD_PATH;

#[derive(Error, Debug)]
pub enum ForwardingError {
    #[error("failed to serialize batch for {target}: {source}")]
    Serialization {
        target: String,
        #[source]
        source: EncodeError,
    },
    #[error("failed to build http client for {target}: {source}")]
    ClientBuild {
        target: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {target} failed: {source}")]
    Request {
        target: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{target} responded with status {status}")]
    Status { target: String, status: u16 },
    #[error("client pool is closed")]
    PoolClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct SendOutcome {
    pub latency: Duration,
}

/// Delivers one batch to one peer. Implementations do not retry: a failed send is handed
/// back to the caller, which decides what happens to the records.
#[async_trait]
pub trait ForwardingTransport: Send + Sync {
    async fn send(
        &self,
        batch: &ForwardingBatch,
        target: &str,
    ) -> Result<SendOutcome, ForwardingError>;
}

struct ClientMetrics {
    requests: Counter,
    failures: Counter,
    latency: Histogram,
}

impl ClientMetrics {
    fn new(target: &str) -> Self {
        let labels = [("target", target.to_owned())];
        Self {
            requests: metrics::counter!("peer_forwarder_client_requests_total", &labels),
            failures: metrics::counter!("peer_forwarder_client_request_failures_total", &labels),
            latency: metrics::histogram!("peer_forwarder_client_request_latency_seconds", &labels),
        }
    }
}

/// State kept per peer address. The HTTP client is only built on the first send to that
/// peer, and exactly once even when several sends race for it.
struct PeerClient {
    client: OnceCell<reqwest::Client>,
    metrics: ClientMetrics,
}

pub struct HttpForwardingClient {
    codec: Arc<dyn ForwardingCodec>,
    peers: DashMap<String, Arc<PeerClient>>,
    pool: Semaphore,
    request_timeout: Duration,
}

impl HttpForwardingClient {
    /// `max_concurrent_requests` bounds how many sends are in flight at once across all
    /// peers; further sends wait for a slot.
    pub fn new(
        codec: Arc<dyn ForwardingCodec>,
        max_concurrent_requests: usize,
        request_timeout: Duration,
    ) -> Self {
        Self {
            codec,
            peers: DashMap::new(),
            pool: Semaphore::new(max_concurrent_requests.clamp(1, Semaphore::MAX_PERMITS)),
            request_timeout,
        }
    }

    fn peer(&self, target: &str) -> Arc<PeerClient> {
        if let Some(peer) = self.peers.get(target) {
            return peer.value().clone();
        }

        self.peers
            .entry(target.to_owned())
            .or_insert_with(|| {
                Arc::new(PeerClient {
                    client: OnceCell::new(),
                    metrics: ClientMetrics::new(target),
                })
            })
            .clone()
    }

    async fn http_client(
        &self,
        peer: &PeerClient,
        target: &str,
    ) -> Result<reqwest::Client, ForwardingError> {
        let client = peer
            .client
            .get_or_try_init(|| async {
                let mut headers = header::HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static(self.codec.content_type()),
                );

                debug!(peer = target, "creating http client for peer");
                reqwest::Client::builder()
                    .default_headers(headers)
                    .user_agent("peer-forwarder")
                    .timeout(self.request_timeout)
                    .build()
            })
            .await
            .map_err(|source| ForwardingError::ClientBuild {
                target: target.to_owned(),
                source,
            })?;

        Ok(client.clone())
    }

    async fn post(
        &self,
        peer: &PeerClient,
        batch: &ForwardingBatch,
        target: &str,
    ) -> Result<(), ForwardingError> {
        let body = self
            .codec
            .encode(batch)
            .map_err(|source| ForwardingError::Serialization {
                target: target.to_owned(),
                source,
            })?;
        let client = self.http_client(peer, target).await?;

        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ForwardingError::PoolClosed)?;

        let response = client
            .post(format!("http://{target}{FORWARD_PATH}"))
            .body(body)
            .send()
            .await
            .map_err(|source| ForwardingError::Request {
                target: target.to_owned(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ForwardingError::Status {
                target: target.to_owned(),
                status: status.as_u16(),
            })
        }
    }

    #[cfg(test)]
    fn known_peers(&self) -> usize {
        self.peers.len()
    }
}

#[async_trait]
impl ForwardingTransport for HttpForwardingClient {
    async fn send(
        &self,
        batch: &ForwardingBatch,
        target: &str,
    ) -> Result<SendOutcome, ForwardingError> {
        let peer = self.peer(target);
        let start = Instant::now();

        let result = self.post(&peer, batch, target).await;

        let latency = start.elapsed();
        peer.metrics.requests.increment(1);
        peer.metrics.latency.record(latency.as_secs_f64());

        match result {
            Ok(()) => Ok(SendOutcome { latency }),
            Err(error) => {
                peer.metrics.failures.increment(1);
                warn!(
                    peer = target,
                    destination = %batch.destination,
                    records = batch.records.len(),
                    %error,
                    "failed to forward batch"
                );
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;
    use crate::codec::{BinaryCodec, Destination, JsonCodec};
    use crate::event::{Event, EventType, Record};
    use crate::metrics::test_support::counter_value;

    fn batch(records: usize) -> ForwardingBatch {
        ForwardingBatch::new(
            Destination::new("traces", "service-map"),
            (0..records)
                .map(|n| {
                    Record::new(Event::new(
                        EventType::Span,
                        serde_json::json!({"trace_id": format!("T{n}")}),
                    ))
                })
                .collect(),
        )
    }

    fn client(codec: Arc<dyn ForwardingCodec>) -> HttpForwardingClient {
        // Counter handles bind to the recorder installed when they are created.
        crate::metrics::test_support::snapshotter();
        HttpForwardingClient::new(codec, 4, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn posts_encoded_batch_to_the_forward_endpoint() {
        let server = MockServer::start_async().await;
        let codec = Arc::new(JsonCodec);
        let sent = batch(3);
        let expected_body = codec.encode(&sent).unwrap();
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(FORWARD_PATH)
                    .header("content-type", "application/json")
                    .body(String::from_utf8(expected_body).unwrap());
                then.status(200);
            })
            .await;

        let target = server.address().to_string();
        let client = client(codec);
        client.send(&sent, &target).await.unwrap();

        mock.assert_hits_async(1).await;
        assert_eq!(
            counter_value("peer_forwarder_client_requests_total", &[("target", &target)]),
            1
        );
        assert_eq!(
            counter_value("peer_forwarder_client_request_failures_total", &[("target", &target)]),
            0
        );
    }

    #[tokio::test]
    async fn non_success_status_is_a_failure() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(FORWARD_PATH);
                then.status(503).body("buffer timed out");
            })
            .await;

        let target = server.address().to_string();
        let client = client(Arc::new(BinaryCodec::default()));
        let result = client.send(&batch(2), &target).await;

        assert!(matches!(result, Err(ForwardingError::Status { status: 503, .. })));
        // No internal retries.
        mock.assert_hits_async(1).await;
        assert_eq!(
            counter_value("peer_forwarder_client_request_failures_total", &[("target", &target)]),
            1
        );
        assert_eq!(
            counter_value("peer_forwarder_client_requests_total", &[("target", &target)]),
            1
        );
    }

    #[tokio::test]
    async fn unreachable_peer_is_a_request_failure() {
        // Bind then drop a listener to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = client(Arc::new(JsonCodec));
        let result = client.send(&batch(1), &target).await;

        assert!(matches!(result, Err(ForwardingError::Request { .. })));
    }

    #[tokio::test]
    async fn oversized_batches_fail_to_serialize() {
        let client = client(Arc::new(JsonCodec));
        let result = client
            .send(&batch(crate::codec::MAX_FORWARDING_BATCH_SIZE + 1), "127.0.0.1:1")
            .await;

        assert!(matches!(result, Err(ForwardingError::Serialization { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_use_shares_one_client_per_peer() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path(FORWARD_PATH);
                then.status(200);
            })
            .await;
        let target = server.address().to_string();
        let client = Arc::new(client(Arc::new(JsonCodec)));

        let sends: Vec<_> = (0..16)
            .map(|_| {
                let client = client.clone();
                let target = target.clone();
                tokio::spawn(async move { client.send(&batch(1), &target).await })
            })
            .collect();
        for send in futures::future::join_all(sends).await {
            send.unwrap().unwrap();
        }

        mock.assert_hits_async(16).await;
        assert_eq!(client.known_peers(), 1);
        assert!(client.peer(&target).client.initialized());
    }
}
