use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::Counter;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{Buffer, BufferError, ReceiveBuffer, ReceiveBufferRegistry};
use crate::client::ForwardingTransport;
use crate::codec::{Destination, ForwardingBatch, MAX_FORWARDING_BATCH_SIZE};
use crate::event::{HashKey, IdentificationKeys, Record};
use crate::ring::SharedHashRing;

#[derive(Error, Debug, PartialEq)]
pub enum PeerForwarderError {
    /// `buffered` holds the records of the same call that did reach the local buffer, so a
    /// caller retrying the batch can leave them out.
    #[error("failed to write {records} records that could not be forwarded to the local buffer: {source}")]
    FallbackWriteFailed {
        records: usize,
        buffered: Vec<Record>,
        #[source]
        source: BufferError,
    },
    #[error("shut down before {records} local records could be buffered")]
    ShutdownDuringLocalWrite { records: usize },
    #[error("failed to write local records: {0}")]
    LocalWrite(#[source] BufferError),
    #[error("a forwarder is already registered for {0}")]
    AlreadyRegistered(Destination),
}

#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    /// Bound of one attempt of the local write; attempts repeat until success or shutdown.
    pub local_write_timeout: Duration,
    /// Bound of the single local write for records whose forwarding failed.
    pub failed_forwarding_write_timeout: Duration,
    /// Most records sent in one request.
    pub forwarding_batch_size: usize,
    /// Most records returned by one `receive_records` call.
    pub batch_size: usize,
    /// Longest `receive_records` waits for a first record.
    pub batch_delay: Duration,
}

impl Default for ForwarderSettings {
    fn default() -> Self {
        Self {
            local_write_timeout: Duration::from_millis(1000),
            failed_forwarding_write_timeout: Duration::from_millis(500),
            forwarding_batch_size: 1500,
            batch_size: 48,
            batch_delay: Duration::from_millis(3000),
        }
    }
}

struct ForwarderMetrics {
    to_be_processed_locally: Counter,
    actually_processed_locally: Counter,
    to_be_forwarded: Counter,
    successfully_forwarded: Counter,
    failed_forwarding: Counter,
    missing_identification_keys: Counter,
    requests_successful: Counter,
    requests_failed: Counter,
    local_write_retries: Counter,
}

impl ForwarderMetrics {
    fn new(destination: &Destination) -> Self {
        let labels = [
            ("pipeline", destination.pipeline_name.clone()),
            ("plugin", destination.plugin_id.clone()),
        ];
        Self {
            to_be_processed_locally: metrics::counter!(
                "peer_forwarder_records_to_be_processed_locally_total",
                &labels
            ),
            actually_processed_locally: metrics::counter!(
                "peer_forwarder_records_actually_processed_locally_total",
                &labels
            ),
            to_be_forwarded: metrics::counter!(
                "peer_forwarder_records_to_be_forwarded_total",
                &labels
            ),
            successfully_forwarded: metrics::counter!(
                "peer_forwarder_records_successfully_forwarded_total",
                &labels
            ),
            failed_forwarding: metrics::counter!(
                "peer_forwarder_records_failed_forwarding_total",
                &labels
            ),
            missing_identification_keys: metrics::counter!(
                "peer_forwarder_records_missing_identification_keys_total",
                &labels
            ),
            requests_successful: metrics::counter!(
                "peer_forwarder_requests_successful_total",
                &labels
            ),
            requests_failed: metrics::counter!("peer_forwarder_requests_failed_total", &labels),
            local_write_retries: metrics::counter!(
                "peer_forwarder_local_write_retries_total",
                &labels
            ),
        }
    }
}

/// Records of one `forward_records` call split by owner.
#[derive(Debug, Default)]
pub struct Partition {
    pub local: Vec<Record>,
    pub remote: HashMap<String, Vec<Record>>,
}

/// Routes the records of one (pipeline, plugin) destination to the node that owns their
/// identification key and feeds this node's receive buffer.
pub struct PeerForwarder {
    destination: Destination,
    identification_keys: IdentificationKeys,
    local_address: String,
    ring: Arc<SharedHashRing>,
    transport: Arc<dyn ForwardingTransport>,
    buffer: Arc<ReceiveBuffer>,
    settings: ForwarderSettings,
    shutdown: CancellationToken,
    metrics: ForwarderMetrics,
}

impl PeerForwarder {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        destination: Destination,
        identification_keys: IdentificationKeys,
        local_address: String,
        ring: Arc<SharedHashRing>,
        transport: Arc<dyn ForwardingTransport>,
        buffer: Arc<ReceiveBuffer>,
        settings: ForwarderSettings,
        shutdown: CancellationToken,
    ) -> Self {
        let metrics = ForwarderMetrics::new(&destination);
        Self {
            destination,
            identification_keys,
            local_address,
            ring,
            transport,
            buffer,
            settings,
            shutdown,
            metrics,
        }
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn buffer(&self) -> &Arc<ReceiveBuffer> {
        &self.buffer
    }

    /// Splits `records` by owning peer against a single ring snapshot. Records owned by this
    /// node, and every record while no peer is known, land in the local group.
    pub fn partition(&self, records: Vec<Record>) -> Partition {
        let ring = self.ring.snapshot();
        let mut partition = Partition::default();

        for record in records {
            let key = match self.identification_keys.hash_key(record.event()) {
                Some(key) => key,
                None => {
                    self.metrics.missing_identification_keys.increment(1);
                    HashKey::empty()
                }
            };

            match ring.resolve(&key) {
                Ok(peer) if peer != self.local_address => partition
                    .remote
                    .entry(peer.to_owned())
                    .or_default()
                    .push(record),
                Ok(_) => partition.local.push(record),
                Err(error) => {
                    debug!(%error, "routing record locally");
                    partition.local.push(record);
                }
            }
        }

        partition
    }

    /// Buffers the records this node owns and sends the rest to their owners. Returns every
    /// record that ended up in the local buffer: the local group plus the records whose
    /// forwarding failed. Remote buckets are all attempted even if a fallback write fails;
    /// the first such failure is returned afterwards.
    pub async fn forward_records(
        &self,
        records: Vec<Record>,
    ) -> Result<Vec<Record>, PeerForwarderError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let Partition { local, remote } = self.partition(records);
        self.metrics.to_be_processed_locally.increment(local.len() as u64);
        self.metrics
            .to_be_forwarded
            .increment(remote.values().map(Vec::len).sum::<usize>() as u64);

        let (local_result, failed) =
            tokio::join!(self.write_local(local), self.forward_remote(remote));

        let mut first_error = None;
        let mut handled = match local_result {
            Ok(records) => records,
            Err(error) => {
                first_error = Some(error);
                Vec::new()
            }
        };

        for (target, records) in failed {
            warn!(
                peer = %target,
                destination = %self.destination,
                records = records.len(),
                "forwarding failed, processing records locally"
            );
            match self.write_fallback(&records).await {
                Ok(()) => handled.extend(records),
                Err(error) => {
                    error!(
                        peer = %target,
                        destination = %self.destination,
                        %error,
                        "failed to write records that could not be forwarded to the local buffer"
                    );
                    first_error.get_or_insert(error);
                }
            }
        }

        self.metrics
            .actually_processed_locally
            .increment(handled.len() as u64);

        match first_error {
            Some(PeerForwarderError::FallbackWriteFailed {
                records, source, ..
            }) => Err(PeerForwarderError::FallbackWriteFailed {
                records,
                buffered: handled,
                source,
            }),
            Some(error) => Err(error),
            None => Ok(handled),
        }
    }

    /// Writes the local group, retrying timed out attempts until they succeed or the
    /// forwarder is shut down.
    async fn write_local(&self, records: Vec<Record>) -> Result<Vec<Record>, PeerForwarderError> {
        let capacity = self.buffer.capacity();

        for (index, chunk) in records.chunks(capacity).enumerate() {
            loop {
                let attempt = self
                    .buffer
                    .write_all(chunk.to_vec(), self.settings.local_write_timeout);
                let result = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        let pending = records.len() - index * capacity;
                        warn!(destination = %self.destination, pending, "shutdown interrupted local write");
                        return Err(PeerForwarderError::ShutdownDuringLocalWrite { records: pending });
                    }
                    result = attempt => result,
                };

                match result {
                    Ok(()) => break,
                    Err(BufferError::Timeout(timeout)) => {
                        self.metrics.local_write_retries.increment(1);
                        warn!(
                            destination = %self.destination,
                            records = chunk.len(),
                            ?timeout,
                            "local buffer is full, retrying write"
                        );
                    }
                    Err(error) => return Err(PeerForwarderError::LocalWrite(error)),
                }
            }
        }

        Ok(records)
    }

    /// Sends every remote bucket concurrently, in requests of at most
    /// `forwarding_batch_size` records, and returns the requests that failed.
    ///
    /// Peers admit a request whole or not at all, so requests are also capped at the buffer
    /// capacity, which every node of a fleet shares.
    async fn forward_remote(
        &self,
        remote: HashMap<String, Vec<Record>>,
    ) -> Vec<(String, Vec<Record>)> {
        let batch_size = self
            .settings
            .forwarding_batch_size
            .min(self.buffer.capacity())
            .clamp(1, MAX_FORWARDING_BATCH_SIZE);

        let requests = remote.into_iter().flat_map(|(target, records)| {
            records
                .chunks(batch_size)
                .map(|chunk| (target.clone(), chunk.to_vec()))
                .collect::<Vec<_>>()
        });

        let sends = requests.map(|(target, records)| async move {
            let batch = ForwardingBatch::new(self.destination.clone(), records);
            match self.transport.send(&batch, &target).await {
                Ok(outcome) => {
                    debug!(
                        peer = %target,
                        records = batch.records.len(),
                        latency = ?outcome.latency,
                        "forwarded batch"
                    );
                    self.metrics.requests_successful.increment(1);
                    self.metrics
                        .successfully_forwarded
                        .increment(batch.records.len() as u64);
                    None
                }
                Err(_) => {
                    self.metrics.requests_failed.increment(1);
                    self.metrics
                        .failed_forwarding
                        .increment(batch.records.len() as u64);
                    Some((target, batch.records))
                }
            }
        });

        join_all(sends).await.into_iter().flatten().collect()
    }

    /// One attempt per buffer-sized chunk, bounded by the failed forwarding timeout.
    async fn write_fallback(&self, records: &[Record]) -> Result<(), PeerForwarderError> {
        let capacity = self.buffer.capacity();

        for (index, chunk) in records.chunks(capacity).enumerate() {
            self.buffer
                .write_all(chunk.to_vec(), self.settings.failed_forwarding_write_timeout)
                .await
                .map_err(|source| PeerForwarderError::FallbackWriteFailed {
                    records: records.len() - index * capacity,
                    buffered: Vec::new(),
                    source,
                })?;
        }

        Ok(())
    }

    /// Reads one batch of records, local or forwarded by peers, for this destination and
    /// releases their buffer space.
    pub async fn receive_records(&self) -> Vec<Record> {
        let batch = self
            .buffer
            .read(self.settings.batch_size, self.settings.batch_delay)
            .await;
        self.buffer.checkpoint(batch.checkpoint);
        batch.records
    }
}

/// Owns what the forwarders of one node share and creates one forwarder per destination.
pub struct PeerForwarderProvider {
    ring: Arc<SharedHashRing>,
    transport: Arc<dyn ForwardingTransport>,
    registry: Arc<ReceiveBufferRegistry>,
    local_address: String,
    settings: ForwarderSettings,
    shutdown: CancellationToken,
}

impl PeerForwarderProvider {
    pub fn new(
        ring: Arc<SharedHashRing>,
        transport: Arc<dyn ForwardingTransport>,
        registry: Arc<ReceiveBufferRegistry>,
        local_address: String,
        settings: ForwarderSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            ring,
            transport,
            registry,
            local_address,
            settings,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<ReceiveBufferRegistry> {
        &self.registry
    }

    /// Creates the receive buffer of `pipeline`/`plugin` and the forwarder feeding it.
    pub fn register(
        &self,
        pipeline_name: &str,
        plugin_id: &str,
        identification_keys: IdentificationKeys,
    ) -> Result<Arc<PeerForwarder>, PeerForwarderError> {
        let destination = Destination::new(pipeline_name, plugin_id);
        let Some(buffer) = self.registry.create(&destination) else {
            return Err(PeerForwarderError::AlreadyRegistered(destination));
        };
        info!(
            %destination,
            keys = ?identification_keys,
            capacity = buffer.capacity(),
            "registered peer forwarder"
        );

        Ok(Arc::new(PeerForwarder::new(
            destination,
            identification_keys,
            self.local_address.clone(),
            self.ring.clone(),
            self.transport.clone(),
            buffer,
            self.settings.clone(),
            self.shutdown.clone(),
        )))
    }
}
