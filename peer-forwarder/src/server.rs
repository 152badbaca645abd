use std::future::Future;
use std::sync::Arc;

use metrics_exporter_prometheus::BuildError;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::buffer::ReceiveBufferRegistry;
use crate::client::HttpForwardingClient;
use crate::codec::{BinaryCodec, ForwardingCodec, JsonCodec};
use crate::config::{Config, ConfigError, DiscoveryMode};
use crate::discovery::{
    DnsPeerListProvider, LocalNodeProvider, PeerListProvider, StaticPeerListProvider,
};
use crate::forwarder::{PeerForwarder, PeerForwarderError, PeerForwarderProvider};
use crate::ring::SharedHashRing;
use crate::router;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] BuildError),
    #[error(transparent)]
    Register(#[from] PeerForwarderError),
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything `serve` wires together, exposed so embedders can reach the forwarders.
pub struct Node {
    pub local_address: String,
    pub ring: Arc<SharedHashRing>,
    pub provider: PeerForwarderProvider,
    pub forwarders: Vec<Arc<PeerForwarder>>,
    pub router: axum::Router,
}

/// Builds discovery, ring, codec, client, buffers and router for `config`. Background work
/// (dns refreshes, retrying local writes) stops when `shutdown` is cancelled.
pub async fn build(
    config: &Config,
    port: u16,
    shutdown: &CancellationToken,
) -> Result<Node, ServeError> {
    config.validate()?;
    if config.forwarding_batch_size > config.buffer_size {
        warn!(
            forwarding_batch_size = config.forwarding_batch_size,
            buffer_size = config.buffer_size,
            "forwarding requests are capped at the buffer size"
        );
    }

    let local_address = config.advertised_address(port);
    let peers: Arc<dyn PeerListProvider> = match config.discovery_mode {
        DiscoveryMode::LocalNode => Arc::new(LocalNodeProvider::new(local_address.clone())),
        DiscoveryMode::Static => Arc::new(StaticPeerListProvider::new(config.static_peers(port))),
        DiscoveryMode::Dns => {
            let dns = Arc::new(DnsPeerListProvider::new(
                config.domain_name.clone().unwrap_or_default(),
                port,
                config.dns_refresh_interval.0,
            ));
            dns.refresh().await;
            tokio::spawn(dns.clone().run(shutdown.clone()));
            dns
        }
    };
    let ring = SharedHashRing::attach(peers.as_ref(), config.virtual_nodes);

    let codec: Arc<dyn ForwardingCodec> = if config.binary_codec {
        Arc::new(BinaryCodec::new(
            config.allowed_event_types()?,
            config.max_request_bytes as u64,
        ))
    } else {
        Arc::new(JsonCodec)
    };

    let client = Arc::new(HttpForwardingClient::new(
        codec.clone(),
        config.client_thread_count,
        config.client_timeout.0,
    ));
    let registry = Arc::new(ReceiveBufferRegistry::new(config.buffer_size));
    let provider = PeerForwarderProvider::new(
        ring.clone(),
        client,
        registry.clone(),
        local_address.clone(),
        config.forwarder_settings(),
        shutdown.clone(),
    );

    let keys = config.identification_keys();
    let forwarders = config
        .destinations()?
        .into_iter()
        .map(|destination| {
            provider.register(
                &destination.pipeline_name,
                &destination.plugin_id,
                keys.clone(),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let router = router::router(
        router::State {
            registry,
            codec,
            ring: ring.clone(),
            request_timeout: config.request_timeout.0,
        },
        config.max_request_bytes,
        config.export_prometheus,
    )?;

    info!(
        %local_address,
        mode = ?config.discovery_mode,
        peers = ?ring.snapshot().peers(),
        "peer forwarder node ready"
    );

    Ok(Node {
        local_address,
        ring,
        provider,
        forwarders,
        router,
    })
}

/// Logs every record that reaches a forwarder's buffer. Stands in for a pipeline when the
/// node runs on its own.
async fn print_records(forwarder: Arc<PeerForwarder>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            records = forwarder.receive_records() => {
                metrics::counter!("peer_forwarder_printed_records_total").increment(records.len() as u64);
                for record in records {
                    info!(destination = %forwarder.destination(), event = ?record.event(), "record");
                }
            }
        }
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let port = listener.local_addr()?.port();
    let node = build(&config, port, &token).await?;

    let mut drains = JoinSet::new();
    if config.print_sink {
        for forwarder in &node.forwarders {
            drains.spawn(print_records(forwarder.clone(), token.clone()));
        }
    }

    info!("listening on {:?}", listener.local_addr()?);
    let stop = token.clone();
    let result = axum::serve(listener, node.router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            stop.cancel();
        })
        .await;

    token.cancel();
    while drains.join_next().await.is_some() {}

    result?;
    Ok(())
}
