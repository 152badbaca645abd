use std::net::SocketAddr;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::codec::{Destination, MAX_FORWARDING_BATCH_SIZE};
use crate::discovery::normalize_address;
use crate::event::{EventType, IdentificationKeys, UnknownEventType};
use crate::forwarder::ForwarderSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:4994")]
    pub address: SocketAddr,

    /// Address advertised to peers, defaults to `address`.
    pub local_address: Option<String>,

    #[envconfig(default = "false")]
    pub export_prometheus: bool,

    #[envconfig(default = "false")]
    pub print_sink: bool,

    #[envconfig(from = "REQUEST_TIMEOUT_MS", default = "10000")]
    pub request_timeout: EnvMsDuration,

    #[envconfig(from = "CLIENT_TIMEOUT_MS", default = "60000")]
    pub client_timeout: EnvMsDuration,

    #[envconfig(default = "200")]
    pub client_thread_count: usize,

    #[envconfig(default = "512")]
    pub buffer_size: usize,

    #[envconfig(default = "48")]
    pub batch_size: usize,

    #[envconfig(from = "BATCH_DELAY_MS", default = "3000")]
    pub batch_delay: EnvMsDuration,

    #[envconfig(from = "LOCAL_WRITE_TIMEOUT_MS", default = "1000")]
    pub local_write_timeout: EnvMsDuration,

    #[envconfig(from = "FAILED_FORWARDING_REQUESTS_LOCAL_WRITE_TIMEOUT_MS", default = "500")]
    pub failed_forwarding_requests_local_write_timeout: EnvMsDuration,

    #[envconfig(default = "1500")]
    pub forwarding_batch_size: usize,

    #[envconfig(default = "16777216")]
    pub max_request_bytes: usize,

    #[envconfig(default = "128")]
    pub virtual_nodes: usize,

    #[envconfig(default = "local_node")]
    pub discovery_mode: DiscoveryMode,

    #[envconfig(default = "")]
    pub static_endpoints: CommaSeparated,

    pub domain_name: Option<String>,

    #[envconfig(from = "DNS_REFRESH_INTERVAL_MS", default = "10000")]
    pub dns_refresh_interval: EnvMsDuration,

    #[envconfig(default = "true")]
    pub binary_codec: bool,

    #[envconfig(default = "EVENT,LOG,SPAN,METRIC,DOCUMENT")]
    pub allowed_event_types: CommaSeparated,

    #[envconfig(default = "")]
    pub destinations: CommaSeparated,

    #[envconfig(default = "trace_id")]
    pub identification_keys: CommaSeparated,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("forwarding batch size must be between 1 and {max}, got {value}")]
    ForwardingBatchSize { value: usize, max: usize },
    #[error("static discovery requires STATIC_ENDPOINTS")]
    MissingStaticEndpoints,
    #[error("dns discovery requires DOMAIN_NAME")]
    MissingDomainName,
    #[error(transparent)]
    UnknownEventType(#[from] UnknownEventType),
    #[error("invalid destination {0:?}, expected pipeline:plugin")]
    InvalidDestination(String),
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("BUFFER_SIZE", self.buffer_size),
            ("BATCH_SIZE", self.batch_size),
            ("CLIENT_THREAD_COUNT", self.client_thread_count),
            ("VIRTUAL_NODES", self.virtual_nodes),
            ("MAX_REQUEST_BYTES", self.max_request_bytes),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        if !(1..=MAX_FORWARDING_BATCH_SIZE).contains(&self.forwarding_batch_size) {
            return Err(ConfigError::ForwardingBatchSize {
                value: self.forwarding_batch_size,
                max: MAX_FORWARDING_BATCH_SIZE,
            });
        }

        match self.discovery_mode {
            DiscoveryMode::Static if self.static_endpoints.is_empty() => {
                return Err(ConfigError::MissingStaticEndpoints)
            }
            DiscoveryMode::Dns if self.domain_name.as_deref().unwrap_or("").is_empty() => {
                return Err(ConfigError::MissingDomainName)
            }
            _ => {}
        }

        self.allowed_event_types()?;
        self.destinations()?;
        Ok(())
    }

    /// The `host:port` this node is known as on the ring.
    pub fn advertised_address(&self, port: u16) -> String {
        match &self.local_address {
            Some(address) if !address.trim().is_empty() => normalize_address(address, port),
            _ => SocketAddr::new(self.address.ip(), port).to_string(),
        }
    }

    pub fn static_peers(&self, port: u16) -> Vec<String> {
        self.static_endpoints
            .iter()
            .map(|endpoint| normalize_address(endpoint, port))
            .collect()
    }

    pub fn allowed_event_types(&self) -> Result<Vec<EventType>, ConfigError> {
        let allowed = self
            .allowed_event_types
            .iter()
            .map(|name| name.parse::<EventType>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(allowed)
    }

    pub fn destinations(&self) -> Result<Vec<Destination>, ConfigError> {
        self.destinations
            .iter()
            .map(|pair| match pair.split_once(':') {
                Some((pipeline, plugin)) if !pipeline.is_empty() && !plugin.is_empty() => {
                    Ok(Destination::new(pipeline, plugin))
                }
                _ => Err(ConfigError::InvalidDestination(pair.to_owned())),
            })
            .collect()
    }

    pub fn identification_keys(&self) -> IdentificationKeys {
        IdentificationKeys::new(self.identification_keys.iter())
    }

    pub fn forwarder_settings(&self) -> ForwarderSettings {
        ForwarderSettings {
            local_write_timeout: self.local_write_timeout.0,
            failed_forwarding_write_timeout: self.failed_forwarding_requests_local_write_timeout.0,
            forwarding_batch_size: self.forwarding_batch_size,
            batch_size: self.batch_size,
            batch_delay: self.batch_delay.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    LocalNode,
    Static,
    Dns,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseDiscoveryModeError(String);

impl std::fmt::Display for ParseDiscoveryModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown discovery mode {:?}", self.0)
    }
}

impl FromStr for DiscoveryMode {
    type Err = ParseDiscoveryModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local_node" => Ok(DiscoveryMode::LocalNode),
            "static" => Ok(DiscoveryMode::Static),
            "dns" => Ok(DiscoveryMode::Dns),
            _ => Err(ParseDiscoveryModeError(s.to_owned())),
        }
    }
}

/// A comma separated list; blank entries are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaSeparated(pub Vec<String>);

impl CommaSeparated {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for CommaSeparated {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(
            s.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_owned)
                .collect(),
        ))
    }
}
