use std::fmt;

use thiserror::Error;

use crate::event::Record;

pub mod binary;
pub mod json;

pub use binary::BinaryCodec;
pub use json::JsonCodec;

/// Upper bound of records in one forwarding request, on both the sending and receiving side.
pub const MAX_FORWARDING_BATCH_SIZE: usize = 15_000;

/// The pipeline and plugin a batch is bound for on the receiving node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub pipeline_name: String,
    pub plugin_id: String,
}

impl Destination {
    pub fn new(pipeline_name: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            plugin_id: plugin_id.into(),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pipeline_name, self.plugin_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForwardingBatch {
    pub destination: Destination,
    pub records: Vec<Record>,
}

impl ForwardingBatch {
    pub fn new(destination: Destination, records: Vec<Record>) -> Self {
        Self {
            destination,
            records,
        }
    }
}

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("batch holds {count} records, at most {max} can be forwarded at once")]
    TooManyRecords { count: usize, max: usize },
    #[error("failed to encode batch as json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode batch as binary: {0}")]
    Binary(#[from] bincode::Error),
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload holds {count} records, at most {max} are accepted")]
    TooManyRecords { count: usize, max: usize },
    #[error("payload holds disallowed event types: {}", .0.join(", "))]
    Rejected(Vec<String>),
}

/// Turns batches into request bodies and back. Senders and receivers of a fleet must use
/// the same codec.
pub trait ForwardingCodec: Send + Sync {
    fn content_type(&self) -> &'static str;
    fn encode(&self, batch: &ForwardingBatch) -> Result<Vec<u8>, EncodeError>;
    fn decode(&self, payload: &[u8]) -> Result<ForwardingBatch, DecodeError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use serde_json::json;
    use time::macros::datetime;

    use super::*;
    use crate::event::{Event, EventType};

    pub fn sample_batch() -> ForwardingBatch {
        let span = Event::new(
            EventType::Span,
            json!({
                "trace_id": "T1",
                "name": "checkout",
                "duration": 12.5,
                "count": -3,
                "big": u64::MAX,
                "tags": ["a", null, true],
                "resource": {"service": "cart", "pod": {"id": 7}},
            }),
        )
        .with_time_received(datetime!(2024-03-01 12:30:45.123456789 UTC))
        .with_attributes(HashMap::from([
            ("source".to_string(), json!("otel")),
            ("retries".to_string(), json!(2)),
        ]));
        let log = Event::new(EventType::Log, json!("plain text line"))
            .with_time_received(datetime!(2024-03-01 12:30:46 UTC));

        ForwardingBatch::new(
            Destination::new("traces", "service-map"),
            vec![span.into(), log.into()],
        )
    }

    #[test]
    fn destination_displays_pipeline_and_plugin() {
        assert_eq!(
            Destination::new("traces", "service-map").to_string(),
            "traces/service-map"
        );
    }
}
