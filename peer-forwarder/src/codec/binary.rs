use std::collections::HashSet;

use bincode::Options;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::warn;

use super::{
    DecodeError, Destination, EncodeError, ForwardingBatch, ForwardingCodec,
    MAX_FORWARDING_BATCH_SIZE,
};
use crate::event::{Event, EventType, Record};

#[derive(Debug, Serialize, Deserialize)]
struct BinaryEvent {
    /// Kept as text so that types this node does not know can be named when rejected.
    event_type: String,
    time_received_nanos: i128,
    /// JSON text. Decoding goes through serde_json, whose recursion limit bounds nesting.
    attributes: Vec<u8>,
    data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BinaryBatch {
    pipeline_name: String,
    plugin_id: String,
    events: Vec<BinaryEvent>,
}

/// Compact encoding. Decoding is bounded by a byte limit and only materializes the event
/// types on its allow-list; every other type is logged and fails the whole payload.
#[derive(Debug, Clone)]
pub struct BinaryCodec {
    allowed: HashSet<EventType>,
    max_payload_bytes: u64,
}

impl BinaryCodec {
    pub fn new(allowed: impl IntoIterator<Item = EventType>, max_payload_bytes: u64) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            max_payload_bytes,
        }
    }

    fn options(&self) -> impl Options {
        bincode::DefaultOptions::new().with_limit(self.max_payload_bytes)
    }

    fn allowed_type(&self, name: &str) -> Option<EventType> {
        name.parse::<EventType>()
            .ok()
            .filter(|event_type| self.allowed.contains(event_type))
    }
}

impl Default for BinaryCodec {
    fn default() -> Self {
        Self::new(EventType::ALL, 16 * 1024 * 1024)
    }
}

impl ForwardingCodec for BinaryCodec {
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn encode(&self, batch: &ForwardingBatch) -> Result<Vec<u8>, EncodeError> {
        if batch.records.len() > MAX_FORWARDING_BATCH_SIZE {
            return Err(EncodeError::TooManyRecords {
                count: batch.records.len(),
                max: MAX_FORWARDING_BATCH_SIZE,
            });
        }

        let wire = BinaryBatch {
            pipeline_name: batch.destination.pipeline_name.clone(),
            plugin_id: batch.destination.plugin_id.clone(),
            events: batch
                .records
                .iter()
                .map(|record| {
                    let event = record.event();
                    Ok(BinaryEvent {
                        event_type: event.event_type().as_str().to_owned(),
                        time_received_nanos: event.time_received().unix_timestamp_nanos(),
                        attributes: serde_json::to_vec(event.attributes())?,
                        data: serde_json::to_vec(event.data())?,
                    })
                })
                .collect::<Result<_, EncodeError>>()?,
        };

        Ok(self.options().serialize(&wire)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<ForwardingBatch, DecodeError> {
        let wire: BinaryBatch = self
            .options()
            .deserialize(payload)
            .map_err(|error| DecodeError::Malformed(error.to_string()))?;

        if wire.events.len() > MAX_FORWARDING_BATCH_SIZE {
            return Err(DecodeError::TooManyRecords {
                count: wire.events.len(),
                max: MAX_FORWARDING_BATCH_SIZE,
            });
        }

        let mut rejected: Vec<String> = Vec::new();
        for event in &wire.events {
            if self.allowed_type(&event.event_type).is_none() {
                warn!(
                    event_type = %event.event_type,
                    pipeline = %wire.pipeline_name,
                    "rejected event type during deserialization"
                );
                if !rejected.contains(&event.event_type) {
                    rejected.push(event.event_type.clone());
                }
            }
        }
        if !rejected.is_empty() {
            return Err(DecodeError::Rejected(rejected));
        }

        let mut records = Vec::with_capacity(wire.events.len());
        for event in wire.events {
            let event_type = self
                .allowed_type(&event.event_type)
                .ok_or_else(|| DecodeError::Rejected(vec![event.event_type.clone()]))?;
            let time_received = OffsetDateTime::from_unix_timestamp_nanos(event.time_received_nanos)
                .map_err(|error| DecodeError::Malformed(error.to_string()))?;
            let attributes = serde_json::from_slice(&event.attributes)
                .map_err(|error| DecodeError::Malformed(error.to_string()))?;
            let data: Value = serde_json::from_slice(&event.data)
                .map_err(|error| DecodeError::Malformed(error.to_string()))?;

            records.push(Record::new(
                Event::new(event_type, data)
                    .with_time_received(time_received)
                    .with_attributes(attributes),
            ));
        }

        Ok(ForwardingBatch::new(
            Destination::new(wire.pipeline_name, wire.plugin_id),
            records,
        ))
    }
}
