use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use super::{
    DecodeError, Destination, EncodeError, ForwardingBatch, ForwardingCodec,
    MAX_FORWARDING_BATCH_SIZE,
};
use crate::event::{Event, EventType, Record};

#[derive(Debug, Serialize, Deserialize)]
struct WireEvent {
    event_type: EventType,
    #[serde(with = "time::serde::rfc3339")]
    time_received: OffsetDateTime,
    #[serde(default)]
    attributes: HashMap<String, Value>,
    data: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireBatch {
    pipeline_name: String,
    plugin_id: String,
    events: Vec<WireEvent>,
}

/// Human readable encoding: one JSON document per batch.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl ForwardingCodec for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, batch: &ForwardingBatch) -> Result<Vec<u8>, EncodeError> {
        if batch.records.len() > MAX_FORWARDING_BATCH_SIZE {
            return Err(EncodeError::TooManyRecords {
                count: batch.records.len(),
                max: MAX_FORWARDING_BATCH_SIZE,
            });
        }

        let wire = WireBatch {
            pipeline_name: batch.destination.pipeline_name.clone(),
            plugin_id: batch.destination.plugin_id.clone(),
            events: batch
                .records
                .iter()
                .map(|record| {
                    let event = record.event();
                    WireEvent {
                        event_type: event.event_type(),
                        time_received: event.time_received(),
                        attributes: event.attributes().clone(),
                        data: event.data().clone(),
                    }
                })
                .collect(),
        };

        Ok(serde_json::to_vec(&wire)?)
    }

    fn decode(&self, payload: &[u8]) -> Result<ForwardingBatch, DecodeError> {
        let wire: WireBatch = serde_json::from_slice(payload)
            .map_err(|error| DecodeError::Malformed(error.to_string()))?;

        if wire.events.len() > MAX_FORWARDING_BATCH_SIZE {
            return Err(DecodeError::TooManyRecords {
                count: wire.events.len(),
                max: MAX_FORWARDING_BATCH_SIZE,
            });
        }

        let records = wire
            .events
            .into_iter()
            .map(|event| {
                Record::new(
                    Event::new(event.event_type, event.data)
                        .with_time_received(event.time_received)
                        .with_attributes(event.attributes),
                )
            })
            .collect();

        Ok(ForwardingBatch::new(
            Destination::new(wire.pipeline_name, wire.plugin_id),
            records,
        ))
    }
}
