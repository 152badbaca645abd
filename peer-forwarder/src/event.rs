use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

/// Separates identification key values inside a [`HashKey`], so `["ab", "c"]` and
/// `["a", "bc"]` do not produce the same key.
const KEY_SEPARATOR: &str = "\u{1f}";

/// The kind of telemetry an [`Event`] carries. The upper-case name is what travels on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Event,
    Log,
    Span,
    Metric,
    Document,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        EventType::Event,
        EventType::Log,
        EventType::Span,
        EventType::Metric,
        EventType::Document,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Event => "EVENT",
            EventType::Log => "LOG",
            EventType::Span => "SPAN",
            EventType::Metric => "METRIC",
            EventType::Document => "DOCUMENT",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown event type: {0}")]
pub struct UnknownEventType(pub String);

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|event_type| event_type.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownEventType(s.to_owned()))
    }
}

/// An immutable telemetry payload plus the metadata the pipeline attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    event_type: EventType,
    time_received: OffsetDateTime,
    attributes: HashMap<String, Value>,
    data: Value,
}

impl Event {
    pub fn new(event_type: EventType, data: Value) -> Self {
        Self {
            event_type,
            time_received: OffsetDateTime::now_utc(),
            attributes: HashMap::new(),
            data,
        }
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, Value>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_time_received(mut self, time_received: OffsetDateTime) -> Self {
        self.time_received = time_received;
        self
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn time_received(&self) -> OffsetDateTime {
        self.time_received
    }

    pub fn attributes(&self) -> &HashMap<String, Value> {
        &self.attributes
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Looks up a payload field. Plain keys (`traceId`) address top-level fields, keys
    /// containing `/` (`resource/service` or `/resource/service`) are JSON pointers.
    pub fn get(&self, key: &str) -> Option<&Value> {
        if key.starts_with('/') {
            self.data.pointer(key)
        } else if key.contains('/') {
            self.data.pointer(&format!("/{key}"))
        } else {
            self.data.get(key)
        }
    }
}

/// The unit moved through buffers. Cloning a record clones a handle to the same immutable
/// event, never the event itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    event: Arc<Event>,
}

impl Record {
    pub fn new(event: Event) -> Self {
        Self {
            event: Arc::new(event),
        }
    }

    pub fn event(&self) -> &Event {
        &self.event
    }
}

impl From<Event> for Record {
    fn from(event: Event) -> Self {
        Record::new(event)
    }
}

/// The routing key of a record, derived from its identification key values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct HashKey(String);

impl HashKey {
    /// The key shared by every record that has none of the identification keys.
    pub fn empty() -> Self {
        HashKey(String::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for HashKey {
    fn from(value: &str) -> Self {
        HashKey(value.to_owned())
    }
}

/// Ordered, de-duplicated field names used to derive a [`HashKey`]. Every node of a fleet
/// must be configured with the same keys in the same order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentificationKeys(Vec<String>);

impl IdentificationKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered: Vec<String> = Vec::new();
        for key in keys.into_iter().map(Into::into) {
            if !key.is_empty() && !ordered.contains(&key) {
                ordered.push(key);
            }
        }
        IdentificationKeys(ordered)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Returns `None` when the event carries none of the keys, in which case the record
    /// routes with [`HashKey::empty`]. A missing key among present ones contributes an
    /// empty string.
    pub fn hash_key(&self, event: &Event) -> Option<HashKey> {
        let mut missing = 0;
        let values: Vec<String> = self
            .0
            .iter()
            .map(|key| match event.get(key) {
                None | Some(Value::Null) => {
                    missing += 1;
                    String::new()
                }
                Some(Value::String(value)) => value.clone(),
                Some(value) => value.to_string(),
            })
            .collect();

        if missing == self.0.len() {
            None
        } else {
            Some(HashKey(values.join(KEY_SEPARATOR)))
        }
    }
}
