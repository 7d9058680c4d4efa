//! The message unit exchanged over every endpoint.
//!
//! An [`Envelope`] is encoded as one UTF-8 JSON object per transport frame:
//!
//! ```json
//! {"v":1,"topic":"TRADE","producer":"StrategyAgent","emitted_at":1718000000000000,
//!  "payload":{"ticker":"SPY","signal":"BUY"}}
//! ```
//!
//! Frames without a `payload` key are read as legacy flat messages
//! (`{"topic":"TRADE","ticker":"SPY","signal":"BUY"}`): every field except
//! `topic` becomes the payload object. Topic filters are plain string
//! prefixes, never patterns.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MeshError, MeshResult};
use crate::time_util;

/// Envelope format version written by this crate.
pub const WIRE_VERSION: u8 = 1;

fn wire_version() -> u8 {
    WIRE_VERSION
}

/// A topic-tagged JSON payload plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Format version; absent on the wire means 1.
    #[serde(rename = "v", default = "wire_version")]
    pub version: u8,
    /// Routing hint matched against subscriber prefix filters.
    pub topic: String,
    /// Name of the agent that sent it. Filled by the registry when empty.
    #[serde(default)]
    pub producer: String,
    /// Emission time, microseconds since the Unix epoch.
    #[serde(default)]
    pub emitted_at: u64,
    /// Opaque application data.
    pub payload: Value,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(topic: impl Into<String>, producer: impl Into<String>, payload: Value) -> Self {
        Self {
            version: WIRE_VERSION,
            topic: topic.into(),
            producer: producer.into(),
            emitted_at: time_util::now_us(),
            payload,
        }
    }

    /// Create an envelope from any serializable payload.
    ///
    /// Fails with [`MeshError::Serialization`] when the value has no JSON
    /// representation (e.g. a map with non-string keys).
    pub fn from_serializable<T: Serialize + ?Sized>(
        topic: impl Into<String>,
        producer: impl Into<String>,
        payload: &T,
    ) -> MeshResult<Self> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::new(topic, producer, payload))
    }

    /// Decode the payload into a typed value.
    pub fn payload_as<T: DeserializeOwned>(&self) -> MeshResult<T> {
        T::deserialize(&self.payload).map_err(MeshError::from)
    }

    /// Whether this envelope passes a subscriber's prefix filter.
    #[inline]
    pub fn matches(&self, filter: &str) -> bool {
        self.topic.starts_with(filter)
    }

    /// Serialize to the wire representation.
    pub fn encode(&self) -> MeshResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(MeshError::from)
    }

    /// Parse one frame body, accepting both current and legacy flat frames.
    pub fn decode(bytes: &[u8]) -> MeshResult<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Object(map) = value else {
            return Err(MeshError::Serialization("envelope must be a JSON object".into()));
        };

        if !map.contains_key("payload") {
            return Self::from_flat(map);
        }

        let env: Envelope = serde_json::from_value(Value::Object(map))?;
        if env.version > WIRE_VERSION {
            return Err(MeshError::Serialization(format!(
                "unsupported envelope version {} (max {WIRE_VERSION})",
                env.version
            )));
        }
        Ok(env)
    }

    /// Build an envelope from a flat `{"topic": .., <fields>}` object.
    pub fn from_flat(mut map: Map<String, Value>) -> MeshResult<Self> {
        let topic = match map.remove("topic") {
            Some(Value::String(t)) => t,
            Some(_) => return Err(MeshError::Serialization("envelope topic must be a string".into())),
            None => return Err(MeshError::Serialization("envelope has no topic".into())),
        };
        Ok(Self {
            version: WIRE_VERSION,
            topic,
            producer: String::new(),
            emitted_at: 0,
            payload: Value::Object(map),
        })
    }
}
