/// JSON codec
///
/// Produces one JSON object per event:
///
/// ```text
/// {
///   "@timestamp": "2025-01-03T12:00:00.000Z",
///   "@metadata": {"beat": "shipline", "type": "_doc", "version": "0.1.0", "test": "private"},
///   "message": 1
/// }
/// ```
///
/// `@metadata` always carries the agent name and version; event `meta`
/// attributes are merged in beside them. Body fields sit at the top level.
///
/// Body fields never replace the envelope keys:
///
/// * a body `@timestamp` is dropped, the event timestamp is always written
/// * a body `@metadata` object is merged into the envelope below `meta`
///   and the agent identity; any other `@metadata` value is dropped

use super::{AgentInfo, Codec, EncodingError};
use crate::models::event::Event;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Reserved key holding the metadata envelope
pub const METADATA_KEY: &str = "@metadata";

/// Reserved key holding the event timestamp
pub const TIMESTAMP_KEY: &str = "@timestamp";

/// Document type advertised in the envelope
const DOC_TYPE: &str = "_doc";

/// JSON codec options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonCodecConfig {
    /// Pretty-print payloads
    #[serde(default)]
    pub pretty: bool,
}

/// Encodes events as JSON objects with an `@metadata` envelope
#[derive(Debug, Clone, Default)]
pub struct JsonCodec {
    config: JsonCodecConfig,
}

impl JsonCodec {
    /// Creates a JSON codec with the given options
    pub fn new(config: JsonCodecConfig) -> Self {
        JsonCodec { config }
    }

    fn envelope(agent: &AgentInfo, event: &Event) -> JsonValue {
        let mut meta = match event.fields.get(METADATA_KEY) {
            Some(JsonValue::Object(body)) => body.clone(),
            _ => Map::new(),
        };
        meta.extend(event.meta.iter().map(|(k, v)| (k.clone(), v.clone())));
        meta.insert("beat".to_string(), JsonValue::String(agent.name.clone()));
        meta.insert("type".to_string(), JsonValue::String(DOC_TYPE.to_string()));
        meta.insert(
            "version".to_string(),
            JsonValue::String(agent.version.clone()),
        );
        JsonValue::Object(meta)
    }
}

impl Codec for JsonCodec {
    fn encode(&self, agent: &AgentInfo, event: &Event) -> Result<Vec<u8>, EncodingError> {
        let mut doc = Map::with_capacity(event.fields.len() + 2);
        doc.insert(
            TIMESTAMP_KEY.to_string(),
            JsonValue::String(
                event
                    .timestamp
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        );
        doc.insert(METADATA_KEY.to_string(), Self::envelope(agent, event));

        for (key, value) in &event.fields {
            if key == METADATA_KEY || key == TIMESTAMP_KEY {
                continue;
            }
            doc.insert(key.clone(), value.clone());
        }

        let doc = JsonValue::Object(doc);
        let payload = if self.config.pretty {
            serde_json::to_vec_pretty(&doc)?
        } else {
            serde_json::to_vec(&doc)?
        };
        Ok(payload)
    }
}
