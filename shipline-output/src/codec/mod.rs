/// Event encoding
///
/// A [`Codec`] turns one [`Event`] into the byte payload stored in Redis.
/// Codecs are pure: the output depends only on the event and the agent
/// identity supplied when the output client is built.
///
/// # Example
///
/// ```no_run
/// use shipline_output::codec::{AgentInfo, Codec, JsonCodec};
/// use shipline_output::models::event::Event;
/// use serde_json::json;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let agent = AgentInfo::new("shipline", "0.1.0");
/// let event = Event::new().with_field("message", json!("hello"));
///
/// let payload = JsonCodec::default().encode(&agent, &event)?;
/// println!("{}", String::from_utf8_lossy(&payload));
/// # Ok(())
/// # }
/// ```

pub mod json;

use crate::models::event::Event;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use json::{JsonCodec, JsonCodecConfig, METADATA_KEY, TIMESTAMP_KEY};

/// Encoding errors
#[derive(Error, Debug)]
pub enum EncodingError {
    /// A field value could not be represented in the target format
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Identity of the shipping agent, stamped into every envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Agent name (`@metadata.beat`)
    pub name: String,

    /// Agent version (`@metadata.version`)
    pub version: String,
}

impl AgentInfo {
    /// Creates an agent identity
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        AgentInfo {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// Serialization boundary between events and Redis payloads
pub trait Codec: Send + Sync {
    /// Encodes a single event into its wire payload
    fn encode(&self, agent: &AgentInfo, event: &Event) -> Result<Vec<u8>, EncodingError>;
}

/// Codec selection as it appears in configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecConfig {
    /// JSON codec options
    #[serde(default)]
    pub json: JsonCodecConfig,
}

impl CodecConfig {
    /// Builds the configured codec
    pub fn build(&self) -> Box<dyn Codec> {
        Box::new(JsonCodec::new(self.json.clone()))
    }
}
