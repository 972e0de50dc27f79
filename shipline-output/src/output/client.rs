/// Redis output client
///
/// [`RedisOutputClient`] is the façade the pipeline talks to. It binds one
/// [`ConnectionManager`], the codec and the delivery strategy picked by
/// `datatype`, and turns each [`Batch`] into exactly one delivery attempt.
///
/// # Publish
///
/// 1. Encode every event; the first encoding error fails the batch without
///    touching the network
/// 2. Deliver the payloads over the current connection
/// 3. Ack the batch on success; on failure drop the connection, fail the
///    batch and return the error
///
/// The client never retries. After an error the caller calls
/// [`connect`](RedisOutputClient::connect) again before re-submitting.
///
/// # Example
///
/// ```no_run
/// use shipline_output::codec::AgentInfo;
/// use shipline_output::models::event::{Batch, Event};
/// use shipline_output::output::{RedisOutputClient, RedisOutputConfig};
/// use serde_json::json;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = RedisOutputConfig::from_env()?;
/// let agent = AgentInfo::new("shipline", "0.1.0");
/// let mut client = RedisOutputClient::new(config, agent)?;
/// let cancel = CancellationToken::new();
///
/// client.connect(&cancel).await?;
///
/// let (batch, outcome) = Batch::channel(vec![
///     Event::new().with_field("message", json!(1)),
///     Event::new().with_field("message", json!(2)),
/// ]);
/// client.publish(&cancel, batch).await?;
/// println!("Batch outcome: {}", outcome.await?);
///
/// client.close();
/// # Ok(())
/// # }
/// ```

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::config::{ConfigError, RedisOutputConfig};
use super::connection::{ConnectError, ConnectionManager, ConnectionState, Dialer};
use super::delivery::{self, Delivery, DeliveryError, DeliveryReport};
use super::stats::OutputStats;
use crate::codec::{AgentInfo, Codec, EncodingError};
use crate::models::event::Batch;

/// Output client errors
#[derive(Error, Debug)]
pub enum OutputError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No host could be connected
    #[error(transparent)]
    Connect(ConnectError),

    /// An event could not be encoded
    #[error("Failed to encode event {index} of batch: {source}")]
    Encoding {
        index: usize,
        #[source]
        source: EncodingError,
    },

    /// Redis rejected a command or the connection failed mid-batch
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Publish was called without a usable connection
    #[error("Redis output is not connected")]
    NotConnected,

    /// The client was closed
    #[error("Redis output is closed")]
    Closed,
}

impl OutputError {
    /// Whether the batch may be re-submitted after a fresh connect
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OutputError::Connect(_)
                | OutputError::Delivery(_)
                | OutputError::Cancelled
                | OutputError::NotConnected
        )
    }
}

impl From<ConnectError> for OutputError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::Cancelled => OutputError::Cancelled,
            ConnectError::Closed => OutputError::Closed,
            other => OutputError::Connect(other),
        }
    }
}

/// Redis output: one connection, one codec, one delivery strategy
pub struct RedisOutputClient {
    agent: AgentInfo,
    codec: Box<dyn Codec>,
    delivery: Box<dyn Delivery>,
    connection: ConnectionManager,
    stats: Arc<OutputStats>,
}

impl RedisOutputClient {
    /// Creates a client that dials real network connections
    ///
    /// # Errors
    ///
    /// Returns `OutputError::Config` if the configuration is invalid or TLS
    /// material cannot be loaded.
    pub fn new(config: RedisOutputConfig, agent: AgentInfo) -> Result<Self, OutputError> {
        let config = Arc::new(config);
        let connection = ConnectionManager::new(config.clone())?;
        Ok(Self::assemble(&config, agent, connection))
    }

    /// Creates a client with a custom dialer
    pub fn with_dialer(
        config: RedisOutputConfig,
        agent: AgentInfo,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, OutputError> {
        let config = Arc::new(config);
        let connection = ConnectionManager::with_dialer(config.clone(), dialer)?;
        Ok(Self::assemble(&config, agent, connection))
    }

    fn assemble(
        config: &RedisOutputConfig,
        agent: AgentInfo,
        connection: ConnectionManager,
    ) -> Self {
        RedisOutputClient {
            codec: config.codec.build(),
            delivery: delivery::strategy(config),
            agent,
            connection,
            stats: Arc::new(OutputStats::default()),
        }
    }

    /// Replaces the configured codec
    pub fn with_codec(mut self, codec: Box<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Shared statistics handle
    pub fn stats(&self) -> Arc<OutputStats> {
        self.stats.clone()
    }

    /// Connection state
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Connects to the first reachable host, replacing any live connection
    ///
    /// # Errors
    ///
    /// - `OutputError::Connect` if every host failed or `SELECT` was rejected
    /// - `OutputError::Cancelled` if `cancel` fired first
    /// - `OutputError::Closed` after [`close`](Self::close)
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), OutputError> {
        match self.connection.connect(cancel).await {
            Ok(()) => {
                self.stats.connected();
                Ok(())
            }
            Err(e) => {
                self.stats.connect_failed();
                Err(e.into())
            }
        }
    }

    /// Publishes one batch and completes it
    ///
    /// The batch is acked on success and failed on every error.
    ///
    /// # Errors
    ///
    /// - `OutputError::Encoding` if an event cannot be encoded; the
    ///   connection is left untouched
    /// - `OutputError::NotConnected` if no connection is live
    /// - `OutputError::Delivery` if Redis rejected a command or the
    ///   connection failed; the connection is dropped
    /// - `OutputError::Cancelled` if `cancel` fired mid-delivery; the
    ///   connection is dropped
    /// - `OutputError::Closed` after [`close`](Self::close)
    pub async fn publish(
        &mut self,
        cancel: &CancellationToken,
        batch: Batch,
    ) -> Result<DeliveryReport, OutputError> {
        if self.connection.state() == ConnectionState::Closed {
            fail(&self.stats, batch);
            return Err(OutputError::Closed);
        }

        if batch.is_empty() {
            batch.ack();
            return Ok(DeliveryReport::default());
        }

        let encoded: Result<Vec<Vec<u8>>, (usize, EncodingError)> = batch
            .events()
            .iter()
            .enumerate()
            .map(|(index, event)| {
                self.codec
                    .encode(&self.agent, event)
                    .map_err(|source| (index, source))
            })
            .collect();

        let payloads = match encoded {
            Ok(payloads) => payloads,
            Err((index, source)) => {
                tracing::warn!(index, error = %source, "Dropping batch with unencodable event");
                self.stats.encoding_failed();
                fail(&self.stats, batch);
                return Err(OutputError::Encoding { index, source });
            }
        };

        let connection = match self.connection.connection() {
            Some(connection) => connection,
            None => {
                fail(&self.stats, batch);
                return Err(OutputError::NotConnected);
            }
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OutputError::Cancelled),
            result = self.delivery.deliver(connection, &payloads) => result.map_err(OutputError::from),
        };

        match result {
            Ok(report) => {
                tracing::debug!(
                    command = self.delivery.command(),
                    events = report.commands,
                    windows = report.windows,
                    bytes = report.bytes,
                    "Batch delivered"
                );
                self.stats.batch_acked(batch.len(), report.bytes);
                batch.ack();
                Ok(report)
            }
            Err(e) => {
                tracing::error!(
                    command = self.delivery.command(),
                    events = batch.len(),
                    error = %e,
                    "Batch delivery failed, dropping connection"
                );
                self.connection.mark_failed();
                fail(&self.stats, batch);
                Err(e)
            }
        }
    }

    /// Closes the connection; idempotent
    pub fn close(&mut self) {
        self.connection.close();
    }
}

fn fail(stats: &OutputStats, batch: Batch) {
    stats.batch_failed(batch.len());
    batch.fail();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, JsonCodecConfig};
    use crate::models::event::{BatchOutcome, Event};
    use crate::output::config::DataType;
    use crate::testing::{MockDialer, MockScript, RejectingCodec};
    use serde_json::{json, Value as JsonValue};
    use std::time::Duration;

    fn agent() -> AgentInfo {
        AgentInfo::new("shipline", "9.9.9")
    }

    fn client(script: &MockScript, config: RedisOutputConfig) -> RedisOutputClient {
        let dialer = Arc::new(MockDialer::new(script.clone()));
        RedisOutputClient::with_dialer(config, agent(), dialer).unwrap()
    }

    fn messages(n: i64) -> Vec<Event> {
        (1..=n)
            .map(|i| Event::new().with_field("message", json!(i)))
            .collect()
    }

    fn decode(payload: &[u8]) -> JsonValue {
        serde_json::from_slice(payload).unwrap()
    }

    #[tokio::test]
    async fn test_list_batch_is_pushed_in_order() {
        let script = MockScript::new();
        let mut config = RedisOutputConfig::new(vec!["h:6379".to_string()], "k");
        config.db = Some(0);
        let mut client = client(&script, config);
        let cancel = CancellationToken::new();

        client.connect(&cancel).await.unwrap();
        let (batch, outcome) = Batch::channel(messages(3));
        client.publish(&cancel, batch).await.unwrap();

        assert_eq!(outcome.await.unwrap(), BatchOutcome::Ack);
        assert_eq!(
            script.command_names(),
            vec!["SELECT", "RPUSH", "RPUSH", "RPUSH"]
        );
        let popped: Vec<JsonValue> = script
            .list("k")
            .iter()
            .map(|p| decode(p)["message"].clone())
            .collect();
        assert_eq!(popped, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_envelope_carries_agent_and_meta() {
        let script = MockScript::new();
        let mut client = client(&script, RedisOutputConfig::new(vec!["h".to_string()], "k"));
        let cancel = CancellationToken::new();

        client.connect(&cancel).await.unwrap();
        let event = Event::new()
            .with_field("message", json!("hello"))
            .with_meta("test", json!("private"));
        client.publish(&cancel, Batch::new(vec![event])).await.unwrap();

        let payload = decode(&script.list("k")[0]);
        assert_eq!(payload["@metadata"]["beat"], "shipline");
        assert_eq!(payload["@metadata"]["version"], "9.9.9");
        assert_eq!(payload["@metadata"]["test"], "private");
        assert_eq!(payload["message"], "hello");
    }

    #[tokio::test]
    async fn test_channel_batch_is_published_in_order() {
        let script = MockScript::new();
        let mut config = RedisOutputConfig::new(vec!["h".to_string()], "events");
        config.datatype = DataType::Channel;
        let mut client = client(&script, config);
        let cancel = CancellationToken::new();

        client.connect(&cancel).await.unwrap();
        let report = client.publish(&cancel, Batch::new(messages(3))).await.unwrap();

        assert_eq!(report.commands, 3);
        let published: Vec<JsonValue> = script
            .commands()
            .iter()
            .map(|args| decode(&args[2])["message"].clone())
            .collect();
        assert_eq!(published, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn test_delivery_error_requires_reconnect() {
        let script = MockScript::new();
        script.reject_at(1);
        let mut client = client(&script, RedisOutputConfig::new(vec!["h".to_string()], "k"));
        let cancel = CancellationToken::new();

        client.connect(&cancel).await.unwrap();
        let (batch, outcome) = Batch::channel(messages(3));
        let err = client.publish(&cancel, batch).await.unwrap_err();

        assert!(matches!(err, OutputError::Delivery(DeliveryError::Rejected { .. })));
        assert!(err.is_retryable());
        assert_eq!(outcome.await.unwrap(), BatchOutcome::Fail);
        assert_eq!(client.state(), ConnectionState::Idle);

        let err = client.publish(&cancel, Batch::new(messages(1))).await.unwrap_err();
        assert!(matches!(err, OutputError::NotConnected));

        client.connect(&cancel).await.unwrap();
        client.publish(&cancel, Batch::new(messages(1))).await.unwrap();

        let stats = client.stats().snapshot();
        assert_eq!(stats.connects, 2);
        assert_eq!(stats.batches_failed, 2);
        assert_eq!(stats.batches_acked, 1);
    }

    #[tokio::test]
    async fn test_encoding_error_leaves_connection_alone() {
        let script = MockScript::new();
        let mut client = client(&script, RedisOutputConfig::new(vec!["h".to_string()], "k"))
            .with_codec(Box::new(RejectingCodec::new("bad")));
        let cancel = CancellationToken::new();

        client.connect(&cancel).await.unwrap();
        let bad = Event::new().with_field("bad", json!(1));
        let (batch, outcome) = Batch::channel(vec![Event::new(), bad]);
        let err = client.publish(&cancel, batch).await.unwrap_err();

        assert!(matches!(err, OutputError::Encoding { index: 1, .. }));
        assert!(!err.is_retryable());
        assert_eq!(outcome.await.unwrap(), BatchOutcome::Fail);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(script.commands().is_empty());
        assert_eq!(client.stats().snapshot().encoding_failures, 1);
    }

    #[tokio::test]
    async fn test_cancelled_publish_drops_connection() {
        let script = MockScript::new();
        script.delay(Duration::from_millis(50));
        let mut client = client(&script, RedisOutputConfig::new(vec!["h".to_string()], "k"));
        let cancel = CancellationToken::new();

        client.connect(&cancel).await.unwrap();
        cancel.cancel();
        let err = client.publish(&cancel, Batch::new(messages(2))).await.unwrap_err();

        assert!(matches!(err, OutputError::Cancelled));
        assert_eq!(client.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_empty_batch_is_acked_without_io() {
        let script = MockScript::new();
        let mut client = client(&script, RedisOutputConfig::new(vec!["h".to_string()], "k"));

        let (batch, outcome) = Batch::channel(Vec::new());
        client.publish(&CancellationToken::new(), batch).await.unwrap();

        assert_eq!(outcome.await.unwrap(), BatchOutcome::Ack);
        assert!(script.commands().is_empty());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_work() {
        let script = MockScript::new();
        let mut client = client(&script, RedisOutputConfig::new(vec!["h".to_string()], "k"));
        let cancel = CancellationToken::new();

        client.connect(&cancel).await.unwrap();
        client.close();
        client.close();

        let err = client.publish(&cancel, Batch::new(messages(1))).await.unwrap_err();
        assert!(matches!(err, OutputError::Closed));
        assert!(matches!(client.connect(&cancel).await, Err(OutputError::Closed)));
    }

    #[tokio::test]
    async fn test_custom_codec() {
        let script = MockScript::new();
        let mut client = client(&script, RedisOutputConfig::new(vec!["h".to_string()], "k"))
            .with_codec(Box::new(JsonCodec::new(JsonCodecConfig { pretty: true })));
        let cancel = CancellationToken::new();

        client.connect(&cancel).await.unwrap();
        client.publish(&cancel, Batch::new(messages(1))).await.unwrap();

        assert!(script.list("k")[0].contains(&b'\n'));
    }

    #[test]
    fn test_invalid_config() {
        let script = MockScript::new();
        let dialer = Arc::new(MockDialer::new(script));
        let config = RedisOutputConfig::new(vec!["h".to_string()], "");

        let err = RedisOutputClient::with_dialer(config, agent(), dialer)
            .err()
            .unwrap();
        assert!(matches!(err, OutputError::Config(_)));
        assert!(!err.is_retryable());
    }
}
