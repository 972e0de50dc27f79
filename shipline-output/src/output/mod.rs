/// Redis output
///
/// Delivers event batches to Redis as list entries (`RPUSH`) or channel
/// messages (`PUBLISH`).
///
/// # Modules
///
/// - `config`: settings, host parsing and TLS selection
/// - `tls`: rustls connector per verification mode
/// - `connection`: host failover and connection lifecycle
/// - `delivery`: pipelined `RPUSH`/`PUBLISH` strategies
/// - `client`: the publish façade
/// - `stats`: delivery counters

pub mod client;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod stats;
pub mod tls;

pub use client::{OutputError, RedisOutputClient};
pub use config::{ConfigError, DataType, RedisOutputConfig, TlsConfig, VerificationMode};
pub use connection::{ConnectError, ConnectionState};
pub use delivery::{DeliveryError, DeliveryReport};
pub use stats::{OutputStats, StatsSnapshot};
