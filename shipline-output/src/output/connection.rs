/// Connection management for the Redis output
///
/// A [`ConnectionManager`] owns at most one live connection to one configured
/// host. It walks the host list in order on every connect attempt and keeps
/// the first host that completes the TCP, TLS and RESP handshakes.
///
/// # States
///
/// ```text
///            connect()             handshake ok
///   Idle ─────────────> Connecting ─────────────> Connected
///    ^                      │                         │
///    │   all hosts failed   │        mark_failed()    │
///    └──────────────────────┴─────────────────────────┘
///
///   close() from any state ──> Closed (terminal)
/// ```
///
/// Failures never close the manager; they demote it to `Idle` so the caller
/// can connect again before the next publish.
///
/// # Example
///
/// ```no_run
/// use shipline_output::output::config::RedisOutputConfig;
/// use shipline_output::output::connection::ConnectionManager;
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Arc::new(RedisOutputConfig::from_env()?);
/// let mut manager = ConnectionManager::new(config)?;
///
/// manager.connect(&CancellationToken::new()).await?;
/// println!("Connected to {:?}", manager.active_endpoint());
/// manager.close();
/// # Ok(())
/// # }
/// ```

use async_trait::async_trait;
use redis::aio::ConnectionLike;
use redis::{Cmd, Pipeline, RedisConnectionInfo, RedisFuture, Value};
use rustls::ServerName;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;

use super::config::{ConfigError, Endpoint, RedisOutputConfig};
use super::tls;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectError {
    /// TCP dial failed
    #[error("Failed to dial {endpoint}: {source}")]
    Io {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    /// TLS handshake failed
    #[error("TLS handshake with {endpoint} failed: {reason}")]
    Tls { endpoint: String, reason: String },

    /// RESP handshake (AUTH) failed
    #[error("Redis handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    /// Dial exceeded the configured timeout
    #[error("Connecting to {endpoint} timed out")]
    Timeout { endpoint: String },

    /// Database selection was rejected
    #[error("Failed to select database {db}: {reason}")]
    SelectDb { db: u32, reason: String },

    /// Every configured host failed
    #[error("Failed to connect to any of {attempts} Redis hosts, last error: {last_error}")]
    AllHostsFailed { attempts: usize, last_error: String },

    /// The caller cancelled the attempt
    #[error("Connect cancelled")]
    Cancelled,

    /// The manager was closed for good
    #[error("Connection manager is closed")]
    Closed,
}

/// Lifecycle state of a [`ConnectionManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; a connect attempt may start
    Idle,

    /// A connect attempt is in flight
    Connecting,

    /// A usable connection is held
    Connected,

    /// Shut down explicitly; no further connects
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Byte stream a RESP connection runs over (plain TCP or TLS)
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// An established RESP connection to one endpoint
pub struct BrokerConnection {
    inner: Box<dyn ConnectionLike + Send>,
    endpoint: String,
}

impl BrokerConnection {
    /// Wraps an established connection
    pub fn new<C>(inner: C, endpoint: &Endpoint) -> Self
    where
        C: ConnectionLike + Send + 'static,
    {
        BrokerConnection {
            inner: Box::new(inner),
            endpoint: endpoint.to_string(),
        }
    }

    /// Sanitized endpoint this connection talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl ConnectionLike for BrokerConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        self.inner.req_packed_command(cmd)
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        self.inner.req_packed_commands(cmd, offset, count)
    }

    fn get_db(&self) -> i64 {
        self.inner.get_db()
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Opens a connection to a single endpoint
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dials, negotiates TLS when required and completes the RESP handshake
    async fn dial(&self, endpoint: &Endpoint) -> Result<BrokerConnection, ConnectError>;
}

/// Dialer that opens real TCP/TLS connections
pub struct NetworkDialer {
    config: Arc<RedisOutputConfig>,
    tls: Option<TlsConnector>,
}

impl NetworkDialer {
    /// Creates a dialer, building the TLS connector if any host needs it
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if hosts do not parse or TLS material cannot
    /// be loaded.
    pub fn new(config: Arc<RedisOutputConfig>) -> Result<Self, ConfigError> {
        let tls = if config.any_tls()? {
            Some(tls::build_connector(config.tls.as_ref())?)
        } else {
            None
        };
        Ok(NetworkDialer { config, tls })
    }

    fn connection_info(&self, endpoint: &Endpoint) -> RedisConnectionInfo {
        RedisConnectionInfo {
            db: 0,
            username: endpoint.username.clone(),
            password: endpoint
                .password
                .clone()
                .or_else(|| self.config.password.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Dialer for NetworkDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BrokerConnection, ConnectError> {
        let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(|source| ConnectError::Io {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let _ = tcp.set_nodelay(true);

        let stream: Box<dyn AsyncStream> = if self.config.tls_enabled_for(endpoint) {
            let tls_error = |reason: String| ConnectError::Tls {
                endpoint: endpoint.to_string(),
                reason,
            };
            let connector = self
                .tls
                .as_ref()
                .ok_or_else(|| tls_error("TLS connector not configured".to_string()))?;
            let server_name = ServerName::try_from(endpoint.host.as_str())
                .map_err(|e| tls_error(format!("invalid server name: {}", e)))?;
            let stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| tls_error(e.to_string()))?;
            Box::new(stream)
        } else {
            Box::new(tcp)
        };

        let connection = redis::aio::Connection::new(&self.connection_info(endpoint), stream)
            .await
            .map_err(|e| ConnectError::Handshake {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        Ok(BrokerConnection::new(connection, endpoint))
    }
}

/// Owns the output's single connection and its lifecycle
pub struct ConnectionManager {
    config: Arc<RedisOutputConfig>,
    endpoints: Vec<Endpoint>,
    dialer: Arc<dyn Dialer>,
    state: ConnectionState,
    connection: Option<BrokerConnection>,
    active: Option<Endpoint>,
}

impl ConnectionManager {
    /// Creates a manager that dials real network connections
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid.
    pub fn new(config: Arc<RedisOutputConfig>) -> Result<Self, ConfigError> {
        let dialer = Arc::new(NetworkDialer::new(config.clone())?);
        Self::with_dialer(config, dialer)
    }

    /// Creates a manager with a custom dialer
    pub fn with_dialer(
        config: Arc<RedisOutputConfig>,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, ConfigError> {
        config.check()?;
        let endpoints = config.endpoints()?;

        Ok(ConnectionManager {
            config,
            endpoints,
            dialer,
            state: ConnectionState::Idle,
            connection: None,
            active: None,
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Endpoint of the live connection, if any
    pub fn active_endpoint(&self) -> Option<&Endpoint> {
        self.active.as_ref()
    }

    /// Connects to the first reachable host
    ///
    /// Any existing connection is dropped first. Hosts are tried in
    /// configured order, each dial bounded by the configured timeout. In
    /// list mode with a `db` set, `SELECT` follows the handshake and a
    /// rejection fails the whole attempt.
    ///
    /// # Errors
    ///
    /// - `ConnectError::Closed` after [`close`](Self::close)
    /// - `ConnectError::Cancelled` if `cancel` fires first
    /// - `ConnectError::SelectDb` if database selection is rejected
    /// - `ConnectError::AllHostsFailed` if no host could be reached
    pub async fn connect(&mut self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectError::Closed);
        }

        self.drop_connection();
        self.state = ConnectionState::Connecting;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = try_hosts(&self.config, &self.endpoints, self.dialer.as_ref()) => result,
        };

        match result {
            Ok((connection, endpoint)) => {
                tracing::info!(
                    endpoint = %endpoint,
                    tls = self.config.tls_enabled_for(&endpoint),
                    db = ?self.config.select_db(),
                    "Redis output connected"
                );
                self.connection = Some(connection);
                self.active = Some(endpoint);
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Redis output connect failed");
                self.state = ConnectionState::Idle;
                Err(e)
            }
        }
    }

    /// Usable connection handle, `None` unless `Connected`
    pub fn connection(&mut self) -> Option<&mut BrokerConnection> {
        match self.state {
            ConnectionState::Connected => self.connection.as_mut(),
            _ => None,
        }
    }

    /// Drops the live connection after an I/O or protocol failure
    ///
    /// Demotes `Connected` to `Idle`; other states are left alone.
    pub fn mark_failed(&mut self) {
        if self.state == ConnectionState::Connected {
            tracing::warn!(
                endpoint = ?self.active.as_ref().map(ToString::to_string),
                "Redis connection marked as failed"
            );
            self.drop_connection();
            self.state = ConnectionState::Idle;
        }
    }

    /// Releases the socket and moves to `Closed`; idempotent
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.drop_connection();
        self.state = ConnectionState::Closed;
        tracing::info!("Redis output connection closed");
    }

    fn drop_connection(&mut self) {
        self.connection = None;
        self.active = None;
    }
}

async fn try_hosts(
    config: &RedisOutputConfig,
    endpoints: &[Endpoint],
    dialer: &dyn Dialer,
) -> Result<(BrokerConnection, Endpoint), ConnectError> {
    let mut last_error = None;

    for endpoint in endpoints {
        let attempt = tokio::time::timeout(config.timeout, dialer.dial(endpoint)).await;

        let error = match attempt {
            Ok(Ok(mut connection)) => {
                if let Some(db) = config.select_db() {
                    select_db(config, &mut connection, db).await?;
                }
                return Ok((connection, endpoint.clone()));
            }
            Ok(Err(e)) => e,
            Err(_) => ConnectError::Timeout {
                endpoint: endpoint.to_string(),
            },
        };

        tracing::warn!(
            endpoint = %endpoint,
            error = %error,
            "Redis host unavailable, trying next host"
        );
        last_error = Some(error);
    }

    Err(ConnectError::AllHostsFailed {
        attempts: endpoints.len(),
        last_error: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no hosts configured".to_string()),
    })
}

async fn select_db(
    config: &RedisOutputConfig,
    connection: &mut BrokerConnection,
    db: u32,
) -> Result<(), ConnectError> {
    let select = redis::cmd("SELECT").arg(db).to_owned();
    let reply: Result<(), redis::RedisError> =
        tokio::time::timeout(config.timeout, select.query_async(connection))
            .await
            .map_err(|_| ConnectError::SelectDb {
                db,
                reason: "timed out".to_string(),
            })?;

    reply.map_err(|e| ConnectError::SelectDb {
        db,
        reason: e.to_string(),
    })
}
