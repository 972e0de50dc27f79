/// In-memory Redis doubles for tests
///
/// `MockScript` records every command written to a `MockConnection` and
/// decides each reply. `MockDialer` hands out connections that share one
/// script, with per-host failure injection.
///
/// Available to other crates with the `test-util` feature.
///
/// # Example
///
/// ```no_run
/// use shipline_output::codec::AgentInfo;
/// use shipline_output::output::{RedisOutputClient, RedisOutputConfig};
/// use shipline_output::testing::{MockDialer, MockScript};
/// use std::sync::Arc;
///
/// let script = MockScript::new();
/// let dialer = Arc::new(MockDialer::new(script.clone()));
/// let config = RedisOutputConfig::new(vec!["h:6379".to_string()], "k");
/// let client = RedisOutputClient::with_dialer(config, AgentInfo::new("a", "1"), dialer);
/// ```

use async_trait::async_trait;
use redis::aio::ConnectionLike;
use redis::{Cmd, ErrorKind, Pipeline, RedisError, RedisFuture, RedisResult, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::codec::{AgentInfo, Codec, EncodingError, JsonCodec};
use crate::models::event::Event;
use crate::output::config::Endpoint;
use crate::output::connection::{BrokerConnection, ConnectError, Dialer};

#[derive(Default)]
struct ScriptState {
    commands: Vec<Vec<Vec<u8>>>,
    lists: HashMap<Vec<u8>, Vec<Vec<u8>>>,
    subscribers: i64,
    reject_at: Option<usize>,
    drop_at: Option<usize>,
    reject_select: bool,
    odd_reply: bool,
    delay: Option<Duration>,
}

/// Shared reply script and command log
#[derive(Clone, Default)]
pub struct MockScript {
    state: Arc<Mutex<ScriptState>>,
}

impl MockScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies to PUBLISH with this subscriber count
    pub fn subscribers(&self, count: i64) {
        self.state.lock().unwrap().subscribers = count;
    }

    /// Replies with WRONGTYPE to the data command with this zero-based index
    pub fn reject_at(&self, index: usize) {
        self.state.lock().unwrap().reject_at = Some(index);
    }

    /// Fails with a connection reset at the data command with this index
    pub fn drop_at(&self, index: usize) {
        self.state.lock().unwrap().drop_at = Some(index);
    }

    /// Rejects SELECT with an out-of-range error
    pub fn reject_select(&self) {
        self.state.lock().unwrap().reject_select = true;
    }

    /// Replies to data commands with a bulk string instead of an integer
    pub fn odd_reply(&self) {
        self.state.lock().unwrap().odd_reply = true;
    }

    /// Delays every reply
    pub fn delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    /// Every command received, as raw arguments
    pub fn commands(&self) -> Vec<Vec<Vec<u8>>> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Names of every command received
    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .iter()
            .map(|args| String::from_utf8_lossy(&args[0]).to_uppercase())
            .collect()
    }

    /// Contents of a list built by RPUSH
    pub fn list(&self, key: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .lists
            .get(key.as_bytes())
            .cloned()
            .unwrap_or_default()
    }

    fn delay_value(&self) -> Option<Duration> {
        self.state.lock().unwrap().delay
    }

    fn execute(&self, args: Vec<Vec<u8>>) -> RedisResult<Value> {
        let mut state = self.state.lock().unwrap();
        let name = String::from_utf8_lossy(&args[0]).to_uppercase();
        let data_index = state
            .commands
            .iter()
            .filter(|c| !c[0].eq_ignore_ascii_case(b"SELECT"))
            .count();
        state.commands.push(args.clone());

        if name == "SELECT" {
            if state.reject_select {
                return Err(RedisError::from((
                    ErrorKind::ResponseError,
                    "ERR DB index is out of range",
                )));
            }
            return Ok(Value::Okay);
        }

        if state.drop_at == Some(data_index) {
            return Err(RedisError::from(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset by peer",
            )));
        }
        if state.reject_at == Some(data_index) {
            return Err(RedisError::from((
                ErrorKind::ResponseError,
                "WRONGTYPE Operation against a key holding the wrong kind of value",
            )));
        }
        if state.odd_reply {
            return Ok(Value::Data(b"unexpected".to_vec()));
        }

        match name.as_str() {
            "RPUSH" => {
                let list = state.lists.entry(args[1].clone()).or_default();
                list.extend(args[2..].iter().cloned());
                Ok(Value::Int(list.len() as i64))
            }
            "PUBLISH" => Ok(Value::Int(state.subscribers)),
            _ => Ok(Value::Okay),
        }
    }
}

/// Connection that answers from a `MockScript`
pub struct MockConnection {
    script: MockScript,
}

impl ConnectionLike for MockConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        let commands = parse_packed(&cmd.get_packed_command());
        Box::pin(async move {
            if let Some(delay) = self.script.delay_value() {
                tokio::time::sleep(delay).await;
            }
            let mut replies = commands.into_iter().map(|args| self.script.execute(args));
            replies.next().unwrap_or(Ok(Value::Nil))
        })
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        let commands = parse_packed(&cmd.get_packed_pipeline());
        Box::pin(async move {
            if let Some(delay) = self.script.delay_value() {
                tokio::time::sleep(delay).await;
            }
            // Read every reply and surface the first error, like a real
            // pipelined connection does.
            let mut first_error = None;
            let mut replies = Vec::with_capacity(commands.len());
            for args in commands {
                match self.script.execute(args) {
                    Ok(value) => replies.push(value),
                    Err(e) => {
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(replies.into_iter().skip(offset).take(count).collect()),
            }
        })
    }

    fn get_db(&self) -> i64 {
        0
    }
}

/// Dialer producing `MockConnection`s
pub struct MockDialer {
    script: MockScript,
    unreachable: HashSet<String>,
    slow: HashMap<String, Duration>,
    attempts: Mutex<Vec<String>>,
}

impl MockDialer {
    pub fn new(script: MockScript) -> Self {
        MockDialer {
            script,
            unreachable: HashSet::new(),
            slow: HashMap::new(),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Refuses connections to `host`
    pub fn unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }

    /// Stalls dials to `host` for `delay`
    pub fn slow(mut self, host: &str, delay: Duration) -> Self {
        self.slow.insert(host.to_string(), delay);
        self
    }

    /// Hosts dialed so far, in order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, endpoint: &Endpoint) -> Result<BrokerConnection, ConnectError> {
        self.attempts.lock().unwrap().push(endpoint.host.clone());

        if let Some(delay) = self.slow.get(&endpoint.host) {
            tokio::time::sleep(*delay).await;
        }
        if self.unreachable.contains(&endpoint.host) {
            return Err(ConnectError::Io {
                endpoint: endpoint.to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ),
            });
        }

        Ok(BrokerConnection::new(
            MockConnection {
                script: self.script.clone(),
            },
            endpoint,
        ))
    }
}

/// JSON codec that fails every event carrying `field`
pub struct RejectingCodec {
    field: String,
    inner: JsonCodec,
}

impl RejectingCodec {
    pub fn new(field: impl Into<String>) -> Self {
        RejectingCodec {
            field: field.into(),
            inner: JsonCodec::default(),
        }
    }
}

impl Codec for RejectingCodec {
    fn encode(&self, agent: &AgentInfo, event: &Event) -> Result<Vec<u8>, EncodingError> {
        if event.fields.contains_key(&self.field) {
            let msg = format!("field '{}' is not representable", self.field);
            return Err(EncodingError::Serialize(serde::ser::Error::custom(msg)));
        }
        self.inner.encode(agent, event)
    }
}

/// Splits packed RESP commands back into argument lists
fn parse_packed(mut buf: &[u8]) -> Vec<Vec<Vec<u8>>> {
    fn header(buf: &[u8], prefix: u8) -> (usize, &[u8]) {
        assert_eq!(buf[0], prefix);
        let end = buf.windows(2).position(|w| w == b"\r\n").unwrap();
        let n = std::str::from_utf8(&buf[1..end]).unwrap().parse().unwrap();
        (n, &buf[end + 2..])
    }

    let mut commands = Vec::new();
    while !buf.is_empty() {
        let (argc, rest) = header(buf, b'*');
        buf = rest;
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let (len, rest) = header(buf, b'$');
            args.push(rest[..len].to_vec());
            buf = &rest[len + 2..];
        }
        commands.push(args);
    }
    commands
}
