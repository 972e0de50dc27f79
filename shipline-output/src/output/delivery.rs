/// Delivery strategies
///
/// A [`Delivery`] turns an ordered sequence of encoded payloads into Redis
/// commands on the active connection. Two strategies exist, picked once from
/// the `datatype` option:
///
/// - [`QueuePush`]: `RPUSH key payload` per event, so a consumer popping with
///   `LPOP`/`BLPOP` sees events in publication order
/// - [`ChannelPublish`]: `PUBLISH key payload` per event; the subscriber
///   count in the reply is informational, zero is not an error
///
/// # Pipelining
///
/// ```text
/// payloads ──chunks(bulk_max_size)──> window 1 ──> RPUSH × n ──> n replies
///                                     window 2 ──> RPUSH × n ──> n replies
///                                     ...
/// ```
///
/// Each window is written back-to-back and its replies are read in order.
/// Every reply of a window is consumed even after an error reply, so the
/// connection is never left with unread replies; the first error aborts the
/// batch and later windows are not sent.

use async_trait::async_trait;
use redis::Value;
use std::time::Duration;
use thiserror::Error;

use super::config::{DataType, RedisOutputConfig};
use super::connection::BrokerConnection;

/// Delivery errors
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Redis answered a command with an error reply
    #[error("Redis rejected {command} in window starting at event {offset}: {reason}")]
    Rejected {
        command: &'static str,
        offset: usize,
        reason: String,
    },

    /// The connection failed while the window was in flight
    #[error("Connection lost during {command} window starting at event {offset}: {reason}")]
    ConnectionLost {
        command: &'static str,
        offset: usize,
        reason: String,
    },

    /// A reply had a type the command never returns
    #[error("Unexpected reply to {command} for event {index}: {reply}")]
    UnexpectedReply {
        command: &'static str,
        index: usize,
        reply: String,
    },

    /// A window did not complete in time
    #[error("{command} window starting at event {offset} timed out after {timeout:?}")]
    Timeout {
        command: &'static str,
        offset: usize,
        timeout: Duration,
    },
}

/// Summary of a delivered batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Commands acknowledged by Redis
    pub commands: usize,

    /// Pipelined windows written
    pub windows: usize,

    /// Payload bytes written
    pub bytes: usize,

    /// Sum of subscriber counts (channel mode)
    pub receivers: u64,
}

/// Strategy translating payloads into Redis commands
#[async_trait]
pub trait Delivery: Send + Sync {
    /// Redis command issued per payload
    fn command(&self) -> &'static str;

    /// Sends `payloads` in order over `connection`
    ///
    /// # Errors
    ///
    /// Returns the first failure; the caller must treat the connection as
    /// unusable afterwards.
    async fn deliver(
        &self,
        connection: &mut BrokerConnection,
        payloads: &[Vec<u8>],
    ) -> Result<DeliveryReport, DeliveryError>;
}

/// Builds the strategy selected by `datatype`
pub fn strategy(config: &RedisOutputConfig) -> Box<dyn Delivery> {
    let window = Window {
        key: config.key.clone(),
        size: config.bulk_max_size.max(1),
        timeout: config.timeout,
    };
    match config.datatype {
        DataType::List => Box::new(QueuePush { window }),
        DataType::Channel => Box::new(ChannelPublish { window }),
    }
}

/// Shared windowing of one command over a payload sequence
struct Window {
    key: String,
    size: usize,
    timeout: Duration,
}

impl Window {
    async fn send(
        &self,
        connection: &mut BrokerConnection,
        command: &'static str,
        payloads: &[Vec<u8>],
        accept: fn(&Value) -> Option<u64>,
    ) -> Result<DeliveryReport, DeliveryError> {
        let mut report = DeliveryReport::default();

        for (window_index, chunk) in payloads.chunks(self.size).enumerate() {
            let offset = window_index * self.size;

            let mut pipe = redis::pipe();
            for payload in chunk {
                pipe.cmd(command).arg(&self.key).arg(payload.as_slice());
            }

            let replies: Vec<Value> =
                match tokio::time::timeout(self.timeout, pipe.query_async(connection)).await {
                    Ok(Ok(replies)) => replies,
                    Ok(Err(e)) => {
                        return Err(classify(command, offset, e));
                    }
                    Err(_) => {
                        return Err(DeliveryError::Timeout {
                            command,
                            offset,
                            timeout: self.timeout,
                        });
                    }
                };

            if replies.len() != chunk.len() {
                return Err(DeliveryError::UnexpectedReply {
                    command,
                    index: offset + replies.len().min(chunk.len()),
                    reply: format!("{} replies for {} commands", replies.len(), chunk.len()),
                });
            }

            for (i, reply) in replies.iter().enumerate() {
                match accept(reply) {
                    Some(n) => report.receivers += n,
                    None => {
                        return Err(DeliveryError::UnexpectedReply {
                            command,
                            index: offset + i,
                            reply: format!("{:?}", reply),
                        });
                    }
                }
            }

            report.commands += chunk.len();
            report.windows += 1;
            report.bytes += chunk.iter().map(Vec::len).sum::<usize>();
        }

        Ok(report)
    }
}

fn classify(command: &'static str, offset: usize, err: redis::RedisError) -> DeliveryError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
        DeliveryError::ConnectionLost {
            command,
            offset,
            reason: err.to_string(),
        }
    } else {
        DeliveryError::Rejected {
            command,
            offset,
            reason: err.to_string(),
        }
    }
}

/// Queue Push: append each payload to the tail of the list `key`
pub struct QueuePush {
    window: Window,
}

#[async_trait]
impl Delivery for QueuePush {
    fn command(&self) -> &'static str {
        "RPUSH"
    }

    async fn deliver(
        &self,
        connection: &mut BrokerConnection,
        payloads: &[Vec<u8>],
    ) -> Result<DeliveryReport, DeliveryError> {
        let mut report = self
            .window
            .send(connection, self.command(), payloads, |reply| match reply {
                Value::Int(_) | Value::Okay | Value::Status(_) => Some(0),
                _ => None,
            })
            .await?;
        report.receivers = 0;
        Ok(report)
    }
}

/// Channel Publish: broadcast each payload on the channel `key`
pub struct ChannelPublish {
    window: Window,
}

#[async_trait]
impl Delivery for ChannelPublish {
    fn command(&self) -> &'static str {
        "PUBLISH"
    }

    async fn deliver(
        &self,
        connection: &mut BrokerConnection,
        payloads: &[Vec<u8>],
    ) -> Result<DeliveryReport, DeliveryError> {
        self.window
            .send(connection, self.command(), payloads, |reply| match reply {
                Value::Int(n) => Some((*n).max(0) as u64),
                _ => None,
            })
            .await
    }
}
