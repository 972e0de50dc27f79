/// Stdin forwarder
///
/// Reads newline-delimited JSON, groups events into batches and publishes
/// them through a [`RedisOutputClient`]. The forwarder owns the retry
/// policy: a failed batch is re-submitted after an exponential backoff and a
/// fresh connect, up to `backoff.max_retries` times, then dropped.
///
/// ```text
/// stdin ──lines──> Event ──> pending ──batch_size / flush_interval──> publish
///                                                                      │
///                                      retry (backoff, reconnect) <────┘ on error
/// ```
///
/// # Example
///
/// ```no_run
/// use shipline_agent::config::AgentConfig;
/// use shipline_agent::forwarder::Forwarder;
/// use shipline_output::codec::AgentInfo;
/// use shipline_output::output::RedisOutputClient;
/// use tokio::io::BufReader;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = AgentConfig::load()?;
/// let agent = AgentInfo::new(config.agent.name.clone(), "0.1.0");
/// let client = RedisOutputClient::new(config.output.redis.clone(), agent)?;
///
/// let forwarder = Forwarder::new(client, &config, CancellationToken::new());
/// let summary = forwarder.run(BufReader::new(tokio::io::stdin())).await?;
/// println!("Delivered {} events", summary.events_acked);
/// # Ok(())
/// # }
/// ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use shipline_output::codec::TIMESTAMP_KEY;
use shipline_output::models::event::{Batch, Event};
use shipline_output::output::{ConnectionState, OutputError, RedisOutputClient};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, AgentSettings, BackoffSettings};

/// Totals for one forwarder run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ForwardSummary {
    /// Input lines read
    pub lines: u64,

    /// Lines that were not JSON objects
    pub skipped: u64,

    /// Batches delivered
    pub batches: u64,

    /// Events delivered
    pub events_acked: u64,

    /// Events given up on
    pub events_dropped: u64,
}

/// Outcome of sending one batch, retries included
enum SendOutcome {
    Delivered,
    Dropped,
    Cancelled,
}

/// Batches stdin events into a Redis output
pub struct Forwarder {
    client: RedisOutputClient,
    settings: AgentSettings,
    backoff: BackoffSettings,
    cancel: CancellationToken,
    summary: ForwardSummary,
}

impl Forwarder {
    pub fn new(client: RedisOutputClient, config: &AgentConfig, cancel: CancellationToken) -> Self {
        Forwarder {
            client,
            settings: config.agent.clone(),
            backoff: config.backoff.clone(),
            cancel,
            summary: ForwardSummary::default(),
        }
    }

    /// Forwards every line of `reader` until EOF or cancellation
    ///
    /// Pending events are flushed at EOF. On cancellation nothing more is
    /// sent. The client is closed before returning.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the input fails.
    pub async fn run<R>(mut self, reader: R) -> anyhow::Result<ForwardSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut pending: Vec<Event> = Vec::with_capacity(self.settings.batch_size);

        let flush_interval = self.settings.flush_interval;
        let mut ticker = interval_at(Instant::now() + flush_interval, flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    if !pending.is_empty() {
                        tracing::warn!(events = pending.len(), "Shutdown requested, discarding pending events");
                        self.summary.events_dropped += pending.len() as u64;
                    }
                    break Ok(());
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        self.summary.lines += 1;
                        match parse_line(&line, &self.settings.tags) {
                            Some(event) => pending.push(event),
                            None => self.summary.skipped += 1,
                        }
                        if pending.len() >= self.settings.batch_size {
                            let events = std::mem::take(&mut pending);
                            if let SendOutcome::Cancelled = self.send(events).await {
                                break Ok(());
                            }
                            ticker.reset();
                        }
                    }
                    Ok(None) => {
                        if !pending.is_empty() {
                            let events = std::mem::take(&mut pending);
                            self.send(events).await;
                        }
                        break Ok(());
                    }
                    Err(e) => break Err(anyhow::Error::new(e).context("Failed to read input")),
                },
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        let events = std::mem::take(&mut pending);
                        if let SendOutcome::Cancelled = self.send(events).await {
                            break Ok(());
                        }
                    }
                }
            }
        };

        self.client.close();

        let stats = self.client.stats().snapshot();
        tracing::info!(
            lines = self.summary.lines,
            skipped = self.summary.skipped,
            batches = self.summary.batches,
            events_acked = self.summary.events_acked,
            events_dropped = self.summary.events_dropped,
            connects = stats.connects,
            bytes_written = stats.bytes_written,
            "Forwarder stopped"
        );

        result.map(|()| self.summary)
    }

    /// Sends one batch, re-submitting retryable failures with backoff
    async fn send(&mut self, events: Vec<Event>) -> SendOutcome {
        let count = events.len() as u64;
        let mut retries = 0;

        loop {
            let error = match self.attempt(events.clone()).await {
                Ok(()) => {
                    self.summary.batches += 1;
                    self.summary.events_acked += count;
                    return SendOutcome::Delivered;
                }
                Err(e) => e,
            };

            if self.cancel.is_cancelled() {
                self.summary.events_dropped += count;
                return SendOutcome::Cancelled;
            }

            if !error.is_retryable() {
                tracing::error!(events = count, error = %error, "Dropping batch, error is not retryable");
                self.summary.events_dropped += count;
                return SendOutcome::Dropped;
            }

            retries += 1;
            if retries > self.backoff.max_retries {
                tracing::error!(
                    events = count,
                    retries = self.backoff.max_retries,
                    error = %error,
                    "Dropping batch after exhausting retries"
                );
                self.summary.events_dropped += count;
                return SendOutcome::Dropped;
            }

            let delay = self.backoff.delay(retries);
            tracing::warn!(
                events = count,
                attempt = retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Batch failed, retrying..."
            );

            if !sleep_unless_cancelled(&self.cancel, delay).await {
                self.summary.events_dropped += count;
                return SendOutcome::Cancelled;
            }
        }
    }

    /// Connects if needed, then publishes once
    async fn attempt(&mut self, events: Vec<Event>) -> Result<(), OutputError> {
        if self.client.state() != ConnectionState::Connected {
            self.client.connect(&self.cancel).await?;
        }
        self.client.publish(&self.cancel, Batch::new(events)).await?;
        Ok(())
    }
}

/// Sleeps unless cancelled first; returns false on cancellation
async fn sleep_unless_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Turns one input line into an event
///
/// Blank lines and lines that are not JSON objects yield `None`.
pub fn parse_line(line: &str, tags: &[String]) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let mut fields: Map<String, JsonValue> = match serde_json::from_str(line) {
        Ok(JsonValue::Object(fields)) => fields,
        Ok(other) => {
            tracing::warn!(kind = json_kind(&other), "Skipping input line that is not a JSON object");
            return None;
        }
        Err(e) => {
            tracing::warn!(error = %e, "Skipping input line that is not valid JSON");
            return None;
        }
    };

    let mut event = match fields.remove(TIMESTAMP_KEY) {
        Some(JsonValue::String(ts)) => match DateTime::parse_from_rfc3339(&ts) {
            Ok(ts) => Event::at(ts.with_timezone(&Utc)),
            Err(e) => {
                tracing::debug!(error = %e, timestamp = %ts, "Ignoring unparseable @timestamp");
                Event::new()
            }
        },
        _ => Event::new(),
    };
    event.fields = fields;
    if !tags.is_empty() {
        event = event.with_meta("tags", JsonValue::from(tags.to_vec()));
    }
    Some(event)
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use shipline_output::codec::AgentInfo;
    use shipline_output::output::RedisOutputConfig;
    use shipline_output::testing::{MockDialer, MockScript, RejectingCodec};
    use std::sync::Arc;

    fn config(batch_size: usize) -> AgentConfig {
        let mut config = AgentConfig::from_toml(
            r#"
            [agent]
            tags = ["edge"]

            [backoff]
            init = "100ms"
            max = "1s"
            max_retries = 2

            [output.redis]
            hosts = ["h:6379"]
            key = "k"
            "#,
        )
        .unwrap();
        config.agent.batch_size = batch_size;
        config
    }

    fn forwarder(dialer: MockDialer, config: &AgentConfig) -> Forwarder {
        let client = RedisOutputClient::with_dialer(
            config.output.redis.clone(),
            AgentInfo::new("shipline", "1.0.0"),
            Arc::new(dialer),
        )
        .unwrap();
        Forwarder::new(client, config, CancellationToken::new())
    }

    fn pushed(script: &MockScript) -> Vec<JsonValue> {
        script
            .list("k")
            .iter()
            .map(|p| serde_json::from_slice(p).unwrap())
            .collect()
    }

    #[test]
    fn test_parse_line_object() {
        let event = parse_line(r#"{"message":"hi","n":1}"#, &["a".to_string()]).unwrap();
        assert_eq!(event.fields["message"], "hi");
        assert_eq!(event.meta["tags"], json!(["a"]));
    }

    #[test]
    fn test_parse_line_rejects_non_objects() {
        assert!(parse_line("", &[]).is_none());
        assert!(parse_line("   ", &[]).is_none());
        assert!(parse_line("[1,2]", &[]).is_none());
        assert!(parse_line("\"text\"", &[]).is_none());
        assert!(parse_line("{not json", &[]).is_none());
    }

    #[test]
    fn test_parse_line_lifts_timestamp() {
        let line = r#"{"@timestamp":"2025-01-03T12:00:00.250+01:00","a":1}"#;
        let event = parse_line(line, &[]).unwrap();
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2025, 1, 3, 11, 0, 0).unwrap() + chrono::Duration::milliseconds(250)
        );
        assert!(!event.fields.contains_key("@timestamp"));
        assert_eq!(event.fields["a"], 1);
    }

    #[test]
    fn test_parse_line_ignores_bad_timestamp() {
        let before = Utc::now();
        let event = parse_line(r#"{"@timestamp":"yesterday"}"#, &[]).unwrap();
        assert!(event.timestamp >= before);
        assert!(event.fields.is_empty());
    }

    #[test]
    fn test_parse_line_without_tags_has_no_meta() {
        let event = parse_line(r#"{"a":1}"#, &[]).unwrap();
        assert!(event.meta.is_empty());
    }

    #[tokio::test]
    async fn test_batches_by_size_and_flushes_at_eof() {
        let script = MockScript::new();
        let config = config(2);
        let input = b"{\"message\":1}\n{\"message\":2}\nnot json\n{\"message\":3}\n";

        let summary = forwarder(MockDialer::new(script.clone()), &config)
            .run(&input[..])
            .await
            .unwrap();

        assert_eq!(summary.lines, 4);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.batches, 2);
        assert_eq!(summary.events_acked, 3);

        let messages: Vec<JsonValue> = pushed(&script).iter().map(|p| p["message"].clone()).collect();
        assert_eq!(messages, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(pushed(&script)[0]["@metadata"]["tags"], json!(["edge"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_resubmitted_after_reconnect() {
        let script = MockScript::new();
        script.reject_at(0);
        let config = config(10);

        let summary = forwarder(MockDialer::new(script.clone()), &config)
            .run(&b"{\"message\":1}\n{\"message\":2}\n"[..])
            .await
            .unwrap();

        assert_eq!(summary.events_acked, 2);
        assert_eq!(summary.events_dropped, 0);
        // the rejected window, then the full batch again
        assert_eq!(script.command_names(), vec!["RPUSH", "RPUSH", "RPUSH", "RPUSH"]);
        let messages: Vec<JsonValue> = pushed(&script).iter().map(|p| p["message"].clone()).collect();
        assert_eq!(messages[messages.len() - 2..], [json!(1), json!(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_dropped_after_max_retries() {
        let script = MockScript::new();
        let config = config(10);
        let dialer = MockDialer::new(script.clone()).unreachable("h");

        let summary = forwarder(dialer, &config)
            .run(&b"{\"message\":1}\n"[..])
            .await
            .unwrap();

        assert_eq!(summary.events_acked, 0);
        assert_eq!(summary.events_dropped, 1);
        assert!(script.commands().is_empty());
    }

    #[tokio::test]
    async fn test_unencodable_batch_is_dropped_without_retry() {
        let script = MockScript::new();
        let config = config(10);
        let client = RedisOutputClient::with_dialer(
            config.output.redis.clone(),
            AgentInfo::new("shipline", "1.0.0"),
            Arc::new(MockDialer::new(script.clone())),
        )
        .unwrap()
        .with_codec(Box::new(RejectingCodec::new("bad")));

        let summary = Forwarder::new(client, &config, CancellationToken::new())
            .run(&b"{\"bad\":1}\n"[..])
            .await
            .unwrap();

        assert_eq!(summary.events_dropped, 1);
        assert!(script.commands().is_empty());
    }

    #[tokio::test]
    async fn test_ecs_line_keeps_its_timestamp() {
        let script = MockScript::new();
        let config = config(10);

        let line = br#"{"@timestamp":"2025-01-03T12:00:00.000Z","@metadata":{"beat":"x","pipeline":"p"},"message":"hi"}"#;
        let summary = forwarder(MockDialer::new(script.clone()), &config)
            .run(&line[..])
            .await
            .unwrap();

        assert_eq!(summary.events_acked, 1);
        assert_eq!(summary.events_dropped, 0);
        let payload = &pushed(&script)[0];
        assert_eq!(payload["@timestamp"], "2025-01-03T12:00:00.000Z");
        assert_eq!(payload["@metadata"]["beat"], "shipline");
        assert_eq!(payload["@metadata"]["pipeline"], "p");
        assert_eq!(payload["message"], "hi");
    }

    #[tokio::test]
    async fn test_cancelled_before_input() {
        let script = MockScript::new();
        let config = config(10);
        let forwarder = forwarder(MockDialer::new(script.clone()), &config);
        forwarder.cancel.cancel();

        let summary = forwarder.run(&b"{\"message\":1}\n"[..]).await.unwrap();

        assert_eq!(summary, ForwardSummary::default());
        assert!(script.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushed_on_interval() {
        let script = MockScript::new();
        let config = config(100);
        let (mut writer, reader) = tokio::io::duplex(1024);

        let handle = tokio::spawn(
            forwarder(MockDialer::new(script.clone()), &config)
                .run(tokio::io::BufReader::new(reader)),
        );

        use tokio::io::AsyncWriteExt;
        writer.write_all(b"{\"message\":1}\n").await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(script.list("k").len(), 1);

        drop(writer);
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.batches, 1);
    }
}
