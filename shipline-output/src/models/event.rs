/// Event and batch models
///
/// An [`Event`] is the unit the shipping pipeline hands to an output. A
/// [`Batch`] is an ordered group of events plus a completion callback that is
/// invoked exactly once with the batch outcome.
///
/// # Completion
///
/// `ack()` and `fail()` consume the batch, so the callback cannot fire twice.
/// A batch dropped without an explicit outcome reports [`BatchOutcome::Fail`].
///
/// # Example
///
/// ```no_run
/// use shipline_output::models::event::{Batch, BatchOutcome, Event};
/// use serde_json::json;
///
/// # async fn example() {
/// let event = Event::new().with_field("message", json!(1));
/// let (batch, outcome) = Batch::channel(vec![event]);
///
/// batch.ack();
/// assert_eq!(outcome.await.unwrap(), BatchOutcome::Ack);
/// # }
/// ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use tokio::sync::oneshot;

/// A single structured event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Time the event was produced
    pub timestamp: DateTime<Utc>,

    /// Environment attributes carried in the metadata envelope
    #[serde(default)]
    pub meta: Map<String, JsonValue>,

    /// Event body
    #[serde(default)]
    pub fields: Map<String, JsonValue>,
}

impl Event {
    /// Creates an empty event stamped with the current time
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    /// Creates an empty event with an explicit timestamp
    pub fn at(timestamp: DateTime<Utc>) -> Self {
        Event {
            timestamp,
            meta: Map::new(),
            fields: Map::new(),
        }
    }

    /// Adds a body field
    pub fn with_field(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Adds a metadata attribute
    pub fn with_meta(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.meta.insert(key.into(), value);
        self
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome reported to the pipeline for a whole batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchOutcome {
    /// Every event was delivered
    Ack,

    /// The batch was not delivered and may be re-submitted
    Fail,
}

impl fmt::Display for BatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchOutcome::Ack => write!(f, "ack"),
            BatchOutcome::Fail => write!(f, "fail"),
        }
    }
}

type Completion = Box<dyn FnOnce(BatchOutcome) + Send>;

/// Ordered group of events published and acknowledged as a unit
pub struct Batch {
    events: Vec<Event>,
    completion: Option<Completion>,
}

impl Batch {
    /// Creates a batch whose outcome nobody observes
    pub fn new(events: Vec<Event>) -> Self {
        Batch {
            events,
            completion: None,
        }
    }

    /// Creates a batch that invokes `callback` once with its outcome
    pub fn with_callback<F>(events: Vec<Event>, callback: F) -> Self
    where
        F: FnOnce(BatchOutcome) + Send + 'static,
    {
        Batch {
            events,
            completion: Some(Box::new(callback)),
        }
    }

    /// Creates a batch plus a receiver resolving to its outcome
    pub fn channel(events: Vec<Event>) -> (Self, oneshot::Receiver<BatchOutcome>) {
        let (tx, rx) = oneshot::channel();
        let batch = Batch::with_callback(events, move |outcome| {
            let _ = tx.send(outcome);
        });
        (batch, rx)
    }

    /// Events in publication order
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Number of events in the batch
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the batch carries no events
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Acknowledges the whole batch
    pub fn ack(mut self) {
        self.complete(BatchOutcome::Ack);
    }

    /// Fails the whole batch
    pub fn fail(mut self) {
        self.complete(BatchOutcome::Fail);
    }

    fn complete(&mut self, outcome: BatchOutcome) {
        if let Some(callback) = self.completion.take() {
            callback(outcome);
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        self.complete(BatchOutcome::Fail);
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("events", &self.events.len())
            .field("pending", &self.completion.is_some())
            .finish()
    }
}
