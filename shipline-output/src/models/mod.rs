/// Data models shared by the output and its callers
///
/// - `event`: events, batches and batch completion

pub mod event;

pub use event::{Batch, BatchOutcome, Event};
