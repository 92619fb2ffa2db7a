// ABOUTME: Task correlation for convoke: match asynchronous replies to their requests.
// ABOUTME: Used by the router to track routed tasks and by connectors to delegate work.

pub mod correlator;
pub mod error;
pub mod sink;

pub use correlator::{Correlator, CorrelatorStats, PendingRequest, ResponseDisposition};
pub use error::CorrelationError;
pub use sink::EnvelopeSink;
