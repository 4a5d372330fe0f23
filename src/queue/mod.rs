//! Durable queue of uploads that failed for lack of connectivity.

mod drainer;
mod store;
mod upload;

pub use drainer::{DrainReport, Drainer};
pub use store::QueueStore;
pub use upload::{FileBlob, NewUpload, QueuedUpload, RemoveOutcome};
