//! Offline-resilience layer for a file-server client.
//!
//! Outbound requests are classified and served from a tiered local cache
//! (cache-first for static assets, network-first for listing endpoints,
//! stale-while-revalidate for everything else). Uploads that fail for lack of
//! connectivity are written to a durable queue and replayed, at least once,
//! when connectivity returns.

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod lifecycle;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod routes;
pub mod sync;
pub mod worker;

pub use worker::{OfflineWorker, UploadOutcome, WorkerSettings};
