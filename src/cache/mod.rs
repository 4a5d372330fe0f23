//! Tiered response cache.
//!
//! Responses live in one of three tiers (static, api, general). Each tier is
//! pinned to a deploy version; a version bump creates a fresh generation and
//! activation deletes the old one wholesale. There is no per-entry expiry.

mod generation;
mod layer;
mod storage;

pub use generation::{CacheGeneration, CacheManifest, CachedEntry, Tier};
pub use layer::{CacheTiers, GenerationHandle};
pub use storage::{CacheStorage, SqliteStorage};
pub(crate) use storage::parse_datetime;
