//! Result caching for agent calls
//!
//! Keys are derived in [`key`], results are wrapped in a versioned
//! [`envelope`] and persisted through a [`result_store::ResultStore`] on top
//! of any [`store::KeyValueStore`]: Redis in production, [`store::MemoryStore`]
//! for tests and single-process use.

pub mod envelope;
mod finite;
pub mod key;
pub mod redis;
pub mod result_store;
pub mod store;

pub use envelope::{CachedEnvelope, EnvelopeSummary, ENVELOPE_VERSION};
pub use key::{build_key, CacheKey, ExtraOptions, KeyMaterial, KEY_VERSION};
pub use redis::{ConnectionTarget, RedisStore};
pub use result_store::{CacheStats, ResultStore};
pub use store::{KeyValueStore, MemoryStore};
