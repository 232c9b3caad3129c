//! Error types surfaced to callers of the caching runner.
//!
//! Store failures never show up here: the result store absorbs them and
//! degrades to a cache miss. Everything in [`CacheError`] is something the
//! caller has to act on.

use std::time::Duration;
use thiserror::Error;

use crate::agent::AgentError;

/// Errors returned by [`crate::runner::cached_agent_run`] and friends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Missing or invalid setup (connection target, retry tuning, cost table).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Malformed call arguments (empty prompt, bad history entry, bad option).
    #[error("validation error: {0}")]
    Validation(String),

    /// The rate-limit wait budget ran out. The caller may retry later.
    #[error("rate limit retries exhausted after {attempts} attempts ({waited:?} waited): {last}")]
    RateLimit {
        attempts: u32,
        waited: Duration,
        #[source]
        last: AgentError,
    },

    /// The transient-connection retry budget ran out.
    #[error("connection retries exhausted after {retries} retries: {last}")]
    Connection {
        retries: u32,
        #[source]
        last: AgentError,
    },

    /// Any other agent failure, passed through unchanged.
    #[error(transparent)]
    Agent(anyhow::Error),

    /// The call was cancelled before it completed. Nothing was persisted.
    #[error("call cancelled")]
    Cancelled,

    /// The synchronous entry point could not drive the call.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl CacheError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// True for failures where retrying the same call later may succeed.
    pub fn is_retryable_later(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::Connection { .. })
    }
}

/// Errors from the key-value store. Never propagated past the result store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("envelope serialization failed: {0}")]
    Serialization(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}
