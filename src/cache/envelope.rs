//! Serialized form of a cached agent result.
//!
//! Envelopes are JSON documents with a `format` marker and a `version`
//! number. Anything that does not carry the expected marker and version is
//! rejected so the caller can treat it as a miss.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::agent::TokenUsage;
use crate::errors::StoreError;

pub const ENVELOPE_FORMAT: &str = "llm-caching/envelope";
pub const ENVELOPE_VERSION: u32 = 1;

/// One stored result plus its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEnvelope<T> {
    pub format: String,
    pub version: u32,
    pub model: String,
    pub task_name: String,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    /// Cost recorded when the result was produced
    pub cost: f64,
    pub usage: TokenUsage,
    pub output: T,
}

#[derive(Deserialize)]
struct EnvelopeHeader {
    format: String,
    version: u32,
}

/// Envelope fields that do not depend on the output type. Used when
/// inspecting entries without knowing what the agent returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeSummary {
    pub model: String,
    pub task_name: String,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub cost: f64,
    pub usage: TokenUsage,
}

impl<T> CachedEnvelope<T> {
    pub fn new(
        model: impl Into<String>,
        task_name: impl Into<String>,
        ttl_secs: u64,
        cost: f64,
        usage: TokenUsage,
        output: T,
    ) -> Self {
        Self {
            format: ENVELOPE_FORMAT.to_string(),
            version: ENVELOPE_VERSION,
            model: model.into(),
            task_name: task_name.into(),
            created_at: Utc::now(),
            ttl_secs,
            cost,
            usage,
            output,
        }
    }
}

impl<T: Serialize> CachedEnvelope<T> {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Serialization(format!("encode: {e}")))
    }
}

impl<T: DeserializeOwned> CachedEnvelope<T> {
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        check_header(bytes)?;
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(format!("decode: {e}")))
    }
}

impl EnvelopeSummary {
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        check_header(bytes)?;
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(format!("decode: {e}")))
    }
}

fn check_header(bytes: &[u8]) -> Result<(), StoreError> {
    let header: EnvelopeHeader = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::Serialization(format!("unreadable envelope: {e}")))?;
    if header.format != ENVELOPE_FORMAT {
        return Err(StoreError::Serialization(format!(
            "unexpected envelope format '{}'",
            header.format
        )));
    }
    if header.version != ENVELOPE_VERSION {
        return Err(StoreError::Serialization(format!(
            "unsupported envelope version {} (expected {ENVELOPE_VERSION})",
            header.version
        )));
    }
    Ok(())
}
