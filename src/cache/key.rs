//! Deterministic cache keys for agent requests.
//!
//! Every field is written into a SHA-256 digest as `tag, length, bytes`, so
//! adjacent fields can never run into each other (`"ab" + "c"` and
//! `"a" + "bc"` hash differently). JSON-valued fields are written in a
//! canonical form with object keys sorted at every level.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use super::finite::ensure_finite;
use crate::agent::{Message, ModelSettings};
use crate::errors::CacheError;

/// Bumped whenever the envelope format or the key derivation changes, so old
/// entries are never read back by an incompatible version.
pub const KEY_VERSION: &str = "v1";

const NAMESPACE: &str = "llm-caching";

/// Opaque, fixed-length identifier of one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps an already-derived key (e.g. one printed by the CLI).
    pub fn parse(raw: &str) -> Result<Self, CacheError> {
        let digest = raw
            .strip_prefix(KEY_VERSION)
            .and_then(|rest| rest.strip_prefix(':'))
            .ok_or_else(|| CacheError::validation(format!("'{raw}' is not a {KEY_VERSION} cache key")))?;
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CacheError::validation(format!("'{raw}' has a malformed digest")));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied options that change the agent's output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraOptions(BTreeMap<String, serde_json::Value>);

impl ExtraOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an option. Values that do not serialize to JSON, or that hold NaN
    /// or infinite floats, are rejected instead of being coerced.
    pub fn insert<T: Serialize>(&mut self, name: impl Into<String>, value: T) -> Result<(), CacheError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CacheError::validation("option names must not be empty"));
        }
        let encoded = serde_json::to_value(&value).map_err(|e| {
            CacheError::validation(format!("option '{name}' is not serializable: {e}"))
        })?;
        ensure_finite(&value).map_err(|e| CacheError::validation(format!("option '{name}' {e}")))?;
        self.0.insert(name, encoded);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

/// Everything that determines an agent's answer.
#[derive(Debug, Clone, Copy)]
pub struct KeyMaterial<'a> {
    pub model_name: &'a str,
    /// Agent configuration fingerprint (system prompt, output schema, ...)
    pub agent_identity: &'a str,
    pub prompt: &'a str,
    pub history: &'a [Message],
    pub task_name: &'a str,
    pub settings: &'a ModelSettings,
    pub extra_options: &'a ExtraOptions,
}

/// Builds the cache key for one request.
pub fn build_key(material: &KeyMaterial<'_>) -> Result<CacheKey, CacheError> {
    let mut hasher = Sha256::new();
    write_field(&mut hasher, "ns", NAMESPACE.as_bytes());
    write_field(&mut hasher, "version", KEY_VERSION.as_bytes());
    write_field(&mut hasher, "model", material.model_name.as_bytes());
    write_field(&mut hasher, "agent", material.agent_identity.as_bytes());
    write_field(&mut hasher, "prompt", material.prompt.as_bytes());
    write_field(&mut hasher, "task", material.task_name.as_bytes());

    let settings = to_canonical_json("model settings", material.settings)?;
    write_field(&mut hasher, "settings", settings.as_bytes());

    write_field(
        &mut hasher,
        "history.len",
        &(material.history.len() as u64).to_le_bytes(),
    );
    for message in material.history {
        let encoded = to_canonical_json("history message", message)?;
        write_field(&mut hasher, "history.msg", encoded.as_bytes());
    }

    write_field(
        &mut hasher,
        "options.len",
        &(material.extra_options.len() as u64).to_le_bytes(),
    );
    for (name, value) in material.extra_options.iter() {
        write_field(&mut hasher, "option.name", name.as_bytes());
        let mut encoded = String::new();
        write_canonical(value, &mut encoded);
        write_field(&mut hasher, "option.value", encoded.as_bytes());
    }

    Ok(CacheKey(format!("{KEY_VERSION}:{:x}", hasher.finalize())))
}

fn write_field(hasher: &mut Sha256, tag: &str, bytes: &[u8]) {
    hasher.update((tag.len() as u64).to_le_bytes());
    hasher.update(tag.as_bytes());
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

fn to_canonical_json<T: Serialize>(what: &str, value: &T) -> Result<String, CacheError> {
    ensure_finite(value).map_err(|e| CacheError::validation(format!("{what} {e}")))?;
    let value = serde_json::to_value(value)
        .map_err(|e| CacheError::validation(format!("{what} is not serializable: {e}")))?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

/// JSON with object keys sorted at every depth, independent of how the
/// `serde_json` map type is configured.
fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
