//! Conversion of caller-supplied history into agent messages.

use serde::{Deserialize, Serialize};

use super::{Message, Role};
use crate::errors::CacheError;

/// One entry of conversation history as a caller may supply it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryEntry {
    /// Already in agent format
    Message(Message),
    /// `{"role": "...", "content": "..."}`
    Record {
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        content: Option<String>,
    },
    /// Bare text, treated as a user message
    Text(String),
}

impl HistoryEntry {
    pub fn record(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self::Record {
            role: Some(role.into()),
            content: Some(content.into()),
        }
    }
}

impl From<Message> for HistoryEntry {
    fn from(message: Message) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for HistoryEntry {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Turns caller history into the messages handed to the agent.
pub trait MessageConverter: Send + Sync {
    fn convert(&self, entries: &[HistoryEntry]) -> Result<Vec<Message>, CacheError>;
}

/// Accepts typed messages, role/content records and bare strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMessageConverter;

impl MessageConverter for DefaultMessageConverter {
    fn convert(&self, entries: &[HistoryEntry]) -> Result<Vec<Message>, CacheError> {
        entries
            .iter()
            .enumerate()
            .map(|(index, entry)| convert_entry(index, entry))
            .collect()
    }
}

fn convert_entry(index: usize, entry: &HistoryEntry) -> Result<Message, CacheError> {
    match entry {
        HistoryEntry::Message(message) => {
            if message.content.is_empty() {
                return Err(CacheError::validation(format!(
                    "history entry {index} has no content blocks"
                )));
            }
            Ok(message.clone())
        }
        HistoryEntry::Record { role, content } => {
            let (Some(role), Some(content)) = (role.as_deref(), content.as_deref()) else {
                return Err(CacheError::validation(format!(
                    "history entry {index} must have string 'role' and 'content'"
                )));
            };
            if content.is_empty() {
                return Err(CacheError::validation(format!(
                    "history entry {index} has empty content"
                )));
            }
            let role = Role::parse(role).ok_or_else(|| {
                CacheError::validation(format!("history entry {index} has unhandled role '{role}'"))
            })?;
            Ok(Message::text(role, content))
        }
        HistoryEntry::Text(text) => Ok(Message::user(text.clone())),
    }
}
