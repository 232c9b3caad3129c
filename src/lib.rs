// Library exports for llm-caching
// The binary and the integration tests both build on these modules

pub mod agent;
pub mod cache;
pub mod config;
pub mod costs;
pub mod errors;
pub mod expense;
pub mod retry;
pub mod runner;

pub use agent::{Agent, AgentError, AgentResponse, Message, ModelSettings, TokenUsage};
pub use cache::{CacheKey, ExtraOptions};
pub use errors::CacheError;
pub use runner::{cached_agent_run, cached_agent_run_sync, AgentRunResult, CachingRunner, RunOptions};
