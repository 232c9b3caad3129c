#![allow(dead_code)]

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use llm_caching::agent::{
    Agent, AgentError, AgentResponse, Message, ModelSettings, TokenUsage, TransientKind,
};
use llm_caching::cache::store::KeyValueStore;
use llm_caching::config::Config;
use llm_caching::costs::ModelCosts;
use llm_caching::errors::StoreError;
use llm_caching::expense::ExpenseRecorder;

/// Model name priced by [`test_config`]
pub const TEST_MODEL: &str = "scripted-model";

/// Structured output returned by [`ScriptedAgent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub prompt_len: usize,
    pub history_len: usize,
}

/// What the scripted agent does on one invocation
#[derive(Debug, Clone)]
pub enum Step {
    Answer(&'static str),
    RateLimited,
    Refused,
    Timeout,
    Fail(&'static str),
    /// Never completes
    Hang,
}

/// Agent that plays back a fixed script, then repeats `fallback`.
pub struct ScriptedAgent {
    model: String,
    identity: String,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    usage: TokenUsage,
    calls: AtomicU32,
}

impl ScriptedAgent {
    pub fn answering(text: &'static str) -> Self {
        Self::scripted(Vec::new(), Step::Answer(text))
    }

    pub fn scripted(steps: Vec<Step>, fallback: Step) -> Self {
        Self {
            model: TEST_MODEL.to_string(),
            identity: String::new(),
            script: Mutex::new(steps.into()),
            fallback,
            usage: TokenUsage::new(1_000_000, 0),
            calls: AtomicU32::new(0),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_identity(mut self, identity: &str) -> Self {
        self.identity = identity.to_string();
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Step {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    type Output = Answer;

    fn model_name(&self) -> &str {
        &self.model
    }

    fn identity(&self) -> String {
        self.identity.clone()
    }

    async fn invoke(
        &self,
        prompt: &str,
        history: &[Message],
        _settings: &ModelSettings,
    ) -> Result<AgentResponse<Answer>, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_step() {
            Step::Answer(text) => Ok(AgentResponse::new(
                Answer {
                    text: text.to_string(),
                    prompt_len: prompt.len(),
                    history_len: history.len(),
                },
                self.usage.clone(),
            )),
            Step::RateLimited => Err(AgentError::RateLimited("429 Too Many Requests".to_string())),
            Step::Refused => Err(AgentError::transient(
                TransientKind::ConnectionRefused,
                "connection refused",
            )),
            Step::Timeout => Err(AgentError::transient(TransientKind::Timeout, "request timed out")),
            Step::Fail(message) => Err(AgentError::Other(anyhow::anyhow!(message))),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Expense recorder that remembers every call
#[derive(Default)]
pub struct CountingRecorder {
    pub records: Mutex<Vec<(String, String, f64)>>,
}

impl CountingRecorder {
    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<(String, String, f64)> {
        self.records.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ExpenseRecorder for CountingRecorder {
    async fn record(&self, model_name: &str, task_name: &str, cost: f64) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap()
            .push((model_name.to_string(), task_name.to_string(), cost));
        Ok(())
    }
}

/// Expense recorder that always fails
pub struct FailingRecorder;

#[async_trait]
impl ExpenseRecorder for FailingRecorder {
    async fn record(&self, _model_name: &str, _task_name: &str, _cost: f64) -> anyhow::Result<()> {
        anyhow::bail!("expense database unavailable")
    }
}

/// Store whose every operation fails, counting the attempts
#[derive(Default)]
pub struct FailingStore {
    pub gets: AtomicU32,
    pub sets: AtomicU32,
}

fn unavailable() -> StoreError {
    StoreError::Connection("connection refused".to_string())
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        Err(unavailable())
    }

    async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), StoreError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        Err(unavailable())
    }

    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
        Err(unavailable())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        Err(unavailable())
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(unavailable())
    }
}

/// Default config plus pricing for [`TEST_MODEL`]: $2 per million input
/// tokens, $8 per million output tokens, $0.50 per million cached reads.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config
        .costs
        .insert(TEST_MODEL.to_string(), ModelCosts::new(2.0, 8.0, 0.0, 0.5));
    config
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}

/// Path of the compiled command line tool
pub fn cli_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_llm-caching"))
}
