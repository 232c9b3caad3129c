//! Cached agent calls
//!
//! [`CachingRunner`] ties the pieces together: it derives the cache key,
//! serves hits from the store, and on a miss invokes the agent through the
//! retry controller, prices the call, records the expense and stores the
//! result. [`cached_agent_run`] and [`cached_agent_run_sync`] build a runner
//! for a single call.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{
    Agent, DefaultMessageConverter, HistoryEntry, MessageConverter, ModelSettings, TokenUsage,
};
use crate::cache::key::{build_key, ExtraOptions, KeyMaterial};
use crate::cache::redis::RedisStore;
use crate::cache::result_store::{CacheStats, ResultStore};
use crate::cache::store::{KeyValueStore, MemoryStore};
use crate::cache::CachedEnvelope;
use crate::config::Config;
use crate::costs::{self, ModelCosts, TokenCounts};
use crate::errors::CacheError;
use crate::expense::{ExpenseRecorder, NoopExpenseRecorder};
use crate::retry::{RetryController, RetryPolicy};

/// What a cached call hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunResult<T> {
    pub output: T,
    pub usage: TokenUsage,
    pub model: String,
    /// Cost of producing the output. On a hit this is the cost recorded when
    /// the result was first computed; nothing is charged again.
    pub cost: f64,
    /// True when served from the store
    pub cached: bool,
}

/// Options for one call.
///
/// `redis_url`, `config` and `store` only matter to [`cached_agent_run`],
/// which builds a runner from them. A [`CachingRunner`] uses its own store.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub history: Vec<HistoryEntry>,
    pub settings: ModelSettings,
    pub extra_options: ExtraOptions,
    /// Overrides the configured TTL
    pub ttl: Option<Duration>,
    /// Overrides the configured backoff
    pub retry: Option<RetryPolicy>,
    pub expense_recorder: Option<Arc<dyn ExpenseRecorder>>,
    pub converter: Option<Arc<dyn MessageConverter>>,
    /// Merged over the configured cost overrides
    pub cost_overrides: HashMap<String, ModelCosts>,
    /// Bypass lookup and persistence; retries, pricing and expense
    /// recording still happen
    pub skip_cache: bool,
    pub cancel: Option<CancellationToken>,
    pub redis_url: Option<String>,
    pub config: Option<Config>,
    pub store: Option<Arc<dyn KeyValueStore>>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(mut self, history: impl IntoIterator<Item = impl Into<HistoryEntry>>) -> Self {
        self.history = history.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_settings(mut self, settings: ModelSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_extra_options(mut self, extra_options: ExtraOptions) -> Self {
        self.extra_options = extra_options;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_expense_recorder(mut self, recorder: Arc<dyn ExpenseRecorder>) -> Self {
        self.expense_recorder = Some(recorder);
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn MessageConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn with_cost_override(mut self, model_name: impl Into<String>, costs: ModelCosts) -> Self {
        self.cost_overrides.insert(model_name.into(), costs);
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }
}

/// Long-lived handle for cached agent calls.
///
/// Cloning is cheap; clones share the store connection, the cost table and
/// the cache counters.
#[derive(Clone)]
pub struct CachingRunner {
    results: ResultStore,
    ttl: Duration,
    retry: RetryPolicy,
    costs: Arc<HashMap<String, ModelCosts>>,
    recorder: Arc<dyn ExpenseRecorder>,
    converter: Arc<dyn MessageConverter>,
}

impl CachingRunner {
    /// Builds a runner over an existing store.
    pub fn new(store: Arc<dyn KeyValueStore>, config: &Config) -> Result<Self, CacheError> {
        config.validate()?;
        Ok(Self {
            results: ResultStore::new(store, config.store.key_prefix.clone()),
            ttl: config.ttl()?,
            retry: config.retry.policy()?,
            costs: Arc::new(config.costs.clone()),
            recorder: Arc::new(NoopExpenseRecorder),
            converter: Arc::new(DefaultMessageConverter),
        })
    }

    /// Builds a runner over Redis. No connection is made until the first call.
    pub fn connect(config: &Config, redis_url: Option<&str>) -> Result<Self, CacheError> {
        let url = config.resolve_connection(redis_url)?;
        let store = RedisStore::open(&url, config.store_timeout()?)?;
        info!(target_url = %store.target(), "Using Redis result store");
        Self::new(Arc::new(store), config)
    }

    pub fn with_expense_recorder(mut self, recorder: Arc<dyn ExpenseRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_converter(mut self, converter: Arc<dyn MessageConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn result_store(&self) -> &ResultStore {
        &self.results
    }

    pub fn stats(&self) -> CacheStats {
        self.results.stats()
    }

    /// Runs `agent` on `prompt`, serving the result from the store when an
    /// equivalent call was already made.
    pub async fn run<A: Agent>(
        &self,
        agent: &A,
        prompt: &str,
        task_name: &str,
        options: &RunOptions,
    ) -> Result<AgentRunResult<A::Output>, CacheError> {
        validate_request(prompt, task_name)?;
        let model_name = agent.model_name().to_string();

        let ttl = options.ttl.unwrap_or(self.ttl);
        if ttl.is_zero() {
            return Err(CacheError::configuration("ttl must be greater than zero"));
        }
        let retry = options.retry.unwrap_or(self.retry);
        retry.validate()?;

        let converter = options.converter.as_ref().unwrap_or(&self.converter);
        let history = converter.convert(&options.history)?;

        let key = if options.skip_cache {
            None
        } else {
            let identity = agent.identity();
            Some(build_key(&KeyMaterial {
                model_name: &model_name,
                agent_identity: &identity,
                prompt,
                history: &history,
                task_name,
                settings: &options.settings,
                extra_options: &options.extra_options,
            })?)
        };

        if let Some(key) = &key {
            let lookup = self.results.get::<A::Output>(key);
            if let Some(envelope) = cancellable(options.cancel.as_ref(), lookup).await? {
                debug!(key = %key, task = task_name, "Serving cached result");
                return Ok(AgentRunResult {
                    output: envelope.output,
                    usage: envelope.usage,
                    model: model_name,
                    cost: envelope.cost,
                    cached: true,
                });
            }
        }

        // Price lookup happens before the call so an unknown model fails
        // without spending anything.
        let overrides = self.merged_costs(&options.cost_overrides);
        let pricing = costs::lookup(&model_name, Some(&overrides))?;

        let mut controller = RetryController::new(retry);
        if let Some(token) = &options.cancel {
            controller = controller.with_cancellation(token);
        }
        let response = controller
            .run(|| agent.invoke(prompt, &history, &options.settings))
            .await?;

        let cost = pricing.cost_of(&TokenCounts::from_usage(&response.usage));
        let recorder = options.expense_recorder.as_ref().unwrap_or(&self.recorder);
        if let Err(e) = recorder.record(&model_name, task_name, cost).await {
            warn!(model = %model_name, task = task_name, error = %e, "Expense recorder failed");
        }

        if let Some(key) = &key {
            if options.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                return Err(CacheError::Cancelled);
            }
            let envelope = CachedEnvelope::new(
                model_name.as_str(),
                task_name,
                ttl.as_secs(),
                cost,
                response.usage.clone(),
                &response.output,
            );
            if self.results.set(key, &envelope, ttl).await {
                info!(key = %key, task = task_name, cost, "Stored fresh result");
            }
        }

        Ok(AgentRunResult {
            output: response.output,
            usage: response.usage,
            model: model_name,
            cost,
            cached: false,
        })
    }

    fn merged_costs(&self, per_call: &HashMap<String, ModelCosts>) -> HashMap<String, ModelCosts> {
        let mut merged = (*self.costs).clone();
        merged.extend(per_call.iter().map(|(name, costs)| (name.clone(), *costs)));
        merged
    }
}

/// Runs one cached agent call with a runner built from `options`.
///
/// The connection target comes from `options.redis_url`, then
/// `LLM_CACHE_REDIS_URL`, then the config file. An injected `options.store`
/// replaces Redis entirely. With `skip_cache` no store is needed.
pub async fn cached_agent_run<A: Agent>(
    agent: &A,
    prompt: &str,
    task_name: &str,
    options: RunOptions,
) -> Result<AgentRunResult<A::Output>, CacheError> {
    validate_request(prompt, task_name)?;

    let config = match &options.config {
        Some(config) => config.clone(),
        None => Config::load().map_err(|e| CacheError::configuration(format!("{e:#}")))?,
    };

    let runner = match (&options.store, options.skip_cache) {
        (Some(store), _) => CachingRunner::new(store.clone(), &config)?,
        (None, true) => CachingRunner::new(Arc::new(MemoryStore::new()), &config)?,
        (None, false) => CachingRunner::connect(&config, options.redis_url.as_deref())?,
    };

    runner.run(agent, prompt, task_name, &options).await
}

/// Blocking variant of [`cached_agent_run`].
///
/// Drives the call on a private current-thread runtime. Must not be called
/// from inside an async runtime.
pub fn cached_agent_run_sync<A: Agent>(
    agent: &A,
    prompt: &str,
    task_name: &str,
    options: RunOptions,
) -> Result<AgentRunResult<A::Output>, CacheError> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(CacheError::Runtime(
            "cached_agent_run_sync cannot block inside an async runtime; use cached_agent_run"
                .to_string(),
        ));
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| CacheError::Runtime(format!("failed to start runtime: {e}")))?;

    runtime.block_on(cached_agent_run(agent, prompt, task_name, options))
}

fn validate_request(prompt: &str, task_name: &str) -> Result<(), CacheError> {
    if prompt.trim().is_empty() {
        return Err(CacheError::validation("prompt must not be empty"));
    }
    if task_name.trim().is_empty() {
        return Err(CacheError::validation("task name must not be empty"));
    }
    Ok(())
}

async fn cancellable<O>(
    token: Option<&CancellationToken>,
    fut: impl Future<Output = O>,
) -> Result<O, CacheError> {
    match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(CacheError::Cancelled),
            out = fut => Ok(out),
        },
        None => Ok(fut.await),
    }
}
