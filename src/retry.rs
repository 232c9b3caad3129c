//! Retry and backoff around a single agent invocation.
//!
//! Two budgets are tracked separately:
//!
//! - rate limits back off exponentially until the cumulative wait would pass
//!   `max_wait`, then fail with [`CacheError::RateLimit`];
//! - transient connection failures retry up to `max_transient_retries` times
//!   with their own capped delay, then fail with [`CacheError::Connection`].
//!
//! Every other agent error is returned on the spot as [`CacheError::Agent`].

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent::AgentError;
use crate::errors::CacheError;

/// Backoff tuning for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First rate-limit sleep; doubles after every rate-limited attempt
    pub initial_wait: Duration,
    /// Ceiling for a single rate-limit sleep and for their sum
    pub max_wait: Duration,
    pub max_transient_retries: u32,
    /// Ceiling for a single transient-failure sleep
    pub max_transient_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(1),
            max_wait: Duration::from_secs(10),
            max_transient_retries: 3,
            max_transient_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Builds a policy from seconds, keeping the transient defaults.
    pub fn from_secs(initial_wait: f64, max_wait: f64) -> Result<Self, CacheError> {
        Self {
            initial_wait: secs_to_duration("initial_wait", initial_wait)?,
            max_wait: secs_to_duration("max_wait", max_wait)?,
            ..Self::default()
        }
        .validated()
    }

    pub fn with_transient(mut self, max_retries: u32, max_delay: Duration) -> Self {
        self.max_transient_retries = max_retries;
        self.max_transient_delay = max_delay;
        self
    }

    pub fn validate(&self) -> Result<(), CacheError> {
        if self.initial_wait.is_zero() {
            return Err(CacheError::configuration("initial_wait must be greater than zero"));
        }
        if self.max_wait < self.initial_wait {
            return Err(CacheError::configuration(format!(
                "max_wait ({:?}) must not be shorter than initial_wait ({:?})",
                self.max_wait, self.initial_wait
            )));
        }
        Ok(())
    }

    fn validated(self) -> Result<Self, CacheError> {
        self.validate()?;
        Ok(self)
    }

    /// Sleep before transient retry number `retry` (1-based).
    pub fn transient_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_wait
            .saturating_mul(factor)
            .min(self.max_transient_delay)
    }
}

/// Converts a seconds value from configuration, rejecting negative and
/// non-finite numbers.
pub fn secs_to_duration(name: &str, secs: f64) -> Result<Duration, CacheError> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        CacheError::configuration(format!("{name} must be a finite, non-negative number of seconds (got {secs})"))
    })
}

/// Where the controller currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPhase {
    Attempting,
    BackingOffRateLimit { wait: Duration },
    BackingOffTransient { retry: u32, delay: Duration },
    Succeeded,
    Failed,
}

/// Per-call bookkeeping. Never shared between calls.
#[derive(Debug)]
pub struct RetryState {
    pub phase: RetryPhase,
    pub attempts: u32,
    /// Next rate-limit sleep
    pub current_wait: Duration,
    pub rate_limit_waited: Duration,
    pub transient_retries: u32,
    pub last_error: Option<String>,
}

impl RetryState {
    fn new(policy: &RetryPolicy) -> Self {
        Self {
            phase: RetryPhase::Attempting,
            attempts: 0,
            current_wait: policy.initial_wait,
            rate_limit_waited: Duration::ZERO,
            transient_retries: 0,
            last_error: None,
        }
    }
}

/// What to do after a failed attempt.
enum Next {
    Sleep(Duration),
    Fail(CacheError),
}

/// Drives attempts through the backoff state machine.
pub struct RetryController<'a> {
    policy: RetryPolicy,
    cancel: Option<&'a CancellationToken>,
    state: RetryState,
}

impl<'a> RetryController<'a> {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: RetryState::new(&policy),
            policy,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn state(&self) -> &RetryState {
        &self.state
    }

    /// Calls `attempt` until it succeeds or a budget runs out.
    pub async fn run<T, F, Fut>(&mut self, mut attempt: F) -> Result<T, CacheError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        loop {
            self.state.phase = RetryPhase::Attempting;
            self.state.attempts += 1;

            let err = match self.cancellable(attempt()).await? {
                Ok(value) => {
                    self.state.phase = RetryPhase::Succeeded;
                    return Ok(value);
                }
                Err(err) => err,
            };
            self.state.last_error = Some(err.to_string());

            match self.on_failure(err) {
                Next::Sleep(delay) => self.cancellable(tokio::time::sleep(delay)).await?,
                Next::Fail(err) => {
                    self.state.phase = RetryPhase::Failed;
                    return Err(err);
                }
            }
        }
    }

    fn on_failure(&mut self, err: AgentError) -> Next {
        let policy = self.policy;
        let state = &mut self.state;

        match err {
            AgentError::RateLimited(_) => {
                let wait = state.current_wait.min(policy.max_wait);
                if state.rate_limit_waited + wait > policy.max_wait {
                    error!(
                        attempts = state.attempts,
                        waited = ?state.rate_limit_waited,
                        "Rate limit retries exhausted"
                    );
                    return Next::Fail(CacheError::RateLimit {
                        attempts: state.attempts,
                        waited: state.rate_limit_waited,
                        last: err,
                    });
                }
                info!(wait = ?wait, attempt = state.attempts, "Rate limit hit, backing off");
                state.phase = RetryPhase::BackingOffRateLimit { wait };
                state.rate_limit_waited += wait;
                state.current_wait = state.current_wait.saturating_mul(2).min(policy.max_wait);
                Next::Sleep(wait)
            }
            AgentError::Transient { kind, .. } => {
                if state.transient_retries >= policy.max_transient_retries {
                    error!(retries = state.transient_retries, %kind, "Connection retries exhausted");
                    return Next::Fail(CacheError::Connection {
                        retries: state.transient_retries,
                        last: err,
                    });
                }
                state.transient_retries += 1;
                let delay = policy.transient_delay(state.transient_retries);
                warn!(
                    %kind,
                    retry = state.transient_retries,
                    delay = ?delay,
                    "Transient agent failure, retrying"
                );
                state.phase = RetryPhase::BackingOffTransient {
                    retry: state.transient_retries,
                    delay,
                };
                Next::Sleep(delay)
            }
            AgentError::Other(err) => {
                error!(error = %err, "Agent failed with a non-retryable error");
                Next::Fail(CacheError::Agent(err))
            }
        }
    }

    async fn cancellable<O>(&self, fut: impl Future<Output = O>) -> Result<O, CacheError> {
        match self.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(CacheError::Cancelled),
                out = fut => Ok(out),
            },
            None => Ok(fut.await),
        }
    }
}
