use serial_test::serial;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::common::*;
use llm_caching::agent::{HistoryEntry, Message, ModelSettings, TokenUsage};
use llm_caching::cache::key::{build_key, ExtraOptions, KeyMaterial};
use llm_caching::cache::store::{KeyValueStore, MemoryStore};
use llm_caching::config::{Config, REDIS_URL_ENV};
use llm_caching::costs::ModelCosts;
use llm_caching::retry::RetryPolicy;
use llm_caching::{cached_agent_run, cached_agent_run_sync, CacheError, CachingRunner, RunOptions};

fn memory_runner(store: &MemoryStore) -> CachingRunner {
    CachingRunner::new(Arc::new(store.clone()), &test_config()).unwrap()
}

#[tokio::test]
async fn test_fresh_result_round_trips_through_store() {
    let store = MemoryStore::new();
    let runner = memory_runner(&store);
    let agent = ScriptedAgent::answering("Paris");
    let options = RunOptions::new().with_history([HistoryEntry::record("user", "Let's talk geography")]);

    let fresh = runner
        .run(&agent, "Capital of France?", "geography", &options)
        .await
        .unwrap();
    let cached = runner
        .run(&agent, "Capital of France?", "geography", &options)
        .await
        .unwrap();

    assert!(!fresh.cached);
    assert!(cached.cached);
    assert_eq!(cached.output, fresh.output);
    assert_eq!(cached.usage, fresh.usage);
    assert_eq!(cached.cost, fresh.cost);
    assert_eq!(cached.model, TEST_MODEL);
    assert_eq!(fresh.output.history_len, 1);
    assert_eq!(agent.calls(), 1);
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_cost_computed_from_usage() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = ScriptedAgent::answering("ok")
        .with_usage(TokenUsage::with_cache(1_000_000, 1_000_000, None, Some(500_000)));

    let result = runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap();

    // 500k uncached input at $2 + 1M output at $8 + 500k cached input at $0.50
    assert_eq!(result.cost, 9.25);
}

#[tokio::test]
async fn test_cache_hit_skips_expense_recording() {
    let recorder = shared(CountingRecorder::default());
    let runner = memory_runner(&MemoryStore::new()).with_expense_recorder(recorder.clone());
    let agent = ScriptedAgent::answering("ok");

    runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap();
    runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap();

    assert_eq!(recorder.count(), 1);
    assert_eq!(
        recorder.last(),
        Some((TEST_MODEL.to_string(), "t".to_string(), 2.0))
    );
}

#[tokio::test]
async fn test_per_call_recorder_overrides_runner_recorder() {
    let runner_recorder = shared(CountingRecorder::default());
    let call_recorder = shared(CountingRecorder::default());
    let runner = memory_runner(&MemoryStore::new()).with_expense_recorder(runner_recorder.clone());

    let options = RunOptions::new().with_expense_recorder(call_recorder.clone());
    runner
        .run(&ScriptedAgent::answering("ok"), "p", "t", &options)
        .await
        .unwrap();

    assert_eq!(runner_recorder.count(), 0);
    assert_eq!(call_recorder.count(), 1);
}

#[tokio::test]
async fn test_expense_recorder_failure_is_absorbed() {
    let store = MemoryStore::new();
    let runner = memory_runner(&store).with_expense_recorder(Arc::new(FailingRecorder));

    let result = runner
        .run(&ScriptedAgent::answering("ok"), "p", "t", &RunOptions::new())
        .await
        .unwrap();

    assert_eq!(result.output.text, "ok");
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn test_store_failure_falls_through_to_agent() {
    let store = Arc::new(FailingStore::default());
    let runner = CachingRunner::new(store.clone(), &test_config()).unwrap();
    let agent = ScriptedAgent::answering("still works");

    let result = runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap();

    assert_eq!(result.output.text, "still works");
    assert!(!result.cached);
    assert_eq!(agent.calls(), 1);
    assert_eq!(store.gets.load(Ordering::SeqCst), 1);
    assert_eq!(store.sets.load(Ordering::SeqCst), 1);
    assert_eq!(runner.stats().read_errors, 1);
    assert_eq!(runner.stats().write_errors, 1);
}

#[tokio::test]
async fn test_corrupted_envelope_is_replaced() {
    let store = MemoryStore::new();
    let key = build_key(&KeyMaterial {
        model_name: TEST_MODEL,
        agent_identity: "",
        prompt: "p",
        history: &[],
        task_name: "t",
        settings: &ModelSettings::default(),
        extra_options: &ExtraOptions::new(),
    })
    .unwrap();
    store
        .set(
            &format!("llm-cache:{key}"),
            b"corrupted data".to_vec(),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let runner = memory_runner(&store);
    let agent = ScriptedAgent::answering("fresh");

    let first = runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap();
    let second = runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.output.text, "fresh");
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
async fn test_distinct_requests_do_not_share_entries() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = ScriptedAgent::answering("ok");

    runner.run(&agent, "p", "task-a", &RunOptions::new()).await.unwrap();
    runner.run(&agent, "p", "task-b", &RunOptions::new()).await.unwrap();
    runner.run(&agent, "other prompt", "task-a", &RunOptions::new()).await.unwrap();
    let hot = RunOptions::new().with_settings(ModelSettings {
        temperature: Some(0.9),
        ..Default::default()
    });
    runner.run(&agent, "p", "task-a", &hot).await.unwrap();

    assert_eq!(agent.calls(), 4);
}

#[tokio::test]
async fn test_agent_identity_is_part_of_key() {
    let runner = memory_runner(&MemoryStore::new());
    let terse = ScriptedAgent::answering("ok").with_identity("system: be terse");
    let verbose = ScriptedAgent::answering("ok").with_identity("system: be verbose");

    runner.run(&terse, "p", "t", &RunOptions::new()).await.unwrap();
    let result = runner.run(&verbose, "p", "t", &RunOptions::new()).await.unwrap();

    assert!(!result.cached);
    assert_eq!(verbose.calls(), 1);
}

#[tokio::test]
async fn test_skip_cache_still_records_expense() {
    let store = MemoryStore::new();
    let recorder = shared(CountingRecorder::default());
    let runner = memory_runner(&store).with_expense_recorder(recorder.clone());
    let agent = ScriptedAgent::answering("ok");
    let options = RunOptions::new().skip_cache();

    runner.run(&agent, "p", "t", &options).await.unwrap();
    runner.run(&agent, "p", "t", &options).await.unwrap();

    assert_eq!(agent.calls(), 2);
    assert_eq!(recorder.count(), 2);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_invalid_history_is_validation_error() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = ScriptedAgent::answering("ok");
    let options = RunOptions::new().with_history([HistoryEntry::record("narrator", "once upon")]);

    let err = runner.run(&agent, "p", "t", &options).await.unwrap_err();

    assert!(matches!(err, CacheError::Validation(_)));
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn test_empty_task_name_is_validation_error() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = ScriptedAgent::answering("ok");

    let err = runner.run(&agent, "p", "", &RunOptions::new()).await.unwrap_err();

    assert!(matches!(err, CacheError::Validation(_)));
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
async fn test_per_call_cost_override() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = ScriptedAgent::answering("ok").with_model("in-house-model");
    let options = RunOptions::new()
        .skip_cache()
        .with_cost_override("in-house-model", ModelCosts::new(1.0, 0.0, 0.0, 0.0));

    let result = runner.run(&agent, "p", "t", &options).await.unwrap();

    assert_eq!(result.cost, 1.0);
}

#[tokio::test(start_paused = true)]
async fn test_per_call_ttl_expires_entry() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = ScriptedAgent::answering("ok");
    let options = RunOptions::new().with_ttl(Duration::from_secs(10));

    runner.run(&agent, "p", "t", &options).await.unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    assert!(runner.run(&agent, "p", "t", &options).await.unwrap().cached);

    tokio::time::advance(Duration::from_secs(6)).await;
    assert!(!runner.run(&agent, "p", "t", &options).await.unwrap().cached);
    assert_eq!(agent.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_then_success_is_cached() {
    let store = MemoryStore::new();
    let recorder = shared(CountingRecorder::default());
    let runner = memory_runner(&store).with_expense_recorder(recorder.clone());
    let agent = ScriptedAgent::scripted(
        vec![Step::RateLimited, Step::RateLimited],
        Step::Answer("eventually"),
    );

    let result = runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap();

    assert_eq!(result.output.text, "eventually");
    assert_eq!(agent.calls(), 3);
    assert_eq!(recorder.count(), 1);
    assert_eq!(store.len().await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_exhaustion_persists_nothing() {
    let store = MemoryStore::new();
    let recorder = shared(CountingRecorder::default());
    let runner = memory_runner(&store).with_expense_recorder(recorder.clone());
    let agent = ScriptedAgent::scripted(Vec::new(), Step::RateLimited);

    let err = runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap_err();

    // Default backoff: sleeps of 1s, 2s and 4s fit in the 10s budget, 8s does not
    match err {
        CacheError::RateLimit { attempts, waited, .. } => {
            assert_eq!(attempts, 4);
            assert_eq!(waited, Duration::from_secs(7));
        }
        other => panic!("expected rate limit error, got {other:?}"),
    }
    assert!(store.is_empty().await);
    assert_eq!(recorder.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_per_call_retry_override() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = ScriptedAgent::scripted(Vec::new(), Step::RateLimited);
    let options = RunOptions::new().with_retry(RetryPolicy::from_secs(1.0, 3.0).unwrap());

    let err = runner.run(&agent, "p", "t", &options).await.unwrap_err();

    assert!(matches!(err, CacheError::RateLimit { attempts: 3, .. }));
    assert!(err.is_retryable_later());
}

#[tokio::test(start_paused = true)]
async fn test_connection_refused_twice_then_success() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = ScriptedAgent::scripted(vec![Step::Refused, Step::Refused], Step::Answer("connected"));

    let result = runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap();

    assert_eq!(result.output.text, "connected");
    assert_eq!(agent.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connection_budget_exhausted() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = ScriptedAgent::scripted(Vec::new(), Step::Timeout);

    let err = runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap_err();

    assert!(matches!(err, CacheError::Connection { retries: 3, .. }));
    assert_eq!(agent.calls(), 4);
}

#[tokio::test]
async fn test_unexpected_error_passes_through_unretried() {
    let store = MemoryStore::new();
    let runner = memory_runner(&store);
    let agent = ScriptedAgent::scripted(Vec::new(), Step::Fail("output failed schema validation"));

    let err = runner.run(&agent, "p", "t", &RunOptions::new()).await.unwrap_err();

    match err {
        CacheError::Agent(inner) => {
            assert_eq!(inner.to_string(), "output failed schema validation")
        }
        other => panic!("expected passthrough, got {other:?}"),
    }
    assert_eq!(agent.calls(), 1);
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_agent_call() {
    let store = MemoryStore::new();
    let runner = memory_runner(&store);
    let agent = ScriptedAgent::scripted(Vec::new(), Step::Hang);
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = runner
        .run(&agent, "p", "t", &RunOptions::new().with_cancellation(token))
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Cancelled));
    assert!(store.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff() {
    let store = MemoryStore::new();
    let runner = memory_runner(&store);
    let agent = ScriptedAgent::scripted(Vec::new(), Step::RateLimited);
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        canceller.cancel();
    });

    let err = runner
        .run(&agent, "p", "t", &RunOptions::new().with_cancellation(token))
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Cancelled));
    assert_eq!(agent.calls(), 2);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn test_cloned_runners_share_store_across_tasks() {
    let runner = memory_runner(&MemoryStore::new());
    let agent = shared(ScriptedAgent::answering("ok"));

    runner.run(agent.as_ref(), "p", "t", &RunOptions::new()).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let runner = runner.clone();
        let agent = agent.clone();
        handles.push(tokio::spawn(async move {
            runner
                .run(agent.as_ref(), "p", "t", &RunOptions::new())
                .await
                .map(|result| result.cached)
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap());
    }

    assert_eq!(agent.calls(), 1);
    assert_eq!(runner.stats().hits, 4);
}

#[tokio::test]
async fn test_free_function_with_injected_store() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let agent = ScriptedAgent::answering("ok");
    let options = || {
        RunOptions::new()
            .with_config(test_config())
            .with_store(store.clone())
            .with_history([Message::user("earlier")])
    };

    let first = cached_agent_run(&agent, "p", "t", options()).await.unwrap();
    let second = cached_agent_run(&agent, "p", "t", options()).await.unwrap();

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(agent.calls(), 1);
}

#[tokio::test]
#[serial]
async fn test_free_function_without_store_target_fails_fast() {
    std::env::remove_var(REDIS_URL_ENV);
    let agent = ScriptedAgent::answering("ok");

    let err = cached_agent_run(&agent, "p", "t", RunOptions::new().with_config(test_config()))
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Configuration(_)));
    assert_eq!(agent.calls(), 0);
}

#[tokio::test]
#[serial]
async fn test_free_function_skip_cache_needs_no_store() {
    std::env::remove_var(REDIS_URL_ENV);
    let agent = ScriptedAgent::answering("ok");

    let result = cached_agent_run(
        &agent,
        "p",
        "t",
        RunOptions::new().with_config(test_config()).skip_cache(),
    )
    .await
    .unwrap();

    assert!(!result.cached);
}

#[tokio::test]
async fn test_free_function_rejects_bad_scheme() {
    let agent = ScriptedAgent::answering("ok");
    let options = RunOptions::new()
        .with_config(test_config())
        .with_redis_url("memcached://localhost:11211");

    let err = cached_agent_run(&agent, "p", "t", options).await.unwrap_err();

    assert!(matches!(err, CacheError::Configuration(_)));
}

#[tokio::test]
async fn test_unreachable_redis_degrades_to_miss() {
    let mut config = test_config();
    config.store.timeout_ms = 500;
    let agent = ScriptedAgent::answering("ok");
    let options = RunOptions::new()
        .with_config(config)
        .with_redis_url("redis://127.0.0.1:1/0");

    let result = cached_agent_run(&agent, "p", "t", options).await.unwrap();

    assert_eq!(result.output.text, "ok");
    assert!(!result.cached);
}

#[test]
fn test_sync_variant_round_trip() {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let agent = ScriptedAgent::answering("blocking");
    let options = || {
        RunOptions::new()
            .with_config(test_config())
            .with_store(store.clone())
    };

    let first = cached_agent_run_sync(&agent, "p", "t", options()).unwrap();
    let second = cached_agent_run_sync(&agent, "p", "t", options()).unwrap();

    assert_eq!(first.output.text, "blocking");
    assert!(second.cached);
    assert_eq!(agent.calls(), 1);
}

#[test]
fn test_sync_variant_validates_before_io() {
    let agent = ScriptedAgent::answering("ok");
    let err = cached_agent_run_sync(&agent, "", "t", RunOptions::new().with_config(Config::default()))
        .unwrap_err();
    assert!(matches!(err, CacheError::Validation(_)));
}

#[tokio::test]
async fn test_zero_ttl_rejected_before_agent_runs() {
    let recorder = shared(CountingRecorder::default());
    let runner = memory_runner(&MemoryStore::new()).with_expense_recorder(recorder.clone());
    let agent = ScriptedAgent::answering("ok");

    let err = runner
        .run(&agent, "p", "t", &RunOptions::new().with_ttl(Duration::ZERO))
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::Configuration(_)));
    assert_eq!(agent.calls(), 0);
    assert_eq!(recorder.count(), 0);
}

#[tokio::test]
async fn test_huge_ttl_is_stored_without_panicking() {
    let store = MemoryStore::new();
    let runner = memory_runner(&store);
    let agent = ScriptedAgent::answering("forever");
    let options = RunOptions::new().with_ttl(Duration::MAX);

    let fresh = runner.run(&agent, "p", "t", &options).await.unwrap();
    let cached = runner.run(&agent, "p", "t", &options).await.unwrap();

    assert!(!fresh.cached);
    assert!(cached.cached);
    assert_eq!(agent.calls(), 1);
}
