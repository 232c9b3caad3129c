//! Expense recording for fresh (uncached) agent calls.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Receives the cost of every agent call that was not served from the cache.
///
/// Errors are logged by the runner and never affect the returned result.
#[async_trait]
pub trait ExpenseRecorder: Send + Sync {
    async fn record(&self, model_name: &str, task_name: &str, cost: f64) -> anyhow::Result<()>;
}

/// Discards every expense.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExpenseRecorder;

#[async_trait]
impl ExpenseRecorder for NoopExpenseRecorder {
    async fn record(&self, _model_name: &str, _task_name: &str, _cost: f64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Emits each expense as a structured log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingExpenseRecorder;

#[async_trait]
impl ExpenseRecorder for TracingExpenseRecorder {
    async fn record(&self, model_name: &str, task_name: &str, cost: f64) -> anyhow::Result<()> {
        tracing::info!(model = model_name, task = task_name, cost, "Recorded expense");
        Ok(())
    }
}

/// Adapts a plain closure.
pub struct FnExpenseRecorder<F>(F);

impl<F> FnExpenseRecorder<F>
where
    F: Fn(&str, &str, f64) -> anyhow::Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> ExpenseRecorder for FnExpenseRecorder<F>
where
    F: Fn(&str, &str, f64) -> anyhow::Result<()> + Send + Sync,
{
    async fn record(&self, model_name: &str, task_name: &str, cost: f64) -> anyhow::Result<()> {
        (self.0)(model_name, task_name, cost)
    }
}

/// Running totals per task, kept in memory.
#[derive(Debug, Clone, Default)]
pub struct ExpenseLedger {
    totals: Arc<Mutex<HashMap<String, TaskExpense>>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TaskExpense {
    pub calls: u64,
    pub cost: f64,
}

impl ExpenseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, task_name: &str) -> Option<TaskExpense> {
        self.totals.lock().ok()?.get(task_name).copied()
    }

    pub fn total_cost(&self) -> f64 {
        self.totals
            .lock()
            .map(|totals| totals.values().map(|t| t.cost).sum())
            .unwrap_or(0.0)
    }
}

#[async_trait]
impl ExpenseRecorder for ExpenseLedger {
    async fn record(&self, _model_name: &str, task_name: &str, cost: f64) -> anyhow::Result<()> {
        let mut totals = self
            .totals
            .lock()
            .map_err(|_| anyhow::anyhow!("expense ledger lock poisoned"))?;
        let entry = totals.entry(task_name.to_string()).or_default();
        entry.calls += 1;
        entry.cost += cost;
        Ok(())
    }
}
