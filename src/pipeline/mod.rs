//! Composable data-processing pipeline.
//!
//! A pipeline is an ordered chain of transforms applied to one JSON item or
//! a batch. Batches run with a bounded amount of concurrency; the error
//! policy decides whether one bad item aborts the rest or is collected and
//! reported alongside the successes. Concrete transform libraries live with
//! the callers; this module only provides the chassis.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{OpsError, Result};

#[async_trait]
pub trait Transform: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, item: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// First failing item aborts the whole batch.
    #[default]
    FailFast,
    /// Failing items are collected; the rest of the batch continues.
    ContinueOnError,
}

#[derive(Debug)]
pub struct ItemFailure {
    pub index: usize,
    pub step: String,
    pub error: OpsError,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<Option<Value>>,
    pub failures: Vec<ItemFailure>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_some()).count()
    }
}

pub struct Pipeline {
    name: String,
    steps: Vec<Arc<dyn Transform>>,
    error_policy: ErrorPolicy,
    concurrency: usize,
}

pub struct PipelineBuilder {
    name: String,
    steps: Vec<Arc<dyn Transform>>,
    error_policy: ErrorPolicy,
    concurrency: usize,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder {
            name: name.into(),
            steps: Vec::new(),
            error_policy: ErrorPolicy::default(),
            concurrency: 4,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one item through every step in order.
    pub async fn run(&self, item: Value) -> Result<Value> {
        let mut current = item;
        for step in &self.steps {
            current = step.apply(current).await.map_err(|e| {
                debug!("pipeline {} step {} failed: {}", self.name, step.name(), e);
                e
            })?;
        }
        Ok(current)
    }

    async fn run_indexed(&self, index: usize, item: Value) -> std::result::Result<Value, ItemFailure> {
        let mut current = item;
        for step in &self.steps {
            match step.apply(current).await {
                Ok(next) => current = next,
                Err(error) => {
                    return Err(ItemFailure {
                        index,
                        step: step.name().to_string(),
                        error,
                    })
                }
            }
        }
        Ok(current)
    }

    /// Run a batch with bounded concurrency under the configured error
    /// policy. Under FailFast, items already in flight still finish, but
    /// the first failure is returned as the error.
    pub async fn run_batch(&self, items: Vec<Value>) -> Result<BatchOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let runs = items.into_iter().enumerate().map(|(index, item)| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await;
                self.run_indexed(index, item).await
            }
        });

        let mut outcome = BatchOutcome::default();
        for result in join_all(runs).await {
            match result {
                Ok(value) => outcome.results.push(Some(value)),
                Err(failure) => {
                    if self.error_policy == ErrorPolicy::FailFast {
                        return Err(failure.error);
                    }
                    outcome.results.push(None);
                    outcome.failures.push(failure);
                }
            }
        }
        Ok(outcome)
    }
}

impl PipelineBuilder {
    /// Append a step. Step names must be unique within the pipeline.
    pub fn step(mut self, transform: Arc<dyn Transform>) -> Self {
        self.steps.push(transform);
        self
    }

    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.steps.is_empty() {
            return Err(OpsError::Config(format!(
                "pipeline {} has no steps",
                self.name
            )));
        }
        if self.concurrency == 0 {
            return Err(OpsError::Config(format!(
                "pipeline {} concurrency must be positive",
                self.name
            )));
        }
        for (i, step) in self.steps.iter().enumerate() {
            if step.name().is_empty() {
                return Err(OpsError::Config(format!(
                    "pipeline {} step {} has an empty name",
                    self.name, i
                )));
            }
            if self.steps[..i].iter().any(|s| s.name() == step.name()) {
                return Err(OpsError::Config(format!(
                    "pipeline {} has duplicate step {}",
                    self.name,
                    step.name()
                )));
            }
        }
        Ok(Pipeline {
            name: self.name,
            steps: self.steps,
            error_policy: self.error_policy,
            concurrency: self.concurrency,
        })
    }
}
