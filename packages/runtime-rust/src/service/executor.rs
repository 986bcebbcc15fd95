//! Executors that run the handler pipeline and business method, decoupled
//! from the connection reader that received the request.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::warn;
use tramline_core::{DEFAULT_EXECUTOR, REACTIVE_EXECUTOR};

use crate::config::ExecutorConfig;

/// Where queued work runs.
#[derive(Debug)]
pub enum OperationExecutor {
    /// Spawned directly on the I/O runtime, no queue. For non-blocking
    /// operations only.
    Reactive,
    /// Spawned on `runtime`, at most `permits` running at once. Waiting for a
    /// permit is the queue wait recorded in the stage trace.
    Bounded {
        name: String,
        permits: Arc<Semaphore>,
        max_concurrency: usize,
        runtime: Option<tokio::runtime::Handle>,
    },
}

impl OperationExecutor {
    #[must_use]
    pub fn bounded(name: impl Into<String>, max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self::Bounded {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            runtime: None,
        }
    }

    /// Runs bounded work on a dedicated runtime instead of the caller's.
    #[must_use]
    pub fn on_runtime(self, handle: tokio::runtime::Handle) -> Self {
        match self {
            Self::Bounded {
                name,
                permits,
                max_concurrency,
                ..
            } => Self::Bounded {
                name,
                permits,
                max_concurrency,
                runtime: Some(handle),
            },
            Self::Reactive => Self::Reactive,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Reactive => REACTIVE_EXECUTOR,
            Self::Bounded { name, .. } => name,
        }
    }

    /// Operations currently holding a permit. Always `0` for reactive.
    #[must_use]
    pub fn running(&self) -> usize {
        match self {
            Self::Reactive => 0,
            Self::Bounded {
                permits,
                max_concurrency,
                ..
            } => max_concurrency - permits.available_permits(),
        }
    }

    /// Queues `task`. The task starts once a permit is free.
    pub fn execute<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self {
            Self::Reactive => {
                tokio::spawn(task);
            }
            Self::Bounded {
                name,
                permits,
                runtime,
                ..
            } => {
                let permits = Arc::clone(permits);
                let name = name.clone();
                let job = async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        warn!(executor = %name, "executor closed, dropping task");
                        return;
                    };
                    task.await;
                };
                match runtime {
                    Some(handle) => {
                        handle.spawn(job);
                    }
                    None => {
                        tokio::spawn(job);
                    }
                }
            }
        }
    }
}

/// Named executors, resolved per operation.
#[derive(Debug)]
pub struct ExecutorRegistry {
    executors: DashMap<String, Arc<OperationExecutor>>,
}

impl ExecutorRegistry {
    /// Registers the built-in `reactive` executor plus `configs`.
    ///
    /// A `default` executor is always present.
    #[must_use]
    pub fn new(configs: &[ExecutorConfig]) -> Self {
        let executors = DashMap::new();
        executors.insert(
            REACTIVE_EXECUTOR.to_string(),
            Arc::new(OperationExecutor::Reactive),
        );
        for config in configs {
            executors.insert(
                config.name.clone(),
                Arc::new(OperationExecutor::bounded(&config.name, config.max_concurrency)),
            );
        }
        executors
            .entry(DEFAULT_EXECUTOR.to_string())
            .or_insert_with(|| Arc::new(OperationExecutor::bounded(DEFAULT_EXECUTOR, 64)));
        Self { executors }
    }

    pub fn register(&self, executor: OperationExecutor) {
        self.executors
            .insert(executor.name().to_string(), Arc::new(executor));
    }

    /// Returns the named executor, falling back to `default` for unknown names.
    #[must_use]
    pub fn get(&self, name: &str) -> Arc<OperationExecutor> {
        if let Some(found) = self.executors.get(name) {
            return Arc::clone(found.value());
        }
        warn!(executor = name, "unknown executor, using default");
        self.executors
            .get(DEFAULT_EXECUTOR)
            .map_or_else(|| Arc::new(OperationExecutor::Reactive), |e| Arc::clone(e.value()))
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new(&[])
    }
}
