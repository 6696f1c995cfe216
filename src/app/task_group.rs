//! Named long-running tasks joined together.

use anyhow::Result;
use std::future::Future;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Owns the engine tasks started by the orchestrator.
///
/// Dropping the group aborts every task still running.
#[derive(Debug, Default)]
pub struct TaskGroup {
    tasks: JoinSet<(String, Result<()>)>,
}

impl TaskGroup {
    /// Empty group
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` under `name`.
    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!("Starting task {}", name);
        self.tasks.spawn(async move { (name, task.await) });
    }

    /// Number of tasks not yet joined
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every task has been joined
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait until every task has exited, logging each exit.
    ///
    /// Returns how many tasks failed or panicked.
    pub async fn join_all(&mut self) -> usize {
        let mut failed = 0;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!("{} exited", name),
                Ok((name, Err(e))) => {
                    error!("{} failed: {:#}", name, e);
                    failed += 1;
                }
                Err(e) if e.is_cancelled() => debug!("Task cancelled"),
                Err(e) => {
                    error!("Task panicked: {}", e);
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Abort every task; they still have to be joined.
    pub fn abort_all(&mut self) {
        self.tasks.abort_all();
    }
}
