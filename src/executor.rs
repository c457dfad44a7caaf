//! Executors injected into datasets.
//!
//! Leaf computations run on a [`ComputeExecutor`]: either a bounded `rayon`
//! pool shared by every leaf of a process, or inline on the polling thread for
//! deterministic tests. Network calls and their fire-and-forget follow-ups
//! (remote unsubscribe) run on a [`NetworkExecutor`], a handle to a `tokio`
//! runtime kept separate from the compute pool.

use crate::bundle::Bundler;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

/// A unit of leaf work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs leaf computations.
pub trait ComputeExecutor: Send + Sync + fmt::Debug {
    /// Schedule `job`. It may run before this call returns.
    fn execute(&self, job: Job);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Runs every job immediately on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineExecutor;

impl ComputeExecutor for InlineExecutor {
    fn execute(&self, job: Job) {
        job()
    }

    fn name(&self) -> &'static str {
        "inline"
    }
}

/// Bounded thread pool for heavy leaf computations.
pub struct PoolExecutor {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl PoolExecutor {
    /// Build a pool with `threads` workers, or one per CPU when `None`.
    pub fn new(threads: Option<usize>) -> Result<Self> {
        let threads = threads.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sketchflow-compute-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("cannot build compute pool: {e}")))?;
        Ok(Self { pool, threads })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }
}

impl fmt::Debug for PoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolExecutor")
            .field("threads", &self.threads)
            .finish()
    }
}

impl ComputeExecutor for PoolExecutor {
    fn execute(&self, job: Job) {
        self.pool.spawn(job);
    }

    fn name(&self) -> &'static str {
        "pool"
    }
}

/// Shared handle to a compute executor.
pub type SharedCompute = Arc<dyn ComputeExecutor>;

/// Handle to the runtime that performs network I/O.
#[derive(Clone, Debug)]
pub struct NetworkExecutor {
    handle: Handle,
}

impl NetworkExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Capture the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Config(format!("no tokio runtime for network I/O: {e}")))?;
        Ok(Self::new(handle))
    }

    /// Spawn a detached task.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}

/// Executors and tuning shared by the datasets of one process.
///
/// Leaves created by `map`, `flat_map`, and `zip` inherit the engine of the
/// dataset that produced them.
#[derive(Clone, Debug)]
pub struct Engine {
    compute: SharedCompute,
    bundler: Bundler,
}

impl Engine {
    pub fn new(compute: SharedCompute, bundler: Bundler) -> Self {
        Self { compute, bundler }
    }

    /// Build a pool-backed engine from `config`.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = PoolExecutor::new(config.compute_threads)?;
        Ok(Self::new(Arc::new(pool), Bundler::new(config.bundle_interval)))
    }

    /// Run everything on the polling thread without bundling.
    pub fn inline() -> Self {
        Self::new(Arc::new(InlineExecutor), Bundler::disabled())
    }

    pub fn compute(&self) -> &SharedCompute {
        &self.compute
    }

    pub fn bundler(&self) -> Bundler {
        self.bundler
    }

    pub fn with_bundler(mut self, bundler: Bundler) -> Self {
        self.bundler = bundler;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn inline_runs_before_returning() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        InlineExecutor.execute(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pool_runs_on_named_threads() -> anyhow::Result<()> {
        let pool = PoolExecutor::new(Some(2))?;
        assert_eq!(pool.threads(), 2);
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        }));
        let name = rx.recv()?;
        assert!(name.unwrap_or_default().starts_with("sketchflow-compute-"));
        Ok(())
    }

    #[test]
    fn engine_follows_config() -> anyhow::Result<()> {
        let config = EngineConfig {
            compute_threads: Some(1),
            bundle_interval: std::time::Duration::ZERO,
            ..Default::default()
        };
        let engine = Engine::from_config(&config)?;
        assert_eq!(engine.compute().name(), "pool");
        assert!(!engine.bundler().is_enabled());
        Ok(())
    }

    #[test]
    fn network_executor_requires_runtime() {
        assert!(NetworkExecutor::current().is_err());
    }
}
