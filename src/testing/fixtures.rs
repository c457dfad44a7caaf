//! Pre-built trees, capabilities, and an in-process worker for tests.

use crate::capability::{Descriptor, Element, Map, Pair, Sketch};
use crate::config::WorkerConfig;
use crate::control::{ControlMessage, LeafContext, ServerControl, Status};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::executor::Engine;
use crate::monoid::Monoid;
use crate::remote::{OperationRegistry, Worker};
use crate::sketches::{Count, Max, Min, Sum};
use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// One leaf per value.
pub fn leaves<T: Element>(values: Vec<T>, engine: &Engine) -> Vec<Dataset<T>> {
    values.into_iter().map(|v| Dataset::local(v, engine)).collect()
}

/// A composite with one leaf per value, bundling with the engine's window.
pub fn composite_of<T: Element>(values: Vec<T>, engine: &Engine) -> Dataset<T> {
    Dataset::parallel(leaves(values, engine), engine.bundler())
}

/// Adds one.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Increment;

impl Descriptor for Increment {
    const KIND: &'static str = "sketchflow.test.increment";
}

impl Map<i64, i64> for Increment {
    fn apply(&self, data: &i64) -> anyhow::Result<i64> {
        Ok(data + 1)
    }
}

/// Repeats each value as many times as it says (at least zero).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Repeat;

impl Descriptor for Repeat {
    const KIND: &'static str = "sketchflow.test.repeat";
}

impl Map<i64, Vec<i64>> for Repeat {
    fn apply(&self, data: &i64) -> anyhow::Result<Vec<i64>> {
        Ok(vec![*data; usize::try_from(*data).unwrap_or(0)])
    }
}

/// Holds for even values.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct IsEven;

impl Descriptor for IsEven {
    const KIND: &'static str = "sketchflow.test.is-even";
}

impl Map<i64, bool> for IsEven {
    fn apply(&self, data: &i64) -> anyhow::Result<bool> {
        Ok(data % 2 == 0)
    }
}

/// Fails on the given value, passes everything else through.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct FailOn(pub i64);

impl Descriptor for FailOn {
    const KIND: &'static str = "sketchflow.test.fail-on";
}

impl Map<i64, i64> for FailOn {
    fn apply(&self, data: &i64) -> anyhow::Result<i64> {
        if *data == self.0 {
            bail!("refusing to map {data}");
        }
        Ok(*data)
    }
}

/// Blocks the compute thread for `millis` when it sees `value`, then passes
/// the value through. Used to make one child finish last.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DelayOn {
    pub value: i64,
    pub millis: u64,
}

impl Descriptor for DelayOn {
    const KIND: &'static str = "sketchflow.test.delay-on";
}

impl Map<i64, i64> for DelayOn {
    fn apply(&self, data: &i64) -> anyhow::Result<i64> {
        if *data == self.value {
            std::thread::sleep(Duration::from_millis(self.millis));
        }
        Ok(*data)
    }
}

/// Sum of `i64` partitions.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Total;

impl Descriptor for Total {
    const KIND: &'static str = "sketchflow.test.total";
}

impl Monoid<i64> for Total {
    fn zero(&self) -> i64 {
        0
    }

    fn add(&self, left: i64, right: i64) -> i64 {
        left + right
    }
}

impl Sketch<i64, i64> for Total {
    fn create(&self, data: &i64) -> anyhow::Result<i64> {
        Ok(*data)
    }
}

/// Reports the partition type at every leaf and the host at the worker.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Locate;

impl Descriptor for Locate {
    const KIND: &'static str = "sketchflow.test.locate";
}

impl ControlMessage for Locate {
    fn local_action(&self, leaf: &LeafContext<'_>) -> anyhow::Result<Option<Status>> {
        Ok(Some(Status::new(format!("leaf of {}", leaf.type_name))))
    }

    fn server_action(&self, server: &dyn ServerControl) -> anyhow::Result<Option<Status>> {
        Ok(Some(Status::new(format!("worker at {}", server.endpoint()))))
    }
}

/// A registry knowing every fixture capability for `i64` partitions and the
/// built-in sketches for `Vec<i64>` partitions.
pub fn test_registry() -> OperationRegistry {
    OperationRegistry::new()
        .with_map::<i64, i64, Increment>()
        .with_map::<i64, i64, FailOn>()
        .with_map::<i64, i64, DelayOn>()
        .with_flat_map::<i64, i64, Repeat>()
        .with_prune::<i64, IsEven>()
        .with_zip::<i64, i64, (i64, i64), Pair>()
        .with_sketch::<i64, i64, Total>()
        .with_sketch::<Vec<i64>, i64, Sum>()
        .with_sketch::<Vec<i64>, u64, Count>()
        .with_sketch::<Vec<i64>, Option<i64>, Min>()
        .with_sketch::<Vec<i64>, Option<i64>, Max>()
        .with_control::<Locate>()
}

/// A worker serving on an ephemeral local port; stops when dropped.
pub struct TestWorker {
    worker: Worker,
    endpoint: String,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl TestWorker {
    pub fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Stop serving and wait for the accept loop to end.
    pub async fn shutdown(mut self) -> Result<()> {
        self.shutdown.cancel();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::TaskLost(format!("worker task: {e}")))?,
            None => Ok(()),
        }
    }
}

impl Drop for TestWorker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serve `root` on `127.0.0.1` with an ephemeral port.
pub async fn spawn_worker<T: Element>(root: Dataset<T>, registry: OperationRegistry) -> Result<TestWorker> {
    spawn_worker_with(root, registry, WorkerConfig::default()).await
}

pub async fn spawn_worker_with<T: Element>(
    root: Dataset<T>,
    registry: OperationRegistry,
    config: WorkerConfig,
) -> Result<TestWorker> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(|source| Error::Transport {
            endpoint: "127.0.0.1:0".to_string(),
            source,
        })?;
    let endpoint = listener
        .local_addr()
        .map_err(|source| Error::Transport {
            endpoint: "127.0.0.1:0".to_string(),
            source,
        })?
        .to_string();
    let worker = Worker::new(root, registry, config);
    let shutdown = CancellationToken::new();
    let task = {
        let worker = worker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { worker.serve(listener, shutdown).await })
    };
    Ok(TestWorker {
        worker,
        endpoint,
        shutdown,
        task: Some(task),
    })
}

/// Write `config` to a temporary JSON file.
pub fn temp_worker_config(config: &WorkerConfig) -> anyhow::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    serde_json::to_writer_pretty(&mut file, config)?;
    file.flush()?;
    Ok(file)
}
