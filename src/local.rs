//! Leaf datasets: one in-memory partition.

use crate::capability::{Element, Map, Sketch, Zipper};
use crate::control::{ControlMessage, LeafContext, StatusList, statuses};
use crate::dataset::Dataset;
use crate::error::{Error, Result};
use crate::executor::Engine;
use crate::parallel::CompositeDataset;
use crate::partial::{PartialResult, ResultStream};
use anyhow::anyhow;
use futures::StreamExt;
use futures::stream;
use std::any::{Any, type_name};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// A dataset holding a single partition of type `T`.
///
/// Every operation runs as one job on the engine's compute executor and
/// completes with a single `(1.0, ...)` result. The job is submitted when the
/// result stream is first polled; dropping the stream before the job started
/// skips it, and a result produced after the drop is discarded.
pub struct LeafDataset<T> {
    partition: Arc<T>,
    engine: Engine,
}

impl<T> Clone for LeafDataset<T> {
    fn clone(&self) -> Self {
        Self {
            partition: Arc::clone(&self.partition),
            engine: self.engine.clone(),
        }
    }
}

impl<T> fmt::Debug for LeafDataset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafDataset")
            .field("type", &type_name::<T>())
            .field("executor", &self.engine.compute().name())
            .finish()
    }
}

impl<T: Element> LeafDataset<T> {
    pub fn new(value: T, engine: Engine) -> Self {
        Self::from_arc(Arc::new(value), engine)
    }

    pub fn from_arc(partition: Arc<T>, engine: Engine) -> Self {
        Self { partition, engine }
    }

    pub fn value(&self) -> &T {
        &self.partition
    }

    pub fn partition(&self) -> Arc<T> {
        Arc::clone(&self.partition)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn map<S, M>(&self, mapper: Arc<M>) -> ResultStream<Dataset<S>>
    where
        S: Element,
        M: Map<T, S>,
    {
        let engine = self.engine.clone();
        self.compute(M::KIND, move |data| {
            let value = mapper.apply(data).map_err(|e| Error::user(M::KIND, e))?;
            Ok(PartialResult::complete(Dataset::Leaf(LeafDataset::new(value, engine))))
        })
    }

    /// Each produced value becomes one leaf of a new composite.
    pub fn flat_map<S, M>(&self, mapper: Arc<M>) -> ResultStream<Dataset<S>>
    where
        S: Element,
        M: Map<T, Vec<S>>,
    {
        let engine = self.engine.clone();
        self.compute(M::KIND, move |data| {
            let values = mapper.apply(data).map_err(|e| Error::user(M::KIND, e))?;
            let bundler = engine.bundler();
            let children = values
                .into_iter()
                .map(|v| Dataset::Leaf(LeafDataset::new(v, engine.clone())))
                .collect();
            Ok(PartialResult::complete(Dataset::Composite(
                CompositeDataset::with_bundler(children, bundler),
            )))
        })
    }

    pub fn sketch<R, K>(&self, sketch: Arc<K>) -> ResultStream<R>
    where
        R: Send + 'static,
        K: Sketch<T, R>,
    {
        self.compute(K::KIND, move |data| {
            let value = sketch.create(data).map_err(|e| Error::user(K::KIND, e))?;
            Ok(PartialResult::complete(value))
        })
    }

    pub fn zip<S, R, Z>(&self, other: &LeafDataset<S>, zipper: Arc<Z>) -> ResultStream<Dataset<R>>
    where
        S: Element,
        R: Element,
        Z: Zipper<T, S, R>,
    {
        let right = other.partition();
        let engine = self.engine.clone();
        self.compute(Z::KIND, move |left| {
            let value = zipper
                .combine(left, &*right)
                .map_err(|e| Error::user(Z::KIND, e))?;
            Ok(PartialResult::complete(Dataset::Leaf(LeafDataset::new(value, engine))))
        })
    }

    /// Emits no dataset when `predicate` holds, otherwise this leaf.
    pub fn prune<M>(&self, predicate: Arc<M>) -> ResultStream<Dataset<T>>
    where
        M: Map<T, bool>,
    {
        let this = self.clone();
        self.compute(M::KIND, move |data| {
            let pruned = predicate.apply(data).map_err(|e| Error::user(M::KIND, e))?;
            if pruned {
                Ok(PartialResult::progress(1.0))
            } else {
                Ok(PartialResult::complete(Dataset::Leaf(this)))
            }
        })
    }

    pub fn manage(&self, message: Arc<dyn ControlMessage>) -> ResultStream<StatusList> {
        let kind = message.kind();
        self.compute(kind, move |data| {
            let ctx = LeafContext {
                partition: data as &dyn Any,
                type_name: type_name::<T>(),
            };
            Ok(PartialResult::complete(statuses(kind, message.local_action(&ctx))))
        })
    }

    /// Run `work` against the partition once the stream is polled.
    fn compute<R, F>(&self, kind: &'static str, work: F) -> ResultStream<R>
    where
        R: Send + 'static,
        F: FnOnce(&T) -> Result<PartialResult<R>> + Send + 'static,
    {
        let partition = Arc::clone(&self.partition);
        let executor = Arc::clone(self.engine.compute());
        stream::once(async move {
            let (tx, rx) = oneshot::channel();
            let cancelled = Arc::new(AtomicBool::new(false));
            let _guard = CancelOnDrop(Arc::clone(&cancelled));
            debug!(operation = kind, executor = executor.name(), "leaf job submitted");
            executor.execute(Box::new(move || {
                if cancelled.load(Ordering::Acquire) {
                    debug!(operation = kind, "leaf job skipped, result no longer wanted");
                    return;
                }
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&*partition)))
                    .unwrap_or_else(|payload| {
                        Err(Error::user(kind, anyhow!("panicked: {}", panic_message(&*payload))))
                    });
                // The receiver is gone when the caller stopped listening.
                let _ = tx.send(outcome);
            }));
            rx.await.map_err(|_| Error::TaskLost(kind.to_string()))?
        })
        .boxed()
    }
}

/// Flags a pending job as unwanted when its stream goes away.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Descriptor;
    use crate::executor::{ComputeExecutor, Job};
    use crate::monoid::Monoid;
    use crate::partial::collect_results;
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Boom;

    impl Descriptor for Boom {
        const KIND: &'static str = "boom";
    }

    impl Map<i32, i32> for Boom {
        fn apply(&self, _data: &i32) -> anyhow::Result<i32> {
            panic!("kaboom")
        }
    }

    #[derive(Serialize, Deserialize)]
    struct Length;

    impl Descriptor for Length {
        const KIND: &'static str = "length";
    }

    impl Monoid<usize> for Length {
        fn zero(&self) -> usize {
            0
        }
        fn add(&self, left: usize, right: usize) -> usize {
            left + right
        }
    }

    impl Sketch<String, usize> for Length {
        fn create(&self, data: &String) -> anyhow::Result<usize> {
            Ok(data.len())
        }
    }

    /// Holds jobs until released, to observe cancellation.
    #[derive(Default)]
    struct Parked {
        jobs: Mutex<Vec<Job>>,
    }

    impl std::fmt::Debug for Parked {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("Parked").field("jobs", &self.jobs.lock().len()).finish()
        }
    }

    impl ComputeExecutor for Parked {
        fn execute(&self, job: Job) {
            self.jobs.lock().push(job);
        }

        fn name(&self) -> &'static str {
            "parked"
        }
    }

    #[tokio::test]
    async fn sketch_emits_single_complete_result() -> anyhow::Result<()> {
        let leaf = LeafDataset::new("hello".to_string(), Engine::inline());
        let out = collect_results(leaf.sketch(Arc::new(Length))).await?;
        assert_eq!(out, vec![PartialResult::complete(5)]);
        Ok(())
    }

    #[tokio::test]
    async fn panics_become_user_errors() {
        let leaf = LeafDataset::new(1, Engine::inline());
        let mut out = leaf.map::<i32, _>(Arc::new(Boom));
        match out.next().await {
            Some(Err(Error::UserFunction { kind, source })) => {
                assert_eq!(kind, "boom");
                assert!(source.to_string().contains("kaboom"));
            }
            other => panic!("unexpected {:?}", other.map(|r| r.map(|p| p.done))),
        }
    }

    #[tokio::test]
    async fn dropped_stream_skips_pending_job() {
        let parked = Arc::new(Parked::default());
        let engine = Engine::new(parked.clone(), crate::bundle::Bundler::disabled());
        let leaf = LeafDataset::new("abc".to_string(), engine);
        let mut out = leaf.sketch(Arc::new(Length));
        // First poll submits the job; it stays parked.
        assert!(futures::poll!(out.next()).is_pending());
        drop(out);
        let jobs: Vec<Job> = std::mem::take(&mut *parked.jobs.lock());
        assert_eq!(jobs.len(), 1);
        // Running it now is a no-op: nobody is listening and it bails early.
        for job in jobs {
            job();
        }
    }
}
