//! Composite datasets: fan an operation out to every child, fan the results in.
//!
//! Children run concurrently. Each child's progress is scaled by `1/N` so the
//! composite still reports a total of `1.0`. Sketch results are forwarded as
//! they arrive and summed by the caller; dataset-producing operations wait for
//! every child's dataset and emit one composite holding them in child order,
//! regardless of the order in which the children finished. The whole output
//! goes through the composite's [`Bundler`].
//!
//! The first error from any child ends the stream, and dropping the stream
//! drops every child stream with it.

use crate::bundle::Bundler;
use crate::capability::{Element, Map, ResultBound, Sketch, Zipper};
use crate::control::{CompositeContext, ControlMessage, StatusList, StatusListMonoid, statuses};
use crate::dataset::{Dataset, failed};
use crate::error::{Error, Result};
use crate::monoid::{DatasetResultMonoid, PartialResultMonoid};
use crate::partial::{PartialResult, ResultStream};
use futures::StreamExt;
use futures::stream::{self, BoxStream, SelectAll};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub struct CompositeDataset<T> {
    children: Arc<Vec<Dataset<T>>>,
    bundler: Bundler,
}

impl<T> Clone for CompositeDataset<T> {
    fn clone(&self) -> Self {
        Self {
            children: Arc::clone(&self.children),
            bundler: self.bundler,
        }
    }
}

impl<T> fmt::Debug for CompositeDataset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeDataset")
            .field("children", &self.children)
            .field("bundle_window", &self.bundler.window())
            .finish()
    }
}

impl<T: Element> CompositeDataset<T> {
    /// A composite using the default bundling window.
    pub fn new(children: Vec<Dataset<T>>) -> Self {
        Self::with_bundler(children, Bundler::default())
    }

    pub fn with_bundler(children: Vec<Dataset<T>>, bundler: Bundler) -> Self {
        Self {
            children: Arc::new(children),
            bundler,
        }
    }

    pub fn children(&self) -> &[Dataset<T>] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn bundler(&self) -> Bundler {
        self.bundler
    }

    pub fn map<S, M>(&self, mapper: Arc<M>) -> ResultStream<Dataset<S>>
    where
        S: Element,
        M: Map<T, S>,
    {
        let streams = self
            .children
            .iter()
            .map(|c| c.map(Arc::clone(&mapper)))
            .collect();
        self.gather_datasets(M::KIND, streams)
    }

    pub fn flat_map<S, M>(&self, mapper: Arc<M>) -> ResultStream<Dataset<S>>
    where
        S: Element,
        M: Map<T, Vec<S>>,
    {
        let streams = self
            .children
            .iter()
            .map(|c| c.flat_map(Arc::clone(&mapper)))
            .collect();
        self.gather_datasets(M::KIND, streams)
    }

    pub fn zip<S, R, Z>(&self, other: &CompositeDataset<S>, zipper: Arc<Z>) -> ResultStream<Dataset<R>>
    where
        S: Element,
        R: Element,
        Z: Zipper<T, S, R>,
    {
        if self.len() != other.len() {
            return failed(Error::ZipSizeMismatch {
                left: self.len(),
                right: other.len(),
            });
        }
        let streams = self
            .children
            .iter()
            .zip(other.children.iter())
            .map(|(l, r)| l.zip(r, Arc::clone(&zipper)))
            .collect();
        self.gather_datasets(Z::KIND, streams)
    }

    pub fn sketch<R, K>(&self, sketch: Arc<K>) -> ResultStream<R>
    where
        R: ResultBound,
        K: Sketch<T, R>,
    {
        let n = self.len();
        if n == 0 {
            let zero = sketch.zero();
            return stream::once(async move { Ok(PartialResult::complete(zero)) }).boxed();
        }
        debug!(operation = K::KIND, children = n, "fan out sketch");
        let merged = stream::select_all(self.children.iter().map(|c| {
            c.sketch(Arc::clone(&sketch))
                .map(move |r| r.map(|pr| pr.scaled(n)))
                .boxed()
        }));
        self.bundler
            .bundle(merged.boxed(), PartialResultMonoid::new(sketch))
    }

    /// Keeps the children that survive `predicate`, in their original order.
    pub fn prune<M>(&self, predicate: Arc<M>) -> ResultStream<Dataset<T>>
    where
        M: Map<T, bool>,
    {
        if self.is_empty() {
            return stream::once(async { Ok(PartialResult::progress(1.0)) }).boxed();
        }
        let streams = self
            .children
            .iter()
            .map(|c| c.prune(Arc::clone(&predicate)))
            .collect();
        let bundler = self.bundler;
        debug!(operation = M::KIND, children = self.len(), "fan out prune");
        let gathered = gather(streams, Completion::Survivors, move |kept| {
            Dataset::Composite(CompositeDataset::with_bundler(kept, bundler))
        });
        self.bundler.bundle(gathered, DatasetResultMonoid::new())
    }

    /// Children report first; the composite's own action follows at no progress.
    pub fn manage(&self, message: Arc<dyn ControlMessage>) -> ResultStream<StatusList> {
        let n = self.len();
        let kind = message.kind();
        let ctx = CompositeContext { children: n };
        let own = {
            let message = Arc::clone(&message);
            stream::once(async move {
                let done = if n == 0 { 1.0 } else { 0.0 };
                Ok(PartialResult::new(done, Some(statuses(kind, message.parallel_action(&ctx)))))
            })
        };
        if n == 0 {
            return own.boxed();
        }
        let merged = stream::select_all(self.children.iter().map(|c| {
            c.manage(Arc::clone(&message))
                .map(move |r| r.map(|pr| pr.scaled(n)))
                .boxed()
        }));
        self.bundler.bundle(
            merged.chain(own).boxed(),
            PartialResultMonoid::new(StatusListMonoid),
        )
    }

    fn gather_datasets<S: Element>(
        &self,
        kind: &'static str,
        streams: Vec<ResultStream<Dataset<S>>>,
    ) -> ResultStream<Dataset<S>> {
        let bundler = self.bundler;
        if streams.is_empty() {
            let empty = Dataset::Composite(CompositeDataset::with_bundler(Vec::new(), bundler));
            return stream::once(async move { Ok(PartialResult::complete(empty)) }).boxed();
        }
        debug!(operation = kind, children = streams.len(), "fan out");
        let gathered = gather(streams, Completion::Every, move |children| {
            Dataset::Composite(CompositeDataset::with_bundler(children, bundler))
        });
        self.bundler.bundle(gathered, DatasetResultMonoid::new())
    }
}

/// When a gathered stream has its final value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Completion {
    /// Every child must produce exactly one value.
    Every,
    /// Children produce at most one value; the result holds those that did.
    Survivors,
}

type Tagged<D> = BoxStream<'static, (usize, Result<PartialResult<D>>)>;

struct Gather<D, F> {
    merged: SelectAll<Tagged<D>>,
    slots: Vec<Option<D>>,
    filled: usize,
    completion: Completion,
    assemble: F,
    emitted: bool,
    finished: bool,
}

/// Merge per-child streams, placing each child's value at the child's index.
///
/// Progress is forwarded scaled by the number of children. In
/// [`Completion::Every`] mode the assembled value rides on the emission that
/// fills the last slot; in [`Completion::Survivors`] mode it is emitted with no
/// progress once every child finished, and not at all if no child produced one.
fn gather<D, E, F>(streams: Vec<ResultStream<D>>, completion: Completion, assemble: F) -> ResultStream<E>
where
    D: Send + 'static,
    E: Send + 'static,
    F: Fn(Vec<D>) -> E + Send + 'static,
{
    let n = streams.len();
    let merged = stream::select_all(
        streams
            .into_iter()
            .enumerate()
            .map(|(i, s)| s.map(move |item| (i, item)).boxed()),
    );
    let state = Gather {
        merged,
        slots: (0..n).map(|_| None).collect(),
        filled: 0,
        completion,
        assemble,
        emitted: false,
        finished: false,
    };
    stream::unfold(state, move |mut st| async move {
        if st.finished {
            return None;
        }
        let step = st.step(n).await;
        if !matches!(step, Some(Ok(_))) {
            st.finished = true;
        }
        step.map(|item| (item, st))
    })
    .boxed()
}

impl<D, E, F> Gather<D, F>
where
    D: Send + 'static,
    F: Fn(Vec<D>) -> E,
{
    async fn step(&mut self, n: usize) -> Option<Result<PartialResult<E>>> {
        match self.merged.next().await {
            Some((i, Ok(pr))) => {
                let done = pr.done / n as f64;
                if let Some(value) = pr.delta {
                    if self.emitted || self.slots[i].is_some() {
                        return Some(Err(Error::Protocol(format!(
                            "child {i} produced more than one dataset"
                        ))));
                    }
                    self.slots[i] = Some(value);
                    self.filled += 1;
                    if self.completion == Completion::Every && self.filled == n {
                        self.emitted = true;
                        return Some(Ok(PartialResult::new(done, Some(self.take_all()))));
                    }
                }
                Some(Ok(PartialResult::progress(done)))
            }
            Some((_, Err(e))) => Some(Err(e)),
            None => match self.completion {
                Completion::Every if self.emitted => None,
                Completion::Every => Some(Err(Error::Protocol(format!(
                    "{} of {n} children finished without a dataset",
                    n - self.filled
                )))),
                Completion::Survivors if self.emitted || self.filled == 0 => None,
                Completion::Survivors => {
                    self.emitted = true;
                    Some(Ok(PartialResult::new(0.0, Some(self.take_all()))))
                }
            },
        }
    }

    fn take_all(&mut self) -> E {
        let values = self.slots.iter_mut().filter_map(Option::take).collect();
        (self.assemble)(values)
    }
}
