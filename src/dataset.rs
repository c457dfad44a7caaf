//! The dataset tree.
//!
//! A [`Dataset`] is a leaf holding one partition, a composite of child
//! datasets, or a proxy for a dataset held by a worker process. All three
//! expose the same operations; each returns a cold [`ResultStream`] that starts
//! work when first polled and cancels it when dropped.
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use sketchflow::{Dataset, Descriptor, Engine, Monoid, Sketch};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Total;
//!
//! impl Descriptor for Total {
//!     const KIND: &'static str = "total";
//! }
//!
//! impl Monoid<i64> for Total {
//!     fn zero(&self) -> i64 { 0 }
//!     fn add(&self, l: i64, r: i64) -> i64 { l + r }
//! }
//!
//! impl Sketch<i64, i64> for Total {
//!     fn create(&self, data: &i64) -> anyhow::Result<i64> { Ok(*data) }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let engine = Engine::inline();
//! let data = Dataset::parallel(
//!     (1i64..=3).map(|v| Dataset::local(v, &engine)).collect(),
//!     engine.bundler(),
//! );
//! assert_eq!(data.reduce_sketch::<i64, _>(Arc::new(Total)).await?, 6);
//! # Ok(())
//! # }
//! ```

use crate::bundle::Bundler;
use crate::capability::{Element, Map, ResultBound, Sketch, Zipper};
use crate::control::{ControlMessage, StatusList, StatusListMonoid};
use crate::error::{Error, Result};
use crate::executor::Engine;
use crate::local::LeafDataset;
use crate::monoid::{DatasetResultMonoid, Monoid, PartialResultMonoid};
use crate::parallel::CompositeDataset;
use crate::partial::{ResultStream, reduce_results};
use crate::remote::ProxyDataset;
use futures::StreamExt;
use futures::stream;
use std::fmt;
use std::sync::Arc;

/// A node of the dataset tree with partitions of type `T`.
pub enum Dataset<T> {
    Leaf(LeafDataset<T>),
    Composite(CompositeDataset<T>),
    Proxy(ProxyDataset<T>),
}

impl<T> Clone for Dataset<T> {
    fn clone(&self) -> Self {
        match self {
            Dataset::Leaf(d) => Dataset::Leaf(d.clone()),
            Dataset::Composite(d) => Dataset::Composite(d.clone()),
            Dataset::Proxy(d) => Dataset::Proxy(d.clone()),
        }
    }
}

impl<T> fmt::Debug for Dataset<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Leaf(d) => d.fmt(f),
            Dataset::Composite(d) => d.fmt(f),
            Dataset::Proxy(d) => d.fmt(f),
        }
    }
}

impl<T> Dataset<T> {
    /// Name of the variant, for diagnostics.
    pub fn shape(&self) -> &'static str {
        match self {
            Dataset::Leaf(_) => "leaf",
            Dataset::Composite(_) => "composite",
            Dataset::Proxy(_) => "proxy",
        }
    }

    pub fn as_leaf(&self) -> Option<&LeafDataset<T>> {
        match self {
            Dataset::Leaf(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_composite(&self) -> Option<&CompositeDataset<T>> {
        match self {
            Dataset::Composite(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&ProxyDataset<T>> {
        match self {
            Dataset::Proxy(d) => Some(d),
            _ => None,
        }
    }
}

impl<T: Element> Dataset<T> {
    pub fn local(value: T, engine: &Engine) -> Self {
        Dataset::Leaf(LeafDataset::new(value, engine.clone()))
    }

    pub fn parallel(children: Vec<Dataset<T>>, bundler: Bundler) -> Self {
        Dataset::Composite(CompositeDataset::with_bundler(children, bundler))
    }

    /// Partition of a leaf.
    pub fn leaf_value(&self) -> Option<&T> {
        self.as_leaf().map(LeafDataset::value)
    }

    /// Children of a composite.
    pub fn children(&self) -> Option<&[Dataset<T>]> {
        self.as_composite().map(CompositeDataset::children)
    }

    /// Apply `mapper` to every partition, producing a dataset of the same shape.
    pub fn map<S, M>(&self, mapper: Arc<M>) -> ResultStream<Dataset<S>>
    where
        S: Element,
        M: Map<T, S>,
    {
        match self {
            Dataset::Leaf(d) => d.map(mapper),
            Dataset::Composite(d) => d.map(mapper),
            Dataset::Proxy(d) => d.map(mapper),
        }
    }

    /// Like [`map`](Self::map), but each partition becomes a composite with
    /// one leaf per produced value.
    pub fn flat_map<S, M>(&self, mapper: Arc<M>) -> ResultStream<Dataset<S>>
    where
        S: Element,
        M: Map<T, Vec<S>>,
    {
        match self {
            Dataset::Leaf(d) => d.flat_map(mapper),
            Dataset::Composite(d) => d.flat_map(mapper),
            Dataset::Proxy(d) => d.flat_map(mapper),
        }
    }

    /// Summarize every partition and stream the partial summaries.
    pub fn sketch<R, K>(&self, sketch: Arc<K>) -> ResultStream<R>
    where
        R: ResultBound,
        K: Sketch<T, R>,
    {
        match self {
            Dataset::Leaf(d) => d.sketch(sketch),
            Dataset::Composite(d) => d.sketch(sketch),
            Dataset::Proxy(d) => d.sketch(sketch),
        }
    }

    /// Combine position by position with an equally shaped dataset.
    ///
    /// Leaves zip with leaves, composites with composites of the same size,
    /// and proxies with proxies on the same worker. Anything else yields a
    /// stream holding a single error.
    pub fn zip<S, R, Z>(&self, other: &Dataset<S>, zipper: Arc<Z>) -> ResultStream<Dataset<R>>
    where
        S: Element,
        R: Element,
        Z: Zipper<T, S, R>,
    {
        match (self, other) {
            (Dataset::Leaf(l), Dataset::Leaf(r)) => l.zip(r, zipper),
            (Dataset::Composite(l), Dataset::Composite(r)) => l.zip(r, zipper),
            (Dataset::Proxy(l), Dataset::Proxy(r)) => l.zip(r, zipper),
            (l, r) => failed(Error::ZipShapeMismatch {
                left: l.shape(),
                right: r.shape(),
            }),
        }
    }

    /// Drop the partitions for which `predicate` holds.
    ///
    /// The stream carries at most one dataset; none at all if everything was
    /// pruned.
    pub fn prune<M>(&self, predicate: Arc<M>) -> ResultStream<Dataset<T>>
    where
        M: Map<T, bool>,
    {
        match self {
            Dataset::Leaf(d) => d.prune(predicate),
            Dataset::Composite(d) => d.prune(predicate),
            Dataset::Proxy(d) => d.prune(predicate),
        }
    }

    /// Deliver a control message to every layer of the tree.
    pub fn manage(&self, message: Arc<dyn ControlMessage>) -> ResultStream<StatusList> {
        match self {
            Dataset::Leaf(d) => d.manage(message),
            Dataset::Composite(d) => d.manage(message),
            Dataset::Proxy(d) => d.manage(message),
        }
    }

    /// Run a sketch to completion and return its total.
    pub async fn reduce_sketch<R, K>(&self, sketch: Arc<K>) -> Result<R>
    where
        R: ResultBound,
        K: Sketch<T, R>,
    {
        let monoid = PartialResultMonoid::new(Arc::clone(&sketch));
        let total = reduce_results(self.sketch(Arc::clone(&sketch)), &monoid).await?;
        Ok(total.delta.unwrap_or_else(|| sketch.zero()))
    }

    pub async fn reduce_map<S, M>(&self, mapper: Arc<M>) -> Result<Dataset<S>>
    where
        S: Element,
        M: Map<T, S>,
    {
        expect_dataset("map", self.map(mapper)).await
    }

    pub async fn reduce_flat_map<S, M>(&self, mapper: Arc<M>) -> Result<Dataset<S>>
    where
        S: Element,
        M: Map<T, Vec<S>>,
    {
        expect_dataset("flat_map", self.flat_map(mapper)).await
    }

    pub async fn reduce_zip<S, R, Z>(&self, other: &Dataset<S>, zipper: Arc<Z>) -> Result<Dataset<R>>
    where
        S: Element,
        R: Element,
        Z: Zipper<T, S, R>,
    {
        expect_dataset("zip", self.zip(other, zipper)).await
    }

    /// `None` when every partition was pruned.
    pub async fn reduce_prune<M>(&self, predicate: Arc<M>) -> Result<Option<Dataset<T>>>
    where
        M: Map<T, bool>,
    {
        let total = reduce_results(self.prune(predicate), &DatasetResultMonoid::new()).await?;
        Ok(total.delta)
    }

    pub async fn reduce_manage(&self, message: Arc<dyn ControlMessage>) -> Result<StatusList> {
        let monoid = PartialResultMonoid::new(StatusListMonoid);
        let total = reduce_results(self.manage(message), &monoid).await?;
        Ok(total.delta.unwrap_or_default())
    }
}

async fn expect_dataset<S>(operation: &str, results: ResultStream<Dataset<S>>) -> Result<Dataset<S>> {
    let total = reduce_results(results, &DatasetResultMonoid::new()).await?;
    total
        .delta
        .ok_or_else(|| Error::Protocol(format!("{operation} completed without producing a dataset")))
}

/// A stream that fails immediately with `error`.
pub(crate) fn failed<R: Send + 'static>(error: Error) -> ResultStream<R> {
    stream::once(async move { Err(error) }).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{Descriptor, Pair};
    use crate::partial::collect_results;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Double;

    impl Descriptor for Double {
        const KIND: &'static str = "double";
    }

    impl Map<i32, i32> for Double {
        fn apply(&self, data: &i32) -> anyhow::Result<i32> {
            Ok(data * 2)
        }
    }

    #[tokio::test]
    async fn leaf_cannot_zip_with_composite() -> anyhow::Result<()> {
        let engine = Engine::inline();
        let leaf = Dataset::local(1, &engine);
        let composite = Dataset::parallel(vec![Dataset::local(2, &engine)], Bundler::disabled());
        let mut out = leaf.zip::<i32, (i32, i32), _>(&composite, Arc::new(Pair));
        match out.next().await {
            Some(Err(Error::ZipShapeMismatch { left, right })) => {
                assert_eq!((left, right), ("leaf", "composite"));
            }
            other => panic!("unexpected {:?}", other.map(|r| r.map(|p| p.done))),
        }
        assert!(out.next().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn leaf_map_produces_a_leaf() -> anyhow::Result<()> {
        let engine = Engine::inline();
        let out = collect_results(Dataset::local(21, &engine).map::<i32, _>(Arc::new(Double))).await?;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].done, 1.0);
        let mapped = out[0].delta.as_ref().and_then(Dataset::leaf_value);
        assert_eq!(mapped, Some(&42));
        Ok(())
    }

    #[tokio::test]
    async fn reduce_map_keeps_shape() -> anyhow::Result<()> {
        let engine = Engine::inline();
        let data = Dataset::parallel(
            vec![Dataset::local(1, &engine), Dataset::local(2, &engine)],
            Bundler::disabled(),
        );
        let mapped = data.reduce_map::<i32, _>(Arc::new(Double)).await?;
        let values: Vec<i32> = mapped
            .children()
            .unwrap_or_default()
            .iter()
            .filter_map(|c| c.leaf_value().copied())
            .collect();
        assert_eq!(values, vec![2, 4]);
        Ok(())
    }
}
