//! Partial results: the unit every dataset operation streams back.
//!
//! A [`PartialResult`] carries the fraction of work that completed since the
//! previous emission and, optionally, a contribution to the final value. For a
//! completed operation the `done` fractions of all emissions add up to `1.0`.
//! Emissions without a contribution are pure progress reports.

use crate::error::Result;
use crate::monoid::Monoid;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Cold, cancellable stream of partial results.
///
/// Nothing runs until the stream is first polled; dropping it cancels the
/// operation and everything it fanned out to.
pub type ResultStream<R> = BoxStream<'static, Result<PartialResult<R>>>;

/// One increment of progress, optionally with data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartialResult<R> {
    /// Fraction of the whole operation completed by this increment, in `[0, 1]`.
    pub done: f64,
    /// Contribution to the result, if this increment carries one.
    pub delta: Option<R>,
}

impl<R> PartialResult<R> {
    pub fn new(done: f64, delta: Option<R>) -> Self {
        Self { done, delta }
    }

    /// A final result: all work done, carrying `value`.
    pub fn complete(value: R) -> Self {
        Self::new(1.0, Some(value))
    }

    /// A pure progress report.
    pub fn progress(done: f64) -> Self {
        Self::new(done, None)
    }

    /// Divide the progress fraction by `parts`, keeping the delta.
    ///
    /// Used when a composite forwards the results of one of `parts` children.
    pub fn scaled(self, parts: usize) -> Self {
        let parts = parts.max(1) as f64;
        Self::new(self.done / parts, self.delta)
    }

    /// Transform the delta, keeping the progress fraction.
    pub fn map_delta<S>(self, f: impl FnOnce(R) -> S) -> PartialResult<S> {
        PartialResult::new(self.done, self.delta.map(f))
    }

    pub fn has_delta(&self) -> bool {
        self.delta.is_some()
    }
}

/// Sum of the progress fractions of `results`.
pub fn total_done<'a, R: 'a>(results: impl IntoIterator<Item = &'a PartialResult<R>>) -> f64 {
    results.into_iter().map(|p| p.done).sum()
}

/// Drain `stream`, keeping every emission. Stops at the first error.
pub async fn collect_results<R>(mut stream: ResultStream<R>) -> Result<Vec<PartialResult<R>>> {
    let mut out = Vec::new();
    while let Some(pr) = stream.next().await {
        out.push(pr?);
    }
    Ok(out)
}

/// Drain `stream`, folding every emission with `monoid`.
pub async fn reduce_results<R, M>(mut stream: ResultStream<R>, monoid: &M) -> Result<PartialResult<R>>
where
    M: Monoid<PartialResult<R>> + ?Sized,
{
    let mut acc = monoid.zero();
    while let Some(pr) = stream.next().await {
        acc = monoid.add(acc, pr?);
    }
    Ok(acc)
}
