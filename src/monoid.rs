//! Commutative monoids and the adapters that lift them over partial results.
//!
//! Results of concurrently running children arrive in no particular order,
//! so every value combined by the engine goes through a [`Monoid`] whose
//! `add` is associative and commutative with `zero` as identity.

use crate::partial::PartialResult;
use std::marker::PhantomData;
use std::sync::Arc;

/// A commutative monoid over values of type `R`.
pub trait Monoid<R>: Send + Sync {
    /// Identity value: `add(zero(), x) == x`.
    fn zero(&self) -> R;

    /// Associative, commutative combination.
    fn add(&self, left: R, right: R) -> R;

    /// Fold a batch of values, starting from [`zero`](Monoid::zero).
    fn reduce(&self, values: Vec<R>) -> R {
        values
            .into_iter()
            .fold(self.zero(), |acc, v| self.add(acc, v))
    }
}

impl<R, M: Monoid<R> + ?Sized> Monoid<R> for Arc<M> {
    fn zero(&self) -> R {
        (**self).zero()
    }

    fn add(&self, left: R, right: R) -> R {
        (**self).add(left, right)
    }
}

/// Lifts a monoid over `R` to a monoid over `PartialResult<R>`.
///
/// Progress fractions are added; deltas are added with the inner monoid, with
/// a missing delta acting as identity.
#[derive(Clone, Debug)]
pub struct PartialResultMonoid<M> {
    inner: M,
}

impl<M> PartialResultMonoid<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<R, M: Monoid<R>> Monoid<PartialResult<R>> for PartialResultMonoid<M> {
    fn zero(&self) -> PartialResult<R> {
        PartialResult::progress(0.0)
    }

    fn add(&self, left: PartialResult<R>, right: PartialResult<R>) -> PartialResult<R> {
        let delta = match (left.delta, right.delta) {
            (None, d) | (d, None) => d,
            (Some(l), Some(r)) => Some(self.inner.add(l, r)),
        };
        PartialResult::new(left.done + right.done, delta)
    }
}

/// Monoid for streams of dataset-producing results.
///
/// At most one emission of such a stream carries a dataset, so `add` keeps
/// whichever side has one and sums the progress fractions.
pub struct DatasetResultMonoid<D> {
    _d: PhantomData<fn() -> D>,
}

impl<D> DatasetResultMonoid<D> {
    pub fn new() -> Self {
        Self { _d: PhantomData }
    }
}

impl<D> Default for DatasetResultMonoid<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> Clone for DatasetResultMonoid<D> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<D> Monoid<PartialResult<D>> for DatasetResultMonoid<D> {
    fn zero(&self) -> PartialResult<D> {
        PartialResult::progress(0.0)
    }

    fn add(&self, left: PartialResult<D>, right: PartialResult<D>) -> PartialResult<D> {
        PartialResult::new(left.done + right.done, left.delta.or(right.delta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plus;
    impl Monoid<i64> for Plus {
        fn zero(&self) -> i64 {
            0
        }
        fn add(&self, left: i64, right: i64) -> i64 {
            left + right
        }
    }

    #[test]
    fn partial_result_monoid_adds_both_parts() {
        let m = PartialResultMonoid::new(Plus);
        let sum = m.reduce(vec![
            PartialResult::new(0.25, Some(2)),
            PartialResult::progress(0.25),
            PartialResult::new(0.5, Some(5)),
        ]);
        assert_eq!(sum.delta, Some(7));
        assert!((sum.done - 1.0).abs() < 1e-12);
    }

    #[test]
    fn partial_result_zero_is_identity() {
        let m = PartialResultMonoid::new(Plus);
        let x = PartialResult::new(0.5, Some(3));
        assert_eq!(m.add(m.zero(), x.clone()), x);
        assert_eq!(m.add(x.clone(), m.zero()), x);
    }

    #[test]
    fn dataset_monoid_keeps_the_single_delta() {
        let m = DatasetResultMonoid::<&str>::new();
        let r = m.add(
            PartialResult::progress(0.5),
            PartialResult::new(0.0, Some("ds")),
        );
        assert_eq!(r.delta, Some("ds"));
        assert_eq!(r.done, 0.5);
    }

    #[test]
    fn arc_delegates() {
        let m: Arc<dyn Monoid<i64>> = Arc::new(Plus);
        assert_eq!(m.reduce(vec![1, 2, 3]), 6);
    }
}
