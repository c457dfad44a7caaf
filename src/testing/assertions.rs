//! Assertion functions for dataset results.

use crate::capability::Element;
use crate::dataset::Dataset;
use crate::partial::PartialResult;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;

/// Tolerance used when adding up progress fractions.
pub const PROGRESS_EPSILON: f64 = 1e-9;

/// Assert that the progress of a finished operation adds up to one.
///
/// Every fraction must lie in `[0, 1]` and no prefix may exceed one.
///
/// # Panics
///
/// Panics if a fraction is out of range, a prefix overshoots, or the total is
/// not `1.0` within [`PROGRESS_EPSILON`].
///
/// # Example
///
/// ```
/// use sketchflow::PartialResult;
/// use sketchflow::testing::assert_progress_complete;
///
/// let results = vec![PartialResult::<u8>::progress(0.5), PartialResult::new(0.5, Some(1))];
/// assert_progress_complete(&results);
/// ```
pub fn assert_progress_complete<R: Debug>(results: &[PartialResult<R>]) {
    let total = assert_progress_bounded(results);
    assert!(
        (total - 1.0).abs() <= PROGRESS_EPSILON,
        "Progress does not add up:\n  Total: {total}\n  Results: {results:?}"
    );
}

/// Assert that progress never exceeds one; returns the total.
///
/// # Panics
///
/// Panics if a fraction is out of range or a prefix overshoots.
pub fn assert_progress_bounded<R: Debug>(results: &[PartialResult<R>]) -> f64 {
    let mut total = 0.0;
    for (i, pr) in results.iter().enumerate() {
        assert!(
            (0.0..=1.0).contains(&pr.done),
            "Progress fraction out of range at index {i}: {}\n  Results: {results:?}",
            pr.done
        );
        total += pr.done;
        assert!(
            total <= 1.0 + PROGRESS_EPSILON,
            "Progress overshoots at index {i}: {total}\n  Results: {results:?}"
        );
    }
    total
}

/// Assert that two collections are equal in order and content.
///
/// # Panics
///
/// Panics if the collections differ in length or content.
///
/// # Example
///
/// ```
/// use sketchflow::testing::assert_collections_equal;
///
/// assert_collections_equal(&[1, 2, 3], &[1, 2, 3]);
/// ```
pub fn assert_collections_equal<T: Debug + PartialEq>(actual: &[T], expected: &[T]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Collection length mismatch:\n  Expected: {expected:?}\n  Actual: {actual:?}"
    );
    for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert_eq!(
            a, e,
            "Collection mismatch at index {i}:\n  Full expected: {expected:?}\n  Full actual: {actual:?}"
        );
    }
}

/// Assert that two collections contain the same elements, ignoring order.
///
/// # Panics
///
/// Panics if the collections differ in content (ignoring order).
pub fn assert_collections_unordered_equal<T: Debug + Eq + Hash>(actual: &[T], expected: &[T]) {
    assert_eq!(
        actual.len(),
        expected.len(),
        "Collection length mismatch:\n  Expected: {expected:?}\n  Actual: {actual:?}"
    );
    let actual_set: HashSet<_> = actual.iter().collect();
    let expected_set: HashSet<_> = expected.iter().collect();
    if actual_set != expected_set {
        let missing: Vec<_> = expected_set.difference(&actual_set).collect();
        let extra: Vec<_> = actual_set.difference(&expected_set).collect();
        panic!("Collection content mismatch:\n  Missing elements: {missing:?}\n  Extra elements: {extra:?}");
    }
}

/// Partitions of every local leaf under `dataset`, depth first in child order.
///
/// Proxies contribute nothing; their partitions live in another process.
pub fn leaf_values<T: Element + Clone>(dataset: &Dataset<T>) -> Vec<T> {
    let mut out = Vec::new();
    collect_leaves(dataset, &mut out);
    out
}

fn collect_leaves<T: Element + Clone>(dataset: &Dataset<T>, out: &mut Vec<T>) {
    match dataset {
        Dataset::Leaf(leaf) => out.push(leaf.value().clone()),
        Dataset::Composite(composite) => {
            for child in composite.children() {
                collect_leaves(child, out);
            }
        }
        Dataset::Proxy(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "Progress does not add up")]
    fn incomplete_progress_panics() {
        assert_progress_complete(&[PartialResult::<u8>::progress(0.5)]);
    }

    #[test]
    #[should_panic(expected = "overshoots")]
    fn overshoot_panics() {
        assert_progress_bounded(&[PartialResult::<u8>::progress(0.75), PartialResult::progress(0.5)]);
    }

    #[test]
    fn unordered_ignores_order() {
        assert_collections_unordered_equal(&[3, 1, 2], &[1, 2, 3]);
    }
}
