//! Monoid laws for the built-in sketches and the partial-result adapters.

use anyhow::Result;
use sketchflow::control::StatusListMonoid;
use sketchflow::sketches::{Count, Max, Min, Sum};
use sketchflow::testing::*;
use sketchflow::*;
use std::fmt::Debug;
use std::sync::Arc;

fn check_laws<R, M>(monoid: &M, samples: &[R])
where
    R: Clone + Debug + PartialEq,
    M: Monoid<R>,
{
    for a in samples {
        assert_eq!(&monoid.add(monoid.zero(), a.clone()), a, "left identity");
        assert_eq!(&monoid.add(a.clone(), monoid.zero()), a, "right identity");
        for b in samples {
            assert_eq!(
                monoid.add(a.clone(), b.clone()),
                monoid.add(b.clone(), a.clone()),
                "commutativity of {a:?} and {b:?}"
            );
            for c in samples {
                assert_eq!(
                    monoid.add(monoid.add(a.clone(), b.clone()), c.clone()),
                    monoid.add(a.clone(), monoid.add(b.clone(), c.clone())),
                    "associativity of {a:?}, {b:?}, {c:?}"
                );
            }
        }
    }
}

#[test]
fn builtin_sketches_are_commutative_monoids() {
    check_laws::<i64, _>(&Sum, &[-7, 0, 3, 1_000]);
    check_laws::<u64, _>(&Count, &[0, 1, 42]);
    check_laws::<Option<i64>, _>(&Min, &[None, Some(-1), Some(5)]);
    check_laws::<Option<i64>, _>(&Max, &[None, Some(-1), Some(5)]);
    check_laws::<i64, _>(&Total, &[-2, 0, 9]);
}

#[test]
fn partial_result_monoid_adds_progress_and_deltas() {
    let monoid = PartialResultMonoid::new(Sum);
    let samples = [
        PartialResult::<i64>::progress(0.0),
        PartialResult::progress(0.25),
        PartialResult::new(0.5, Some(3)),
        PartialResult::new(0.125, Some(-4)),
    ];
    check_laws(&monoid, &samples);

    let total = monoid.reduce(samples.to_vec());
    assert_eq!(total, PartialResult::new(0.875, Some(-1)));
}

#[test]
fn dataset_monoid_keeps_the_only_dataset() {
    let monoid = DatasetResultMonoid::<&str>::new();
    let total = monoid.reduce(vec![
        PartialResult::progress(0.25),
        PartialResult::new(0.5, Some("composite")),
        PartialResult::progress(0.25),
    ]);
    assert_eq!(total, PartialResult::new(1.0, Some("composite")));
}

#[test]
fn status_lists_concatenate() {
    let monoid = StatusListMonoid;
    let left = vec![Status::new("a")];
    let right = vec![Status::new("b"), Status::new("c")];
    let all = monoid.add(left, right);
    let reports: Vec<_> = all.iter().map(|s| s.result.as_str()).collect();
    assert_eq!(reports, vec!["a", "b", "c"]);
    assert_eq!(monoid.add(monoid.zero(), all.clone()), all);
}

#[test]
fn builtin_sketches_summarize_partitions() -> Result<()> {
    assert_eq!(Sketch::<Vec<i64>, i64>::create(&Sum, &vec![1, 2, 3])?, 6);
    assert_eq!(Sketch::<Vec<i64>, u64>::create(&Count, &vec![1, 2, 3])?, 3);
    assert_eq!(Sketch::<Vec<i64>, Option<i64>>::create(&Min, &vec![4, -1, 2])?, Some(-1));
    assert_eq!(Sketch::<Vec<i64>, Option<i64>>::create(&Max, &Vec::new())?, None);
    Ok(())
}

#[tokio::test]
async fn sketch_result_ignores_partition_order() -> Result<()> {
    let engine = Engine::inline();
    let forward = composite_of(vec![vec![1i64, 2], vec![7], vec![], vec![-3, 10]], &engine);
    let backward = composite_of(vec![vec![-3i64, 10], vec![], vec![7], vec![1, 2]], &engine);

    for data in [&forward, &backward] {
        assert_eq!(data.reduce_sketch::<i64, _>(Arc::new(Sum)).await?, 17);
        assert_eq!(data.reduce_sketch::<u64, _>(Arc::new(Count)).await?, 5);
        assert_eq!(data.reduce_sketch::<Option<i64>, _>(Arc::new(Min)).await?, Some(-3));
        assert_eq!(data.reduce_sketch::<Option<i64>, _>(Arc::new(Max)).await?, Some(10));
    }
    Ok(())
}

#[tokio::test]
async fn sketch_of_nothing_is_zero() -> Result<()> {
    let engine = Engine::inline();
    let empty: Dataset<Vec<i64>> = Dataset::parallel(Vec::new(), engine.bundler());
    assert_eq!(empty.reduce_sketch::<i64, _>(Arc::new(Sum)).await?, 0);
    assert_eq!(empty.reduce_sketch::<Option<i64>, _>(Arc::new(Max)).await?, None);
    Ok(())
}
