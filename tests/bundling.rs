//! Time-window bundling on composites.

use anyhow::Result;
use sketchflow::testing::*;
use sketchflow::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn bundled_sketch_matches_unbundled() -> Result<()> {
    let values: Vec<i64> = (1..=10).collect();
    let plain = Engine::inline();
    let bundled = Engine::inline().with_bundler(Bundler::new(Duration::from_millis(250)));

    let unbundled = collect_results(composite_of(values.clone(), &plain).sketch::<i64, _>(Arc::new(Total))).await?;
    assert_eq!(unbundled.len(), 10);

    let burst = collect_results(composite_of(values, &bundled).sketch::<i64, _>(Arc::new(Total))).await?;
    assert_eq!(burst.len(), 1);
    assert_progress_complete(&burst);
    assert_eq!(burst[0].delta, Some(55));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bundled_map_still_yields_one_composite() -> Result<()> {
    let engine = Engine::inline().with_bundler(Bundler::new(Duration::from_millis(250)));
    let data = composite_of(vec![1i64, 2, 3], &engine);

    let results = collect_results(data.map::<i64, _>(Arc::new(Increment))).await?;
    assert_eq!(results.len(), 1);
    assert_progress_complete(&results);
    let mapped = results.into_iter().find_map(|r| r.delta);
    let Some(mapped) = mapped else {
        panic!("bundled map produced no dataset");
    };
    assert_collections_equal(&leaf_values(&mapped), &[2, 3, 4]);
    Ok(())
}

#[tokio::test]
async fn a_late_child_lands_in_a_later_window() -> Result<()> {
    let pool = PoolExecutor::new(Some(4))?;
    let engine = Engine::new(Arc::new(pool), Bundler::new(Duration::from_millis(50)));
    let data = composite_of(vec![1i64, 2, 3], &engine);

    let results = collect_results(data.map::<i64, _>(Arc::new(DelayOn {
        value: 3,
        millis: 500,
    })))
    .await?;
    assert!(results.len() >= 2, "{results:?}");
    assert_progress_complete(&results);
    assert!(results.last().is_some_and(PartialResult::has_delta));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn bundling_preserves_errors() -> Result<()> {
    let engine = Engine::inline().with_bundler(Bundler::new(Duration::from_millis(250)));
    let data = composite_of(vec![1i64, 2, 3], &engine);

    let err = collect_results(data.map::<i64, _>(Arc::new(FailOn(3))))
        .await
        .err();
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::UserFunction));
    Ok(())
}
