//! Time-window coalescing of result streams.
//!
//! A composite with many children can produce results far faster than a
//! person watching a progress bar can notice. The [`Bundler`] groups results
//! that arrive close together and adds each group up with a monoid, so the
//! caller sees fewer, larger increments with the same total.
//!
//! A window opens with the first result after a flush and closes `window`
//! later; everything that arrived in between is emitted as one sum. Windows in
//! which nothing arrived emit nothing. When the input ends, whatever is pending
//! is flushed immediately.

use crate::monoid::Monoid;
use crate::partial::{PartialResult, ResultStream};
use futures::StreamExt;
use futures::stream;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tracing::trace;

/// Coalesces a result stream over a time window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bundler {
    window: Duration,
}

impl Bundler {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    /// A bundler that forwards results untouched.
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn is_enabled(&self) -> bool {
        !self.window.is_zero()
    }

    /// Bundle `input` using `monoid` to add results in the same window.
    ///
    /// An error is forwarded as soon as it arrives; results still pending in
    /// the current window are discarded with it.
    pub fn bundle<R, M>(&self, input: ResultStream<R>, monoid: M) -> ResultStream<R>
    where
        R: Send + 'static,
        M: Monoid<PartialResult<R>> + 'static,
    {
        if !self.is_enabled() {
            return input;
        }
        let state = Window {
            input,
            monoid,
            width: self.window,
            pending: None,
            count: 0,
            deadline: None,
            finished: false,
        };
        stream::unfold(state, |mut w| async move {
            loop {
                if w.finished {
                    return None;
                }
                let next = match w.deadline {
                    Some(deadline) => tokio::select! {
                        biased;
                        _ = sleep_until(deadline) => None,
                        item = w.input.next() => Some(item),
                    },
                    None => Some(w.input.next().await),
                };
                match next {
                    None => {
                        if let Some(batch) = w.flush() {
                            return Some((Ok(batch), w));
                        }
                    }
                    Some(Some(Ok(pr))) => w.push(pr),
                    Some(Some(Err(e))) => {
                        w.finished = true;
                        w.pending = None;
                        return Some((Err(e), w));
                    }
                    Some(None) => {
                        w.finished = true;
                        return w.flush().map(|batch| (Ok(batch), w));
                    }
                }
            }
        })
        .boxed()
    }
}

impl Default for Bundler {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

struct Window<R, M> {
    input: ResultStream<R>,
    monoid: M,
    width: Duration,
    pending: Option<PartialResult<R>>,
    count: usize,
    deadline: Option<Instant>,
    finished: bool,
}

impl<R, M: Monoid<PartialResult<R>>> Window<R, M> {
    fn push(&mut self, pr: PartialResult<R>) {
        self.pending = Some(match self.pending.take() {
            None => pr,
            Some(acc) => self.monoid.add(acc, pr),
        });
        self.count += 1;
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.width);
        }
    }

    fn flush(&mut self) -> Option<PartialResult<R>> {
        self.deadline = None;
        let batch = self.pending.take()?;
        trace!(values = self.count, "bundling");
        self.count = 0;
        Some(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::monoid::PartialResultMonoid;
    use crate::partial::collect_results;

    struct Plus;
    impl Monoid<u32> for Plus {
        fn zero(&self) -> u32 {
            0
        }
        fn add(&self, left: u32, right: u32) -> u32 {
            left + right
        }
    }

    fn ready(items: Vec<PartialResult<u32>>) -> ResultStream<u32> {
        stream::iter(items.into_iter().map(Ok)).boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_result() -> anyhow::Result<()> {
        let input = ready(vec![
            PartialResult::new(0.25, Some(1)),
            PartialResult::new(0.25, Some(2)),
            PartialResult::progress(0.5),
        ]);
        let out = collect_results(
            Bundler::new(Duration::from_millis(100)).bundle(input, PartialResultMonoid::new(Plus)),
        )
        .await?;
        assert_eq!(out, vec![PartialResult::new(1.0, Some(3))]);
        Ok(())
    }

    #[tokio::test]
    async fn disabled_bundler_is_identity() -> anyhow::Result<()> {
        let items = vec![PartialResult::new(0.5, Some(1)), PartialResult::new(0.5, Some(2))];
        let out = collect_results(
            Bundler::disabled().bundle(ready(items.clone()), PartialResultMonoid::new(Plus)),
        )
        .await?;
        assert_eq!(out, items);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn error_is_forwarded_and_ends_stream() {
        let input = stream::iter(vec![
            Ok(PartialResult::new(0.5, Some(1))),
            Err(Error::Protocol("bad".into())),
            Ok(PartialResult::new(0.5, Some(1))),
        ])
        .boxed();
        let mut out = Bundler::new(Duration::from_millis(10)).bundle(input, PartialResultMonoid::new(Plus));
        assert!(matches!(out.next().await, Some(Err(Error::Protocol(_)))));
        assert!(out.next().await.is_none());
    }
}
