use futures::{StreamExt, stream};
use std::future::Future;

pub const DEFAULT_CONCURRENCY: usize = 3;

/// Run `f` over `items` with at most `limit` futures in flight. Results come
/// back in input order once every item has finished. A limit of 0 is
/// treated as 1.
///
/// `f` should return its own `Result` per item so that one failure does not
/// short-circuit its siblings.
pub async fn run_bounded<I, T, F, Fut>(items: I, limit: usize, f: F) -> Vec<T>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> Fut,
    Fut: Future<Output = T>,
{
    stream::iter(items)
        .map(f)
        .buffered(limit.max(1))
        .collect()
        .await
}
