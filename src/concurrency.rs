//! Concurrency helper: bound the number of write batches in flight.

use rayon::prelude::*;

/// Apply `f` to every item, at most `limit` at a time. Results keep item order.
/// `limit <= 1` runs inline on the calling thread.
pub fn map_limited<T, R, F>(items: &[T], limit: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Sync + Fn(&T) -> R,
{
    if limit <= 1 {
        return items.iter().map(&f).collect();
    }
    let mut out = Vec::with_capacity(items.len());
    for window in items.chunks(limit) {
        out.extend(window.par_iter().map(&f).collect::<Vec<_>>());
    }
    out
}
