use std::collections::HashMap;
use std::future::Future;

use futures::{StreamExt, stream};

use crate::error::UploaderError;

/// Runs labelled tasks with at most `limit` in flight. Every task runs to
/// completion regardless of sibling failures; results are keyed by label.
pub async fn run_bounded<T, Fut>(
    limit: usize,
    tasks: Vec<(String, Fut)>,
) -> HashMap<String, Result<T, UploaderError>>
where
    Fut: Future<Output = Result<T, UploaderError>>,
{
    stream::iter(
        tasks
            .into_iter()
            .map(|(label, task)| async move { (label, task.await) }),
    )
    .buffer_unordered(limit.max(1))
    .collect()
    .await
}

/// Unwraps a result map, surfacing the error of the earliest label in `order`.
pub fn collect_all<T>(
    order: &[String],
    mut results: HashMap<String, Result<T, UploaderError>>,
) -> Result<HashMap<String, T>, UploaderError> {
    let first_failed = order
        .iter()
        .find(|label| matches!(results.get(*label), Some(Err(_))))
        .cloned();
    if let Some(label) = first_failed {
        if let Some(Err(err)) = results.remove(&label) {
            return Err(err);
        }
    }
    results
        .into_iter()
        .map(|(label, result)| result.map(|value| (label, value)))
        .collect()
}
