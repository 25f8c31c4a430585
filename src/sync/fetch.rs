use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Outcome of a concurrent batch. Every key lands in exactly one of
/// `succeeded` or `failed`.
#[derive(Debug)]
pub struct FetchBatchResult<K, T> {
    pub succeeded: HashMap<K, T>,
    pub failed: HashMap<K, Error>,
    /// Set when a key hit an error that stops the whole batch. Keys not yet
    /// started at that point are in `failed` as `Cancelled`.
    pub aborted: Option<Error>,
}

impl<K: Eq + Hash, T> FetchBatchResult<K, T> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.aborted.is_none()
    }

    pub fn failed_keys(&self) -> HashSet<&K> {
        self.failed.keys().collect()
    }
}

/// Run `fetch_one` for every distinct key with at most `max_concurrency`
/// in flight. A failing key never stops its siblings, unless the failure is
/// run-fatal; then, as on cancellation, no further keys are started and
/// in-flight fetches finish on their own.
pub async fn fetch_all<K, T, F, Fut>(
    keys: impl IntoIterator<Item = K>,
    max_concurrency: usize,
    cancel: &CancellationToken,
    fetch_one: F,
) -> FetchBatchResult<K, T>
where
    K: Eq + Hash + Clone,
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut seen = HashSet::new();
    let keys: Vec<K> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
    let halt = cancel.child_token();

    let outcomes: Vec<(K, Result<T>)> = stream::iter(keys)
        .map(|key| {
            let halt = &halt;
            let fetch_one = &fetch_one;
            async move {
                if halt.is_cancelled() {
                    return (key, Err(Error::Cancelled));
                }
                let result = fetch_one(key.clone()).await;
                if let Err(e) = &result {
                    if e.is_run_fatal() {
                        log::error!("Stopping batch: {e}");
                        halt.cancel();
                    }
                }
                (key, result)
            }
        })
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await;

    let mut batch = FetchBatchResult {
        succeeded: HashMap::new(),
        failed: HashMap::new(),
        aborted: None,
    };
    for (key, result) in outcomes {
        match result {
            Ok(value) => {
                batch.succeeded.insert(key, value);
            }
            Err(e) => {
                if batch.aborted.is_none() {
                    batch.aborted = e.run_fatal_copy();
                }
                batch.failed.insert(key, e);
            }
        }
    }
    batch
}
