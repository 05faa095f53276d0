use std::future::Future;

use tokio::task::JoinHandle;
use tracing::Instrument;

/// Spawns a task with a span naming it, so log lines coming out of
/// long-running workers are attributable.
pub fn spawn_named<T, F>(name: &'static str, future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(future.instrument(tracing::info_span!("task", name)))
}
