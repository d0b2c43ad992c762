//! Bounded-parallelism worker pool for page recognition.

use std::{fmt, future::Future, time::Duration};

use futures::{StreamExt as _, stream};
use tokio::time;

use crate::{backends::RecognitionError, prelude::*};

/// What limits a pool's tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskGranularity {
    /// Tasks keep a CPU busy, so run about one per core.
    CpuBound,
    /// Tasks mostly wait on the network, so run many at once.
    IoBound,
}

impl fmt::Display for TaskGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskGranularity::CpuBound => write!(f, "cpu-bound"),
            TaskGranularity::IoBound => write!(f, "io-bound"),
        }
    }
}

/// Runs tasks with at most `concurrency` in flight. Each task runs as its own
/// Tokio task, so a timeout or panic affects only that task.
///
/// With no `task_timeout`, tasks are expected to enforce their own deadline.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    granularity: TaskGranularity,
    concurrency: usize,
    task_timeout: Option<Duration>,
}

impl WorkerPool {
    pub fn new(
        granularity: TaskGranularity,
        concurrency: usize,
        task_timeout: Option<Duration>,
    ) -> Self {
        Self {
            granularity,
            concurrency: concurrency.max(1),
            task_timeout,
        }
    }

    pub fn granularity(&self) -> TaskGranularity {
        self.granularity
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Run `work` on every item, returning results in completion order, each
    /// tagged with its key. `on_done` is called as each task finishes.
    pub async fn run_all<K, T, R, F, Fut>(
        &self,
        items: Vec<(K, T)>,
        work: F,
        mut on_done: impl FnMut(),
    ) -> Vec<(K, Result<R, RecognitionError>)>
    where
        K: Copy + fmt::Display,
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<R, RecognitionError>> + Send + 'static,
        R: Send + 'static,
    {
        let task_timeout = self.task_timeout;
        let mut results = stream::iter(items)
            .map(|(key, item)| {
                let handle = tokio::spawn(work(item));
                async move { (key, join_with_timeout(handle, task_timeout).await) }
            })
            .buffer_unordered(self.concurrency);

        let mut collected = Vec::new();
        while let Some((key, result)) = results.next().await {
            if let Err(err) = &result {
                warn!(granularity = %self.granularity, task = %key, "Task failed: {}", err);
            }
            on_done();
            collected.push((key, result));
        }
        collected
    }
}

/// Wait for a spawned task, aborting it if it runs longer than `limit`.
async fn join_with_timeout<R>(
    mut handle: tokio::task::JoinHandle<Result<R, RecognitionError>>,
    limit: Option<Duration>,
) -> Result<R, RecognitionError> {
    let joined = match limit {
        Some(limit) => match time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // Dropping the task also drops any child process it owns.
                handle.abort();
                return Err(RecognitionError::Timeout(limit));
            }
        },
        None => (&mut handle).await,
    };
    match joined {
        Ok(result) => result,
        Err(join_err) if join_err.is_panic() => {
            let payload = join_err.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_owned());
            Err(RecognitionError::Crashed(msg))
        }
        Err(join_err) => Err(RecognitionError::Crashed(join_err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn results_cover_every_item() {
        let pool = WorkerPool::new(TaskGranularity::IoBound, 3, Some(Duration::from_secs(5)));
        let items = (1..=10u32).map(|i| (i, i)).collect::<Vec<_>>();
        let mut done = 0;
        let results = pool
            .run_all(
                items,
                |i| async move {
                    time::sleep(Duration::from_millis(u64::from(20 - i))).await;
                    Ok(i * 2)
                },
                || done += 1,
            )
            .await;
        assert_eq!(done, 10);
        let mut keys = results.iter().map(|(k, _)| *k).collect::<Vec<_>>();
        keys.sort();
        assert_eq!(keys, (1..=10).collect::<Vec<_>>());
        assert!(results.iter().all(|(k, r)| *r.as_ref().unwrap() == k * 2));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(TaskGranularity::CpuBound, 2, Some(Duration::from_secs(5)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items = (1..=8u32).map(|i| (i, ())).collect::<Vec<_>>();
        pool.run_all(
            items,
            |()| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            || {},
        )
        .await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_only_the_slow_task() {
        let pool = WorkerPool::new(TaskGranularity::IoBound, 4, Some(Duration::from_secs(1)));
        let items = vec![(1u32, 0u64), (2, 5), (3, 0)];
        let results = pool
            .run_all(
                items,
                |secs| async move {
                    time::sleep(Duration::from_secs(secs)).await;
                    Ok(secs)
                },
                || {},
            )
            .await;
        for (key, result) in results {
            if key == 2 {
                assert!(matches!(result, Err(RecognitionError::Timeout(_))));
            } else {
                assert!(result.is_ok());
            }
        }
    }

    #[tokio::test]
    async fn panics_become_crashed_pages() {
        let pool = WorkerPool::new(TaskGranularity::CpuBound, 2, Some(Duration::from_secs(5)));
        let results = pool
            .run_all(
                vec![(1u32, true), (2, false)],
                |explode| async move {
                    if explode {
                        panic!("engine exploded");
                    }
                    Ok(())
                },
                || {},
            )
            .await;
        for (key, result) in results {
            match key {
                1 => match result {
                    Err(RecognitionError::Crashed(msg)) => assert!(msg.contains("exploded")),
                    other => panic!("unexpected result {other:?}"),
                },
                _ => assert!(result.is_ok()),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn untimed_pool_waits_for_slow_tasks() {
        let pool = WorkerPool::new(TaskGranularity::IoBound, 2, None);
        let results = pool
            .run_all(
                vec![(1u32, 600u64), (2, 0)],
                |secs| async move {
                    time::sleep(Duration::from_secs(secs)).await;
                    Ok(secs)
                },
                || {},
            )
            .await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }
}
