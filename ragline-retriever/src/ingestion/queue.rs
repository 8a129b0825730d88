//! Bounded-concurrency queue for file executions.

use super::workflow::{FileOutcome, WorkflowError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tracing::error;

type JobResult = Result<FileOutcome, WorkflowError>;

/// Runs submitted executions with at most `concurrency` of them active at
/// once. Results are collected with [`FileQueue::drain`].
///
/// Every job comes back with its label, including one that panicked or was
/// aborted: that job reports [`WorkflowError::Join`].
pub struct FileQueue {
    permits: Arc<Semaphore>,
    tasks: JoinSet<JobResult>,
    labels: HashMap<Id, String>,
    concurrency: usize,
}

impl FileQueue {
    pub fn new(concurrency: usize) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            permits: Arc::new(Semaphore::new(concurrency)),
            tasks: JoinSet::new(),
            labels: HashMap::new(),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Number of jobs submitted and not yet collected.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Queue `job`. It starts as soon as a permit is free.
    pub fn submit<F>(&mut self, label: String, job: F)
    where
        F: Future<Output = JobResult> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let handle = self.tasks.spawn(async move {
            // Acquire only fails on a closed semaphore, which never happens
            // while the queue is alive.
            let _permit = permits.acquire_owned().await;
            job.await
        });
        self.labels.insert(handle.id(), label);
    }

    /// Wait for the next job to finish.
    pub async fn next(&mut self) -> Option<(String, JobResult)> {
        match self.tasks.join_next_with_id().await? {
            Ok((id, result)) => Some((self.labels.remove(&id).unwrap_or_default(), result)),
            Err(err) => {
                let label = self.labels.remove(&err.id()).unwrap_or_default();
                error!(label = %label, "Queued execution panicked or was aborted: {}", err);
                Some((label, Err(WorkflowError::Join(err))))
            }
        }
    }

    /// Wait for every job and return the results in completion order.
    pub async fn drain(mut self) -> Vec<(String, JobResult)> {
        let mut results = Vec::with_capacity(self.tasks.len());
        while let Some(done) = self.next().await {
            results.push(done);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_queue_bounds_concurrency() {
        let mut queue = FileQueue::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..6 {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            queue.submit(format!("file-{i}"), async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(FileOutcome::Cancelled {
                    path: format!("file-{i}"),
                })
            });
        }
        assert_eq!(queue.len(), 6);

        let results = queue.drain().await;
        assert_eq!(results.len(), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(results.iter().all(|(label, r)| {
            matches!(r, Ok(FileOutcome::Cancelled { path }) if path == label)
        }));
    }

    #[tokio::test]
    async fn test_panicking_job_keeps_its_label() {
        let mut queue = FileQueue::new(2);
        queue.submit("/docs/ok.txt".into(), async {
            Ok(FileOutcome::Cancelled {
                path: "/docs/ok.txt".into(),
            })
        });
        let explode = true;
        queue.submit("/docs/boom.txt".into(), async move {
            if explode {
                panic!("loader blew up");
            }
            Ok(FileOutcome::Cancelled {
                path: "/docs/boom.txt".into(),
            })
        });

        let mut results = queue.drain().await;
        results.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "/docs/boom.txt");
        assert!(matches!(&results[0].1, Err(WorkflowError::Join(err)) if err.is_panic()));
        assert!(results[1].1.is_ok());
    }

    #[tokio::test]
    async fn test_zero_concurrency_still_runs() {
        let mut queue = FileQueue::new(0);
        assert_eq!(queue.concurrency(), 1);
        queue.submit("only".into(), async {
            Ok(FileOutcome::Cancelled {
                path: "only".into(),
            })
        });
        assert_eq!(queue.drain().await.len(), 1);
    }
}
