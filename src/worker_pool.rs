//! Worker Pool (C9): a bounded-parallelism executor for CPU-bound transform
//! jobs, backed by native OS threads rather than async tasks, because the
//! spec's crash/retry semantics need a thread that can actually die.
//!
//! One retry is granted for an abnormal worker exit only (thread panic or
//! channel disconnect); a job that itself returns `{error}` is never
//! retried, per the decision recorded in `DESIGN.md`.

use crate::error::{PoolError, TransformError};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// One unit of work submitted to the pool.
#[derive(Clone, Debug)]
pub struct Job {
    pub id: u64,
    pub path: std::path::PathBuf,
    pub ext: String,
    pub code: String,
    pub module_hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobOutput {
    pub code: String,
    pub map: Option<String>,
    pub kind: String,
}

type JobResult = Result<JobOutput, String>;

struct Task {
    job: Job,
    byte_len: u64,
    reply: tokio::sync::oneshot::Sender<Result<JobResult, PoolError>>,
    attempts_left: u8,
}

/// A function performing the actual transform. Workers call this on their
/// own thread; a panic inside it is caught and treated as an abnormal exit.
pub type WorkerFn = Arc<dyn Fn(&Job) -> JobResult + Send + Sync>;

struct Shared {
    queue_bytes: AtomicU64,
    max_queue_bytes: Option<u64>,
    closed: std::sync::atomic::AtomicBool,
}

pub struct WorkerPool {
    task_tx: Mutex<Option<Sender<Task>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
    drain_notify: Arc<tokio::sync::Notify>,
}

impl WorkerPool {
    pub fn new(size: usize, max_queue_bytes: Option<u64>, work: WorkerFn) -> Self {
        let size = size.max(1);
        let (task_tx, task_rx) = bounded::<Task>(size * 4 + 16);
        let shared = Arc::new(Shared {
            queue_bytes: AtomicU64::new(0),
            max_queue_bytes,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let drain_notify = Arc::new(tokio::sync::Notify::new());

        // Only the pool itself holds a `Sender`; workers hold `Receiver`
        // clones only, so dropping `task_tx` in `close()` is what actually
        // disconnects the channel and lets every worker thread exit its
        // `recv()` loop.
        let mut handles = Vec::with_capacity(size);
        for worker_id in 0..size {
            handles.push(spawn_worker(
                worker_id,
                task_rx.clone(),
                work.clone(),
                shared.clone(),
                drain_notify.clone(),
            ));
        }

        Self {
            task_tx: Mutex::new(Some(task_tx)),
            handles: Mutex::new(handles),
            shared,
            drain_notify,
        }
    }

    pub fn default_size() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1)
    }

    /// Run one job, suspending under backpressure until queued bytes drain.
    pub async fn run(&self, job: Job) -> Result<JobResult, PoolError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed);
        }

        let byte_len = job.code.len() as u64;
        if let Some(max) = self.shared.max_queue_bytes {
            loop {
                let current = self.shared.queue_bytes.load(Ordering::Acquire);
                if current == 0 || current + byte_len <= max {
                    break;
                }
                self.drain_notify.notified().await;
                if self.shared.closed.load(Ordering::Acquire) {
                    return Err(PoolError::PoolClosed);
                }
            }
        }

        self.shared.queue_bytes.fetch_add(byte_len, Ordering::AcqRel);

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let task = Task {
            job,
            byte_len,
            reply: reply_tx,
            attempts_left: 2,
        };

        // Nothing in the critical section below can panic, so the mutex
        // can only be poisoned by a bug elsewhere; treat that as fatal
        // rather than threading a recovery path through every caller.
        #[allow(clippy::expect_used)]
        let sender = self
            .task_tx
            .lock()
            .expect("pool lock poisoned")
            .clone()
            .ok_or(PoolError::PoolClosed)?;
        sender.send(task).map_err(|_| PoolError::Disconnected)?;

        reply_rx.await.map_err(|_| PoolError::Disconnected)?
    }

    /// Run jobs concurrently, preserving input order in the result vector.
    pub async fn run_many(&self, jobs: Vec<Job>) -> Result<Vec<JobResult>, PoolError> {
        let futures = jobs.into_iter().map(|job| self.run(job));
        futures_util::future::try_join_all(futures).await
    }

    /// Terminate all workers, release waiters, discard the queue.
    #[allow(clippy::expect_used)]
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.drain_notify.notify_waiters();
        // Dropping the pool's sender disconnects the channel; queued tasks
        // are dropped along with it, and their `reply` oneshot senders going
        // out of scope causes any still-awaiting callers to observe
        // `Disconnected`. Every worker then returns from `recv()` and exits.
        // As above, the mutexes here guard plain data with no panicking
        // code in their critical sections.
        self.task_tx.lock().expect("pool lock poisoned").take();
        for handle in self.handles.lock().expect("pool lock poisoned").drain(..) {
            let _ = handle.join();
        }
    }
}

// `WorkerPool::new` is infallible by design (`spec.md` §4.9 has no
// "pool failed to start" state); failing to spawn an OS thread here means
// the process is already out of resources, which nothing upstream could
// meaningfully recover from either.
#[allow(clippy::expect_used)]
fn spawn_worker(
    worker_id: usize,
    rx: Receiver<Task>,
    work: WorkerFn,
    shared: Arc<Shared>,
    drain_notify: Arc<tokio::sync::Notify>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(format!("ionify-worker-{worker_id}"))
        .spawn(move || {
            while let Ok(mut task) = rx.recv() {
                let job_clone = task.job.clone();
                let work = work.clone();
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work(&job_clone)));

                match outcome {
                    Ok(result) => {
                        shared
                            .queue_bytes
                            .fetch_sub(task.byte_len, Ordering::AcqRel);
                        drain_notify.notify_waiters();
                        let _ = task.reply.send(Ok(result));
                    }
                    Err(_) if task.attempts_left > 1 => {
                        // Abnormal exit: requeue at the head once, per
                        // `spec.md` §4.9. We approximate "head of queue" by
                        // re-sending immediately on this same worker rather
                        // than round-tripping through the shared queue,
                        // since crossbeam's bounded channel has no
                        // front-insert primitive.
                        task.attempts_left -= 1;
                        tracing::warn!(worker = worker_id, "worker panicked, retrying job once");
                        let job_clone = task.job.clone();
                        let retry = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                            work(&job_clone)
                        }));
                        shared
                            .queue_bytes
                            .fetch_sub(task.byte_len, Ordering::AcqRel);
                        drain_notify.notify_waiters();
                        match retry {
                            Ok(result) => {
                                let _ = task.reply.send(Ok(result));
                            }
                            Err(_) => {
                                let err = TransformError::WorkerCrashed {
                                    module: crate::data::ModuleId::new(&task.job.path),
                                };
                                tracing::error!(worker = worker_id, error = %err, "worker crashed twice");
                                // Deliver the richer error to the caller instead of
                                // downgrading to `PoolError::Disconnected`: a second
                                // abnormal exit for the *same job* is a transform
                                // failure (`spec.md` §4.9), not a pool-level fault.
                                let _ = task.reply.send(Ok(Err(err.to_string())));
                            }
                        }
                    }
                    Err(_) => {
                        shared
                            .queue_bytes
                            .fetch_sub(task.byte_len, Ordering::AcqRel);
                        drain_notify.notify_waiters();
                        let _ = task.reply.send(Err(PoolError::Disconnected));
                    }
                }
            }
        })
        .expect("failed to spawn worker thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_job(id: u64, code: &str) -> Job {
        Job {
            id,
            path: format!("/m{id}.ts").into(),
            ext: "ts".into(),
            code: code.to_string(),
            module_hash: None,
        }
    }

    #[tokio::test]
    async fn run_many_preserves_input_order() {
        let pool = WorkerPool::new(4, None, Arc::new(|job: &Job| {
            Ok(JobOutput {
                code: job.code.clone(),
                map: None,
                kind: "js".into(),
            })
        }));

        let jobs = vec![echo_job(1, "a"), echo_job(2, "b"), echo_job(3, "c")];
        let results = pool.run_many(jobs).await.unwrap();
        let codes: Vec<_> = results
            .into_iter()
            .map(|r| r.unwrap().code)
            .collect();
        assert_eq!(codes, vec!["a", "b", "c"]);
        pool.close();
    }

    #[tokio::test]
    async fn close_rejects_new_submissions() {
        let pool = WorkerPool::new(1, None, Arc::new(|job: &Job| {
            Ok(JobOutput {
                code: job.code.clone(),
                map: None,
                kind: "js".into(),
            })
        }));
        pool.close();
        let err = pool.run(echo_job(1, "a")).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolClosed));
    }

    #[tokio::test]
    async fn job_level_error_is_not_retried_as_a_crash() {
        let pool = WorkerPool::new(1, None, Arc::new(|_job: &Job| {
            Err("parse error".to_string())
        }));
        let result = pool.run(echo_job(1, "a")).await.unwrap();
        assert_eq!(result, Err("parse error".to_string()));
        pool.close();
    }

    #[tokio::test]
    async fn second_worker_crash_surfaces_transform_error_to_caller() {
        let pool = WorkerPool::new(1, None, Arc::new(|_job: &Job| {
            panic!("boom");
        }));
        // `run` resolves to `Ok(JobResult)` with the pool layer intact; the
        // crash surfaces one level down, inside the `JobResult`.
        let result = pool.run(echo_job(1, "a")).await.unwrap();
        let message = result.unwrap_err();
        assert!(message.contains("crashed twice"), "{message}");
        pool.close();
    }
}
