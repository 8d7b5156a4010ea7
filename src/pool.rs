//! Bounded concurrent executor shared by the create and write engines.
//!
//! A fixed number of permits caps how many submitted tasks run at once;
//! everything else queues inside the task itself, waiting on the
//! semaphore. Results are drained one at a time through [`WorkerPool::
//! next_event`], so all aggregation (id maps, fail records, the fail
//! file) happens on the caller's completion path and never concurrently
//! from worker bodies.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::FlowError;

/// Monotonic abort signal. Once triggered it never resets; workers treat
/// it as advisory and check it between row-level retries, not mid-call.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag {
    token: CancellationToken,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Raised when a task dies outside its own error handling (a panic or a
/// cancelled runtime). Caught at the pool boundary so a single failing
/// task never aborts siblings already in flight.
#[derive(Debug)]
pub struct WorkerFailure {
    pub detail: String,
}

/// One drained completion from the pool.
#[derive(Debug)]
pub enum PoolEvent<T> {
    /// The task ran to completion and produced its result.
    Completed(T),
    /// The task was cancelled before it started running.
    Cancelled,
    /// The task died unexpectedly; the abort flag has been set.
    Failed(WorkerFailure),
}

enum TaskOutcome<T> {
    Completed(T),
    Cancelled,
}

/// Fixed-size concurrent worker pool.
///
/// Capacity is fixed at construction and must be at least 1. Submitted
/// tasks are independent; there is no ordering guarantee on completion.
/// The pool always drains to a terminal state, abort included: in-flight
/// work finishes, not-yet-started work is cancelled at the next
/// opportunity.
pub struct WorkerPool<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<TaskOutcome<T>>,
    abort: AbortFlag,
    capacity: usize,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(max_connection: usize) -> Result<Self, FlowError> {
        if max_connection < 1 {
            return Err(FlowError::Configuration(
                "max_connection must be a positive integer".to_string(),
            ));
        }
        log::debug!("initialized worker pool with {} connections", max_connection);
        Ok(Self {
            permits: Arc::new(Semaphore::new(max_connection)),
            tasks: JoinSet::new(),
            abort: AbortFlag::new(),
            capacity: max_connection,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A clone of the pool's abort flag, shareable with worker bodies.
    pub fn abort_flag(&self) -> AbortFlag {
        self.abort.clone()
    }

    /// Requests the pool to stop: no new submissions are accepted and
    /// tasks still waiting for a permit return `Cancelled` instead of
    /// running. Tasks already holding a permit run to completion.
    pub fn abort(&self) {
        self.abort.trigger();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_set()
    }

    /// Submits a task. Returns `false` without spawning when the abort
    /// flag is already set.
    pub fn submit<F>(&mut self, task: F) -> bool
    where
        F: Future<Output = T> + Send + 'static,
    {
        if self.abort.is_set() {
            return false;
        }
        let permits = self.permits.clone();
        let token = self.abort.token.clone();
        self.tasks.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => return TaskOutcome::Cancelled,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return TaskOutcome::Cancelled,
                },
            };
            let result = task.await;
            drop(permit);
            TaskOutcome::Completed(result)
        });
        true
    }

    /// Number of tasks submitted and not yet drained.
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Waits for the next task to finish. Returns `None` once every
    /// submitted task has been drained. A panicking task is reported as
    /// [`PoolEvent::Failed`] and sets the abort flag; siblings keep
    /// running.
    pub async fn next_event(&mut self) -> Option<PoolEvent<T>> {
        match self.tasks.join_next().await? {
            Ok(TaskOutcome::Completed(value)) => Some(PoolEvent::Completed(value)),
            Ok(TaskOutcome::Cancelled) => Some(PoolEvent::Cancelled),
            Err(err) => {
                let detail = err.to_string();
                log::error!("a worker task failed unexpectedly: {detail}");
                self.abort.trigger();
                Some(PoolEvent::Failed(WorkerFailure { detail }))
            }
        }
    }
}
