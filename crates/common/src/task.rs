//! Cancellable tasks and the worker pool that runs them
//!
//! A [`Task`] wraps one unit of work together with a cancellation flag and a
//! completion signal. The [`TaskExecutor`] feeds tasks to a bounded pool of
//! OS threads over a `flume` channel. Workers are spawned on demand and
//! retire after sitting idle.
//!
//! Cancellation is cooperative: cancelling a pending task guarantees its body
//! never runs, while a running body has to poll [`Task::is_cancelled`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use flume::RecvTimeoutError;
use parking_lot::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Cancelled)
    }
}

type TaskBody = Box<dyn FnOnce(&Task) + Send + 'static>;

struct TaskInner {
    cancelled: AtomicBool,
    body: Mutex<Option<TaskBody>>,
    state: watch::Sender<TaskState>,
}

/// Handle to a scheduled unit of work
///
/// Clones share the same task. A task is terminal once it has run or been
/// cancelled and is never re-armed.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new<F>(body: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        let (state, _) = watch::channel(TaskState::Pending);
        Self {
            inner: Arc::new(TaskInner {
                cancelled: AtomicBool::new(false),
                body: Mutex::new(Some(Box::new(body))),
                state,
            }),
        }
    }

    /// A task that was cancelled before it could be scheduled
    pub fn cancelled<F>(body: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        let task = Self::new(body);
        task.cancel();
        task
    }

    /// Request cancellation
    ///
    /// Returns true if the task had not started yet, in which case its body
    /// is dropped without running. A running body only sees the flag.
    pub fn cancel(&self) -> bool {
        self.inner.cancelled.store(true, Ordering::SeqCst);

        let was_pending = self.inner.state.send_if_modified(|state| {
            if *state == TaskState::Pending {
                *state = TaskState::Cancelled;
                true
            } else {
                false
            }
        });

        if was_pending {
            let body = self.inner.body.lock().take();
            drop(body);
        }

        was_pending
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TaskState {
        *self.inner.state.borrow()
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    /// Wait for the task to reach a terminal state
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.inner.state.subscribe();
        let result = rx.wait_for(TaskState::is_terminal).await.map(|s| *s);
        match result {
            Ok(state) => state,
            // the sender lives as long as `self`, so this is unreachable
            Err(_) => self.state(),
        }
    }

    /// Block the current thread until the task is terminal
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait_blocking(&self) -> TaskState {
        futures::executor::block_on(self.wait())
    }

    pub(crate) fn run(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == TaskState::Pending {
                *state = TaskState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return;
        }

        let body = self.inner.body.lock().take();
        if let Some(body) = body {
            if panic::catch_unwind(AssertUnwindSafe(|| body(self))).is_err() {
                tracing::error!("task body panicked");
            }
        }

        self.inner.state.send_replace(TaskState::Completed);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Sizing of a [`TaskExecutor`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskExecutorConfig {
    /// How long a worker waits for work before retiring
    pub idle_time: Duration,
    pub max_workers: usize,
    /// Workers kept alive even when idle
    pub min_workers: usize,
}

impl Default for TaskExecutorConfig {
    fn default() -> Self {
        Self {
            idle_time: Duration::from_secs(16),
            max_workers: 16,
            min_workers: 0,
        }
    }
}

#[derive(Default)]
struct Workers {
    handles: Vec<(ThreadId, JoinHandle<()>)>,
    live: usize,
    idle: usize,
    spawned: usize,
}

struct ExecutorShared {
    config: TaskExecutorConfig,
    sender: Mutex<Option<flume::Sender<Task>>>,
    receiver: flume::Receiver<Task>,
    workers: Mutex<Workers>,
}

/// Bounded pool of worker threads
///
/// Dropping the executor shuts it down: queued tasks are cancelled and
/// running ones are waited for.
pub struct TaskExecutor {
    shared: Arc<ExecutorShared>,
}

impl TaskExecutor {
    pub fn new(config: TaskExecutorConfig) -> Self {
        let config = TaskExecutorConfig {
            max_workers: config.max_workers.max(1),
            min_workers: config.min_workers.min(config.max_workers.max(1)),
            ..config
        };
        let (sender, receiver) = flume::unbounded();
        let shared = Arc::new(ExecutorShared {
            config,
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Workers::default()),
        });

        {
            let mut workers = shared.workers.lock();
            for _ in 0..config.min_workers {
                spawn_worker(&shared, &mut workers);
            }
        }

        Self { shared }
    }

    pub fn config(&self) -> &TaskExecutorConfig {
        &self.shared.config
    }

    /// Queue `body` for execution and return its handle immediately
    ///
    /// After shutdown the returned task is already cancelled.
    pub fn execute<F>(&self, body: F) -> Task
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        let task = Task::new(body);

        let queued = {
            let sender = self.shared.sender.lock();
            match sender.as_ref() {
                Some(sender) => sender.send(task.clone()).is_ok(),
                None => false,
            }
        };

        if !queued {
            task.cancel();
            return task;
        }

        let mut workers = self.shared.workers.lock();
        if self.shared.receiver.len() > workers.idle && workers.live < self.shared.config.max_workers
        {
            spawn_worker(&self.shared, &mut workers);
        }

        task
    }

    /// Number of worker threads currently alive
    pub fn worker_count(&self) -> usize {
        self.shared.workers.lock().live
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.sender.lock().is_none()
    }

    /// Stop accepting work, cancel queued tasks and join the workers
    ///
    /// Safe to call repeatedly. When called from one of the executor's own
    /// workers, that worker is left to finish on its own.
    pub fn shutdown(&self) {
        let sender = self.shared.sender.lock().take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let mut cancelled = 0usize;
        for task in self.shared.receiver.drain() {
            if task.cancel() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled queued tasks on executor shutdown");
        }

        let handles = std::mem::take(&mut self.shared.workers.lock().handles);
        let current = thread::current().id();
        for (id, handle) in handles {
            if id == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!("task worker panicked during shutdown");
            }
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("config", &self.shared.config)
            .field("workers", &self.worker_count())
            .finish()
    }
}

fn spawn_worker(shared: &Arc<ExecutorShared>, workers: &mut Workers) {
    let worker_shared = shared.clone();
    let name = format!("task-worker-{}", workers.spawned);

    match thread::Builder::new()
        .name(name)
        .spawn(move || work(worker_shared))
    {
        Ok(handle) => {
            workers.spawned += 1;
            workers.live += 1;
            workers.handles.push((handle.thread().id(), handle));
        }
        Err(e) => tracing::error!("failed to spawn task worker: {}", e),
    }
}

fn work(shared: Arc<ExecutorShared>) {
    let mut workers = shared.workers.lock();
    loop {
        workers.idle += 1;
        drop(workers);
        let next = shared.receiver.recv_timeout(shared.config.idle_time);

        workers = shared.workers.lock();
        workers.idle -= 1;

        match next {
            Ok(task) => {
                drop(workers);
                task.run();
                workers = shared.workers.lock();
            }
            // `execute` queues before it takes this lock, so a task sent
            // after the timeout is either visible here or sees this worker gone
            Err(RecvTimeoutError::Timeout) => {
                if workers.live > shared.config.min_workers && shared.receiver.is_empty() {
                    retire(&mut workers);
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                retire(&mut workers);
                return;
            }
        }
    }
}

/// Drop the calling worker from the pool; its thread exits right after
fn retire(workers: &mut Workers) {
    let current = thread::current().id();
    workers.live -= 1;
    workers.handles.retain(|(id, _)| *id != current);
}
