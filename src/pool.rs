use crate::error::{Error, Result};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::error;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers spawned at construction.
    pub core_threads: usize,
    /// Declared ceiling for dynamic growth; growth itself is not part of
    /// the minimum implementation.
    pub max_threads: usize,
    /// Queue capacity; submissions beyond it fail with `PoolQueueFull`.
    pub max_tasks: usize,
    /// Declared idle reaping horizon; reaping is not part of the minimum
    /// implementation.
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_threads: 4,
            max_threads: 16,
            max_tasks: 1000,
            keep_alive: Duration::from_secs(60),
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    shutdown: AtomicBool,
    alive: AtomicUsize,
}

/// Handle to a submitted task's eventual result.
///
/// [`wait`] blocks until the worker finishes the task. A panicking task
/// resolves to [`Error::TaskPanicked`] instead of poisoning the pool.
///
/// [`wait`]: TaskHandle::wait
pub struct TaskHandle<T> {
    rx: Receiver<std::result::Result<T, String>>,
}

impl<T> TaskHandle<T> {
    pub fn wait(self) -> Result<T> {
        match self.rx.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(Error::TaskPanicked(panic)),
            Err(_) => Err(Error::TaskPanicked("worker dropped task".into())),
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Some(Ok(value)),
            Ok(Err(panic)) => Some(Err(Error::TaskPanicked(panic))),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Some(Err(Error::TaskPanicked("worker dropped task".into())))
            }
        }
    }

    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(Ok(value)) => Some(Ok(value)),
            Ok(Err(panic)) => Some(Err(Error::TaskPanicked(panic))),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => {
                Some(Err(Error::TaskPanicked("worker dropped task".into())))
            }
        }
    }
}

/// Fixed-size worker pool over a bounded FIFO task queue.
///
/// Application handlers run here so they may block freely without stalling
/// the reactor; results travel back to the loop via `queue_in_loop`.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    config: PoolConfig,
}

impl ThreadPool {
    pub fn new(config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            alive: AtomicUsize::new(0),
        });

        let mut workers = Vec::with_capacity(config.core_threads);
        for i in 0..config.core_threads {
            let inner = inner.clone();
            let handle = thread::Builder::new()
                .name(format!("tarn-worker-{i}"))
                .spawn(move || worker_loop(&inner))
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }

        Self {
            inner,
            workers: Mutex::new(workers),
            config,
        }
    }

    /// Wraps `task` so the caller receives a [`TaskHandle`] resolvable once
    /// a worker executes it. Fails once shutdown began or when the queue is
    /// at capacity.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }

        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(task));
            let _ = tx.send(result.map_err(|payload| panic_message(&payload)));
        });

        {
            let mut queue = self.inner.queue.lock().unwrap();
            if self.inner.shutdown.load(Ordering::Acquire) {
                return Err(Error::PoolShutdown);
            }
            if queue.len() >= self.config.max_tasks {
                return Err(Error::PoolQueueFull);
            }
            queue.push_back(job);
        }
        self.inner.available.notify_one();

        Ok(TaskHandle { rx })
    }

    /// Stops accepting work and wakes every worker. Workers drain the queue
    /// before exiting; with `wait` set the call joins them. Idempotent.
    pub fn shutdown(&self, wait: bool) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            if wait {
                self.join_workers();
            }
            return;
        }
        self.inner.available.notify_all();
        if wait {
            self.join_workers();
        }
    }

    pub fn pending_task_count(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn active_thread_count(&self) -> usize {
        self.inner.alive.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn join_workers(&self) {
        let drained: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in drained {
            if handle.join().is_err() {
                error!("pool worker panicked");
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn worker_loop(inner: &PoolInner) {
    inner.alive.fetch_add(1, Ordering::AcqRel);

    loop {
        let job = {
            let mut queue = inner.queue.lock().unwrap();
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    inner.alive.fetch_sub(1, Ordering::AcqRel);
                    return;
                }
                queue = inner.available.wait(queue).unwrap();
            }
        };
        job();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}
