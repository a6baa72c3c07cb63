//! Generic fixed-size thread pool with a shared FIFO task queue.
//!
//! Workers block on a condition variable until work arrives or the pool
//! shuts down. Task panics are caught and logged so one failing task cannot
//! poison a worker. Long-running tasks (the per-camera loops) are expected
//! to poll their own cancellation flags; shutdown cannot preempt them.

use crate::errors::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct ThreadPoolConfig {
    pub num_threads: usize,
    /// Prefix for worker thread names.
    pub name: String,
    /// Pin each worker to a CPU (Linux only; ignored elsewhere).
    pub enable_affinity: bool,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            name: "worker".to_string(),
            enable_affinity: false,
        }
    }
}

/// Pool counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    pub tasks_submitted: u64,
    pub tasks_completed: u64,
    pub tasks_in_queue: usize,
    pub per_worker_completed: Vec<u64>,
}

struct PoolInner {
    queue: Mutex<VecDeque<Job>>,
    available: Condvar,
    running: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    per_worker: Vec<AtomicU64>,
}

/// Fixed-size task pool.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    workers: Vec<JoinHandle<()>>,
    config: ThreadPoolConfig,
}

impl ThreadPool {
    pub fn new(config: ThreadPoolConfig) -> Self {
        let num_threads = config.num_threads.max(1);
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            running: AtomicBool::new(true),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            per_worker: (0..num_threads).map(|_| AtomicU64::new(0)).collect(),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for worker_id in 0..num_threads {
            let inner = Arc::clone(&inner);
            let affinity = config.enable_affinity;
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", config.name, worker_id))
                .spawn(move || {
                    if affinity {
                        set_cpu_affinity(worker_id);
                    }
                    worker_loop(inner, worker_id);
                })
                .expect("failed to spawn pool worker");
            workers.push(handle);
        }

        Self {
            inner,
            workers,
            config,
        }
    }

    /// Enqueue a task. Fails once the pool has shut down.
    pub fn submit<F>(&self, task: F) -> StreamResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = self.inner.queue.lock().expect("lock poisoned");
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(StreamError::PoolShutdown(format!(
                "{}: cannot submit to a stopped pool",
                self.config.name
            )));
        }
        queue.push_back(Box::new(task));
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        drop(queue);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Stop accepting tasks and join every worker. With `wait_for_tasks`
    /// false, pending (not yet started) tasks are discarded. Idempotent.
    pub fn shutdown(&mut self, wait_for_tasks: bool) {
        {
            let mut queue = self.inner.queue.lock().expect("lock poisoned");
            self.inner.running.store(false, Ordering::Release);
            if !wait_for_tasks {
                queue.clear();
            }
        }
        self.inner.available.notify_all();

        for handle in self.workers.drain(..) {
            if let Err(e) = handle.join() {
                log::error!("{}: worker panicked at join: {:?}", self.config.name, e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.inner.per_worker.len()
    }

    pub fn stats(&self) -> PoolStats {
        let tasks_in_queue = self.inner.queue.lock().expect("lock poisoned").len();
        PoolStats {
            tasks_submitted: self.inner.submitted.load(Ordering::Relaxed),
            tasks_completed: self.inner.completed.load(Ordering::Relaxed),
            tasks_in_queue,
            per_worker_completed: self
                .inner
                .per_worker
                .iter()
                .map(|counter| counter.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn worker_loop(inner: Arc<PoolInner>, worker_id: usize) {
    loop {
        let job = {
            let mut queue = inner.queue.lock().expect("lock poisoned");
            loop {
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                if !inner.running.load(Ordering::Acquire) {
                    return;
                }
                queue = inner
                    .available
                    .wait(queue)
                    .expect("lock poisoned");
            }
        };

        // One panicking task must not take the worker down with it.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
        if let Err(panic) = result {
            log::error!("pool worker {} task panicked: {:?}", worker_id, panic);
        }
        inner.per_worker[worker_id].fetch_add(1, Ordering::Relaxed);
        inner.completed.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(worker_id: usize) {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let cpu = worker_id % cpus;
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            log::debug!("worker {}: sched_setaffinity failed", worker_id);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_worker_id: usize) {
    log::debug!("CPU affinity not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn executes_submitted_tasks() {
        let mut pool = ThreadPool::new(ThreadPoolConfig {
            num_threads: 2,
            name: "test".to_string(),
            enable_affinity: false,
        });
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown(true);
        assert_eq!(counter.load(Ordering::SeqCst), 16);

        let stats = pool.stats();
        assert_eq!(stats.tasks_submitted, 16);
        assert_eq!(stats.tasks_completed, 16);
        assert_eq!(stats.per_worker_completed.iter().sum::<u64>(), 16);
    }

    #[test]
    fn submit_after_shutdown_fails() {
        let mut pool = ThreadPool::new(ThreadPoolConfig::default());
        pool.shutdown(true);
        assert!(matches!(
            pool.submit(|| {}),
            Err(StreamError::PoolShutdown(_))
        ));
    }

    #[test]
    fn task_panic_does_not_kill_worker() {
        let mut pool = ThreadPool::new(ThreadPoolConfig {
            num_threads: 1,
            name: "panic-test".to_string(),
            enable_affinity: false,
        });
        let counter = Arc::new(AtomicUsize::new(0));
        pool.submit(|| panic!("task boom")).unwrap();
        let c = Arc::clone(&counter);
        pool.submit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.shutdown(true);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shutdown_without_waiting_discards_pending() {
        let mut pool = ThreadPool::new(ThreadPoolConfig {
            num_threads: 1,
            name: "discard-test".to_string(),
            enable_affinity: false,
        });
        let counter = Arc::new(AtomicUsize::new(0));
        // First task occupies the only worker long enough for the rest to
        // still be queued at shutdown.
        pool.submit(|| std::thread::sleep(Duration::from_millis(100)))
            .unwrap();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown(false);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
