//! Decode worker pool.
//!
//! Same queue discipline as the generic pool, with one addition: each worker
//! creates a dedicated CUDA context when its thread starts, makes it current
//! for the thread's lifetime, and destroys it on exit. Only tasks scheduled
//! on this pool may rely on having a current GPU context. When the host has
//! no GPU the workers run with no context and decode tasks receive `None`.

use crate::errors::{StreamError, StreamResult};
use crate::gpu::{CudaContextService, GpuWorkerContext};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

type DecodeJob = Box<dyn FnOnce(Option<GpuWorkerContext>) + Send + 'static>;

struct DecodeTask {
    camera_id: String,
    job: DecodeJob,
}

/// Decode pool configuration.
#[derive(Debug, Clone)]
pub struct DecodePoolConfig {
    pub num_threads: usize,
    pub cuda_device_id: i32,
}

impl Default for DecodePoolConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            cuda_device_id: 0,
        }
    }
}

/// Decode pool counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecodePoolStats {
    pub total_decodes: u64,
    pub tasks_in_queue: usize,
    pub per_worker_decode_count: Vec<u64>,
}

struct DecodeInner {
    queue: Mutex<VecDeque<DecodeTask>>,
    available: Condvar,
    running: AtomicBool,
    per_worker: Vec<AtomicU64>,
}

pub struct DecodePool {
    inner: Arc<DecodeInner>,
    workers: Vec<JoinHandle<()>>,
}

impl DecodePool {
    pub fn new(config: DecodePoolConfig, gpu: Arc<CudaContextService>) -> Self {
        let num_threads = config.num_threads.max(1);
        let inner = Arc::new(DecodeInner {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            running: AtomicBool::new(true),
            per_worker: (0..num_threads).map(|_| AtomicU64::new(0)).collect(),
        });

        let mut workers = Vec::with_capacity(num_threads);
        for worker_id in 0..num_threads {
            let inner = Arc::clone(&inner);
            let gpu = Arc::clone(&gpu);
            let handle = std::thread::Builder::new()
                .name(format!("decode-{}", worker_id))
                .spawn(move || decode_worker_loop(inner, gpu, worker_id))
                .expect("failed to spawn decode worker");
            workers.push(handle);
        }

        Self { inner, workers }
    }

    /// Enqueue a decode task; the worker passes in its GPU context handle.
    pub fn submit_decode_task<F>(&self, camera_id: &str, task: F) -> StreamResult<()>
    where
        F: FnOnce(Option<GpuWorkerContext>) + Send + 'static,
    {
        let mut queue = self.inner.queue.lock().expect("lock poisoned");
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(StreamError::PoolShutdown(
                "decode pool: cannot submit to a stopped pool".into(),
            ));
        }
        queue.push_back(DecodeTask {
            camera_id: camera_id.to_string(),
            job: Box::new(task),
        });
        drop(queue);
        self.inner.available.notify_one();
        Ok(())
    }

    /// Stop and join all workers; pending tasks are discarded when
    /// `wait_for_tasks` is false. Idempotent.
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
                log::error!("decode pool: worker panicked at join: {:?}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn thread_count(&self) -> usize {
        self.inner.per_worker.len()
    }

    pub fn stats(&self) -> DecodePoolStats {
        let tasks_in_queue = self.inner.queue.lock().expect("lock poisoned").len();
        let per_worker: Vec<u64> = self
            .inner
            .per_worker
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .collect();
        DecodePoolStats {
            total_decodes: per_worker.iter().sum(),
            tasks_in_queue,
            per_worker_decode_count: per_worker,
        }
    }
}

impl Drop for DecodePool {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}

fn decode_worker_loop(inner: Arc<DecodeInner>, gpu: Arc<CudaContextService>, worker_id: usize) {
    // Thread-confined GPU context for this worker's lifetime.
    let context = if gpu.is_available() {
        match gpu.create_worker_context() {
            Ok(context) => Some(context),
            Err(e) => {
                log::warn!("decode worker {}: no GPU context: {}", worker_id, e);
                None
            }
        }
    } else {
        None
    };

    loop {
        let task = {
            let mut queue = inner.queue.lock().expect("lock poisoned");
            loop {
                if let Some(task) = queue.pop_front() {
                    break task;
                }
                if !inner.running.load(Ordering::Acquire) {
                    if let Some(context) = context {
                        gpu.destroy_worker_context(context);
                    }
                    return;
                }
                queue = inner.available.wait(queue).expect("lock poisoned");
            }
        };

        let job = task.job;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            job(context);
        }));
        if let Err(panic) = result {
            log::error!(
                "decode worker {}: task for camera {} panicked: {:?}",
                worker_id,
                task.camera_id,
                panic
            );
        }
        inner.per_worker[worker_id].fetch_add(1, Ordering::Relaxed);
    }
}
