//! Network receive pool with round-robin camera assignment.
//!
//! The assignment map is informational: tasks are still pulled from the
//! shared queue by any free worker, but the coordinator uses the map to
//! spread receive loops evenly at submission time and operators can read
//! the load distribution back out.

use super::thread_pool::{PoolStats, ThreadPool, ThreadPoolConfig};
use crate::errors::StreamResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub struct NetworkPool {
    pool: ThreadPool,
    num_workers: usize,
    assignments: Mutex<HashMap<String, usize>>,
    next_worker: AtomicUsize,
}

impl NetworkPool {
    pub fn new(num_threads: usize, enable_affinity: bool) -> Self {
        let num_workers = num_threads.max(1);
        Self {
            pool: ThreadPool::new(ThreadPoolConfig {
                num_threads: num_workers,
                name: "net".to_string(),
                enable_affinity,
            }),
            num_workers,
            assignments: Mutex::new(HashMap::new()),
            next_worker: AtomicUsize::new(0),
        }
    }

    /// Assign a camera to a worker, round-robin. Idempotent: an existing
    /// assignment is returned unchanged.
    pub fn assign_camera(&self, camera_id: &str) -> usize {
        let mut assignments = self.assignments.lock().expect("lock poisoned");
        if let Some(&worker) = assignments.get(camera_id) {
            return worker;
        }
        let worker = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.num_workers;
        assignments.insert(camera_id.to_string(), worker);
        worker
    }

    pub fn unassign_camera(&self, camera_id: &str) {
        self.assignments
            .lock()
            .expect("lock poisoned")
            .remove(camera_id);
    }

    /// Worker currently mapped to a camera.
    pub fn worker_for(&self, camera_id: &str) -> Option<usize> {
        self.assignments
            .lock()
            .expect("lock poisoned")
            .get(camera_id)
            .copied()
    }

    /// Camera count per worker, for load inspection.
    pub fn cameras_per_worker(&self) -> HashMap<usize, usize> {
        let assignments = self.assignments.lock().expect("lock poisoned");
        let mut counts = HashMap::new();
        for &worker in assignments.values() {
            *counts.entry(worker).or_insert(0) += 1;
        }
        counts
    }

    pub fn submit<F>(&self, task: F) -> StreamResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.submit(task)
    }

    pub fn shutdown(&mut self, wait_for_tasks: bool) {
        self.pool.shutdown(wait_for_tasks);
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    pub fn thread_count(&self) -> usize {
        self.num_workers
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_assignment() {
        let pool = NetworkPool::new(3, false);
        assert_eq!(pool.assign_camera("a"), 0);
        assert_eq!(pool.assign_camera("b"), 1);
        assert_eq!(pool.assign_camera("c"), 2);
        assert_eq!(pool.assign_camera("d"), 0);
    }

    #[test]
    fn assignment_is_idempotent() {
        let pool = NetworkPool::new(4, false);
        let first = pool.assign_camera("cam");
        assert_eq!(pool.assign_camera("cam"), first);
        assert_eq!(pool.worker_for("cam"), Some(first));
    }

    #[test]
    fn unassign_removes_mapping() {
        let pool = NetworkPool::new(2, false);
        pool.assign_camera("cam");
        pool.unassign_camera("cam");
        assert_eq!(pool.worker_for("cam"), None);
    }

    #[test]
    fn per_worker_counts() {
        let pool = NetworkPool::new(2, false);
        pool.assign_camera("a");
        pool.assign_camera("b");
        pool.assign_camera("c");
        let counts = pool.cameras_per_worker();
        assert_eq!(counts[&0], 2);
        assert_eq!(counts[&1], 1);
    }
}
