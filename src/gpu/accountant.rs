//! Centralized VRAM accounting.
//!
//! Hardware decoders own their surface pools (a CUVID requirement), so this
//! accountant does not allocate anything; it tallies what each camera's
//! decoder has allocated, tracks the running total and peak, and warns when
//! utilisation crosses 90% of the configured budget.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Accountant configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountantConfig {
    /// VRAM budget in bytes.
    pub max_gpu_memory_bytes: u64,
    pub enable_warnings: bool,
}

impl Default for AccountantConfig {
    fn default() -> Self {
        Self {
            max_gpu_memory_bytes: 3 * 1024 * 1024 * 1024,
            enable_warnings: true,
        }
    }
}

/// Snapshot of the accountant's tallies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountantStats {
    pub total_allocated_bytes: u64,
    pub peak_allocated_bytes: u64,
    pub total_surface_count: usize,
    pub per_camera_bytes: HashMap<String, u64>,
    pub per_camera_surfaces: HashMap<String, usize>,
    pub utilization_percent: f64,
}

/// Thread-safe VRAM tally table.
pub struct GpuMemoryAccountant {
    config: AccountantConfig,
    // The maps and the totals move together under one lock; the atomics
    // exist so `would_exceed_limit`/`available` stay wait-free.
    entries: Mutex<HashMap<String, Entry>>,
    total_bytes: AtomicU64,
    peak_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    bytes: u64,
    surfaces: usize,
}

impl GpuMemoryAccountant {
    pub fn new(config: AccountantConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            peak_bytes: AtomicU64::new(0),
        }
    }

    /// Record a camera's allocation, replacing any previous record.
    pub fn register(&self, camera_id: &str, bytes: u64, surfaces: usize) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        let previous = entries
            .insert(camera_id.to_string(), Entry { bytes, surfaces })
            .map(|e| e.bytes)
            .unwrap_or(0);

        let old_total = self.total_bytes.load(Ordering::Relaxed);
        let new_total = old_total.saturating_sub(previous).saturating_add(bytes);
        self.total_bytes.store(new_total, Ordering::Relaxed);
        self.update_peak(new_total);
        drop(entries);

        self.check_limits(new_total);
    }

    /// Remove a camera's allocation record, guarding against underflow.
    pub fn unregister(&self, camera_id: &str) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        if let Some(entry) = entries.remove(camera_id) {
            let old_total = self.total_bytes.load(Ordering::Relaxed);
            self.total_bytes
                .store(old_total.saturating_sub(entry.bytes), Ordering::Relaxed);
        }
    }

    /// Delta-adjust a camera's allocation, e.g. after a quality change.
    /// Unknown cameras are treated as fresh registrations.
    pub fn update(&self, camera_id: &str, new_bytes: u64, new_surfaces: usize) {
        self.register(camera_id, new_bytes, new_surfaces);
    }

    pub fn stats(&self) -> AccountantStats {
        let entries = self.entries.lock().expect("lock poisoned");

        let total = self.total_bytes.load(Ordering::Relaxed);
        let entry_sum: u64 = entries.values().map(|e| e.bytes).sum();
        debug_assert_eq!(total, entry_sum, "accountant total drifted from per-camera sum");

        let mut stats = AccountantStats {
            total_allocated_bytes: total,
            peak_allocated_bytes: self.peak_bytes.load(Ordering::Relaxed),
            ..AccountantStats::default()
        };

        for (id, entry) in entries.iter() {
            stats.total_surface_count += entry.surfaces;
            stats.per_camera_bytes.insert(id.clone(), entry.bytes);
            stats.per_camera_surfaces.insert(id.clone(), entry.surfaces);
        }

        if self.config.max_gpu_memory_bytes > 0 {
            stats.utilization_percent =
                (total as f64 / self.config.max_gpu_memory_bytes as f64) * 100.0;
        }

        stats
    }

    /// Whether adding `additional` bytes would exceed the budget.
    pub fn would_exceed_limit(&self, additional: u64) -> bool {
        let current = self.total_bytes.load(Ordering::Relaxed);
        current.saturating_add(additional) > self.config.max_gpu_memory_bytes
    }

    /// Remaining budget in bytes.
    pub fn available(&self) -> u64 {
        let current = self.total_bytes.load(Ordering::Relaxed);
        self.config.max_gpu_memory_bytes.saturating_sub(current)
    }

    fn update_peak(&self, total: u64) {
        let mut peak = self.peak_bytes.load(Ordering::Relaxed);
        while total > peak {
            match self.peak_bytes.compare_exchange_weak(
                peak,
                total,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    fn check_limits(&self, total: u64) {
        if !self.config.enable_warnings || self.config.max_gpu_memory_bytes == 0 {
            return;
        }
        let utilization = (total as f64 / self.config.max_gpu_memory_bytes as f64) * 100.0;
        if utilization > 90.0 {
            log::warn!(
                "GPU memory usage at {:.1}% ({} MB / {} MB)",
                utilization,
                total / (1024 * 1024),
                self.config.max_gpu_memory_bytes / (1024 * 1024)
            );
        }
    }
}
