//! Pipeline and per-camera configuration.
//!
//! These structs carry defaults suitable for 42+ concurrent 1080p streams on
//! a single GPU host. Loading them from files or CLI flags is the embedding
//! application's concern.

use crate::types::StreamQuality;
use serde::{Deserialize, Serialize};

/// Configuration for the whole pipeline (pools, queues, GPU budget).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Network receive worker threads.
    pub network_threads: usize,
    /// Decode worker threads; bounds concurrent hardware decoder driver
    /// state on the CPU side.
    pub decode_threads: usize,
    /// CUDA device ordinal used by the decode workers.
    pub cuda_device_id: i32,
    /// Per-camera packet queue capacity; rounded up to a power of two.
    pub packet_queue_capacity: usize,
    /// VRAM budget enforced by the memory accountant.
    pub max_gpu_memory_bytes: u64,
    /// Emit a warning when VRAM utilisation crosses 90%.
    pub enable_memory_warnings: bool,
    /// Pin network workers to CPUs (Linux only).
    pub enable_cpu_affinity: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            network_threads: 8,
            decode_threads: 4,
            cuda_device_id: 0,
            packet_queue_capacity: 60,
            max_gpu_memory_bytes: 3 * 1024 * 1024 * 1024,
            enable_memory_warnings: true,
            enable_cpu_affinity: false,
        }
    }
}

/// Configuration for one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Unique identifier within the coordinator.
    pub id: String,
    /// RTSP URL, without embedded credentials.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Initial quality level.
    pub quality: StreamQuality,
    /// Reconnect automatically on unrecoverable receive errors.
    pub auto_reconnect: bool,
    /// Packet queue capacity; rounded up to a power of two (60 -> 64,
    /// about two seconds at 30 fps).
    pub packet_queue_capacity: usize,
}

impl CameraConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            username: String::new(),
            password: String::new(),
            quality: StreamQuality::GridView,
            auto_reconnect: true,
            packet_queue_capacity: 60,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_quality(mut self, quality: StreamQuality) -> Self {
        self.quality = quality;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.network_threads, 8);
        assert_eq!(config.decode_threads, 4);
        assert_eq!(config.packet_queue_capacity, 60);
        assert_eq!(config.max_gpu_memory_bytes, 3 * 1024 * 1024 * 1024);
        assert!(config.enable_memory_warnings);
    }

    #[test]
    fn camera_config_builder() {
        let config = CameraConfig::new("cam-1", "rtsp://192.168.1.10/stream1")
            .with_credentials("admin", "secret")
            .with_quality(StreamQuality::Focused);
        assert_eq!(config.id, "cam-1");
        assert_eq!(config.username, "admin");
        assert_eq!(config.quality, StreamQuality::Focused);
        assert!(config.auto_reconnect);
    }
}
