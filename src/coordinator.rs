//! Pipeline coordinator: owns the worker pools, the GPU context service,
//! the memory accountant, and the camera registry; wires each camera into a
//! receive loop and a decode loop and publishes decoded frames through a
//! single process-wide callback.

use crate::config::{CameraConfig, PipelineConfig};
use crate::decode::Decoder;
use crate::errors::{StreamError, StreamResult};
use crate::gpu::{AccountantConfig, AccountantStats, CudaContextService, GpuMemoryAccountant};
use crate::pool::{DecodePool, DecodePoolConfig, DecodePoolStats, NetworkPool, PoolStats};
use crate::session::{CameraSession, SessionStats};
use crate::types::{DecodeStatus, DecodedFrame, Packet, StreamQuality, StreamState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Sink invoked on the decode worker for every decoded frame. The frame
/// reference is borrowed and must not be stashed; copy it before returning
/// if the pixels are needed later. Implementations must not block.
pub type FrameCallback = dyn Fn(&str, &DecodedFrame) + Send + Sync;

/// Aggregate statistics across every camera plus the pools and the VRAM
/// accountant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalStats {
    pub total_cameras: usize,
    pub active_cameras: usize,
    pub error_cameras: usize,
    pub reconnecting_cameras: usize,
    /// Average FPS across running cameras.
    pub avg_fps: f64,
    pub total_dropped_frames: u64,
    pub total_decoded_frames: u64,
    pub memory: AccountantStats,
    pub network_pool: PoolStats,
    pub decode_pool: DecodePoolStats,
}

/// The top-level pipeline object.
pub struct PipelineCoordinator {
    config: PipelineConfig,
    gpu: Arc<CudaContextService>,
    accountant: Arc<GpuMemoryAccountant>,
    network_pool: Option<NetworkPool>,
    decode_pool: Option<DecodePool>,
    cameras: Arc<RwLock<HashMap<String, Arc<CameraSession>>>>,
    callback: Arc<RwLock<Option<Arc<FrameCallback>>>>,
    running: Arc<AtomicBool>,
    initialized: AtomicBool,
}

impl PipelineCoordinator {
    pub fn new(config: PipelineConfig) -> Self {
        let gpu = Arc::new(CudaContextService::new(config.cuda_device_id));
        let accountant = Arc::new(GpuMemoryAccountant::new(AccountantConfig {
            max_gpu_memory_bytes: config.max_gpu_memory_bytes,
            enable_warnings: config.enable_memory_warnings,
        }));
        Self {
            gpu,
            accountant,
            network_pool: None,
            decode_pool: None,
            cameras: Arc::new(RwLock::new(HashMap::new())),
            callback: Arc::new(RwLock::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            initialized: AtomicBool::new(false),
            config,
        }
    }

    /// Start both worker pools. Idempotent.
    pub fn initialize(&mut self) -> StreamResult<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        self.network_pool = Some(NetworkPool::new(
            self.config.network_threads,
            self.config.enable_cpu_affinity,
        ));
        self.decode_pool = Some(DecodePool::new(
            DecodePoolConfig {
                num_threads: self.config.decode_threads,
                cuda_device_id: self.config.cuda_device_id,
            },
            Arc::clone(&self.gpu),
        ));

        self.running.store(true, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
        log::info!(
            "PipelineCoordinator: initialized ({} network workers, {} decode workers, \
             {} MB VRAM budget, hardware decode {})",
            self.config.network_threads,
            self.config.decode_threads,
            self.config.max_gpu_memory_bytes / (1024 * 1024),
            if self.gpu.is_available() { "available" } else { "unavailable" }
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> StreamResult<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(StreamError::NotInitialized(
                "coordinator not initialized".into(),
            ));
        }
        Ok(())
    }

    /// Construct and start a camera, register it, and submit its receive
    /// and decode loops.
    ///
    /// Start failures leave the camera registered in the Error state (so it
    /// shows up in the global stats) and are returned to the caller.
    pub fn add_camera(&self, camera_config: CameraConfig) -> StreamResult<()> {
        self.ensure_initialized()?;

        let id = camera_config.id.clone();
        {
            let cameras = self.cameras.read().expect("lock poisoned");
            if cameras.contains_key(&id) {
                return Err(StreamError::InvalidArgument(format!(
                    "camera {} already exists",
                    id
                )));
            }
        }

        let mut queue_config = camera_config;
        if queue_config.packet_queue_capacity == 0 {
            queue_config.packet_queue_capacity = self.config.packet_queue_capacity;
        }
        let session = Arc::new(CameraSession::new(queue_config));

        self.cameras
            .write()
            .expect("lock poisoned")
            .insert(id.clone(), Arc::clone(&session));

        let network_pool = self
            .network_pool
            .as_ref()
            .ok_or_else(|| StreamError::NotInitialized("network pool missing".into()))?;
        let worker = network_pool.assign_camera(&id);
        log::debug!("PipelineCoordinator: camera {} -> network worker {}", id, worker);

        session.start(&self.gpu, Some(Arc::clone(&self.accountant)))?;
        self.spawn_camera_loops(&session)?;
        log::info!("PipelineCoordinator: added camera {}", id);
        Ok(())
    }

    /// Stop a camera, unassign it from the network pool, and drop it from
    /// the registry.
    pub fn remove_camera(&self, id: &str) -> StreamResult<()> {
        let session = self
            .cameras
            .write()
            .expect("lock poisoned")
            .remove(id)
            .ok_or_else(|| {
                StreamError::InvalidArgument(format!("camera {} not found", id))
            })?;

        session.stop();
        if let Some(pool) = self.network_pool.as_ref() {
            pool.unassign_camera(id);
        }
        self.accountant.unregister(id);
        log::info!("PipelineCoordinator: removed camera {}", id);
        Ok(())
    }

    pub fn set_quality(&self, id: &str, quality: StreamQuality) -> StreamResult<()> {
        let session = self.camera(id)?;
        session.set_quality(quality);
        Ok(())
    }

    pub fn set_all_quality(&self, quality: StreamQuality) {
        for session in self.sessions() {
            session.set_quality(quality);
        }
    }

    /// Start every stopped camera and resubmit its loops.
    pub fn start_all(&self) {
        for session in self.sessions() {
            if session.state() == StreamState::Stopped {
                match session.start(&self.gpu, Some(Arc::clone(&self.accountant))) {
                    Ok(()) => {
                        if let Err(e) = self.spawn_camera_loops(&session) {
                            log::error!(
                                "PipelineCoordinator: loops for {} not started: {}",
                                session.config().id,
                                e
                            );
                        }
                    }
                    Err(e) => {
                        log::error!(
                            "PipelineCoordinator: start_all failed for {}: {}",
                            session.config().id,
                            e
                        );
                    }
                }
            }
        }
    }

    pub fn stop_all(&self) {
        for session in self.sessions() {
            session.stop();
        }
    }

    /// Reconnect every camera currently in the Error state.
    pub fn reconnect_all(&self) {
        for session in self.sessions() {
            if session.state() == StreamState::Error {
                match session.reconnect(&self.gpu, Some(Arc::clone(&self.accountant))) {
                    Ok(()) => {
                        if let Err(e) = self.spawn_camera_loops(&session) {
                            log::error!(
                                "PipelineCoordinator: loops for {} not restarted: {}",
                                session.config().id,
                                e
                            );
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "PipelineCoordinator: reconnect_all failed for {}: {}",
                            session.config().id,
                            e
                        );
                    }
                }
            }
        }
    }

    /// Install the process-wide frame callback. The callback runs on decode
    /// workers; no coordinator lock is held across its invocation.
    pub fn set_frame_callback<F>(&self, callback: F)
    where
        F: Fn(&str, &DecodedFrame) + Send + Sync + 'static,
    {
        *self.callback.write().expect("lock poisoned") = Some(Arc::new(callback));
    }

    pub fn camera_stats(&self, id: &str) -> StreamResult<SessionStats> {
        Ok(self.camera(id)?.stats())
    }

    pub fn camera_state(&self, id: &str) -> StreamResult<StreamState> {
        Ok(self.camera(id)?.state())
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.cameras
            .read()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn camera_count(&self) -> usize {
        self.cameras.read().expect("lock poisoned").len()
    }

    pub fn global_stats(&self) -> GlobalStats {
        let mut stats = GlobalStats::default();
        let mut fps_sum = 0.0;

        for session in self.sessions() {
            stats.total_cameras += 1;
            let session_stats = session.stats();
            match session.state() {
                StreamState::Running => {
                    stats.active_cameras += 1;
                    fps_sum += f64::from(session_stats.current_fps);
                }
                StreamState::Error => stats.error_cameras += 1,
                StreamState::Reconnecting => stats.reconnecting_cameras += 1,
                _ => {}
            }
            stats.total_dropped_frames += session_stats.dropped_frames;
            stats.total_decoded_frames += session_stats.decoded_frames;
        }

        if stats.active_cameras > 0 {
            stats.avg_fps = fps_sum / stats.active_cameras as f64;
        }
        stats.memory = self.accountant.stats();
        if let Some(pool) = self.network_pool.as_ref() {
            stats.network_pool = pool.stats();
        }
        if let Some(pool) = self.decode_pool.as_ref() {
            stats.decode_pool = pool.stats();
        }
        stats
    }

    pub fn accountant(&self) -> &Arc<GpuMemoryAccountant> {
        &self.accountant
    }

    pub fn gpu(&self) -> &Arc<CudaContextService> {
        &self.gpu
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Stop all cameras, drain both pools, and release the registry.
    pub fn shutdown(&mut self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        log::info!("PipelineCoordinator: shutting down");

        self.running.store(false, Ordering::Release);
        self.stop_all();

        if let Some(mut pool) = self.network_pool.take() {
            pool.shutdown(true);
        }
        if let Some(mut pool) = self.decode_pool.take() {
            pool.shutdown(true);
        }
        self.cameras.write().expect("lock poisoned").clear();
        log::info!("PipelineCoordinator: shutdown complete");
    }

    fn camera(&self, id: &str) -> StreamResult<Arc<CameraSession>> {
        self.cameras
            .read()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| StreamError::InvalidArgument(format!("camera {} not found", id)))
    }

    fn sessions(&self) -> Vec<Arc<CameraSession>> {
        self.cameras
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Submit the per-camera receive and decode loop tasks.
    fn spawn_camera_loops(&self, session: &Arc<CameraSession>) -> StreamResult<()> {
        let network_pool = self
            .network_pool
            .as_ref()
            .ok_or_else(|| StreamError::NotInitialized("network pool missing".into()))?;
        let decode_pool = self
            .decode_pool
            .as_ref()
            .ok_or_else(|| StreamError::NotInitialized("decode pool missing".into()))?;

        {
            let session = Arc::clone(session);
            let running = Arc::clone(&self.running);
            let gpu = Arc::clone(&self.gpu);
            let accountant = Arc::clone(&self.accountant);
            network_pool.submit(move || receive_loop(session, running, gpu, accountant))?;
        }
        {
            let session = Arc::clone(session);
            let running = Arc::clone(&self.running);
            let callback = Arc::clone(&self.callback);
            decode_pool
                .submit_decode_task(&session.config().id.clone(), move |_gpu_context| {
                    decode_loop(session, running, callback)
                })?;
        }
        Ok(())
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Per-camera network receive loop, run on a network worker.
///
/// Pulls NAL units from the RTSP session and feeds the camera's bounded
/// queue with drop-oldest backpressure. On unrecoverable receive errors the
/// loop drives the session's reconnect in place (so the task keeps
/// servicing the camera after recovery) or parks the camera in Error.
fn receive_loop(
    session: Arc<CameraSession>,
    running: Arc<AtomicBool>,
    gpu: Arc<CudaContextService>,
    accountant: Arc<GpuMemoryAccountant>,
) {
    let camera_id = session.config().id.clone();
    let mut nal_units = Vec::new();

    while running.load(Ordering::Acquire) {
        match session.state() {
            StreamState::Stopped | StreamState::Error => break,
            StreamState::Connecting | StreamState::Reconnecting => {
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
            StreamState::Running => {}
        }

        let result = {
            let mut guard = session.rtsp_client().lock().expect("lock poisoned");
            match guard.as_mut() {
                Some(client) => client.receive_nal_units(&mut nal_units),
                None => break,
            }
        };

        match result {
            Ok(0) => continue, // timeout
            Ok(_) => {
                for unit in nal_units.drain(..) {
                    let queue = session.packet_queue();
                    let was_full = queue.is_full();
                    queue.push_or_drop_oldest(Packet {
                        data: unit.data,
                        pts: unit.pts,
                        keyframe: unit.keyframe,
                    });
                    if was_full {
                        session.record_dropped_packet();
                    }
                }
            }
            Err(e) => {
                log::warn!("receive loop[{}]: {}", camera_id, e);
                if session.config().auto_reconnect && running.load(Ordering::Acquire) {
                    if session.recover_from_receive_error(&gpu, Some(Arc::clone(&accountant))) {
                        continue;
                    }
                    break;
                } else {
                    session.update_state(StreamState::Error);
                    break;
                }
            }
        }
    }

    log::debug!("receive loop[{}]: exited", camera_id);
}

/// Per-camera decode loop, run on a decode worker with a current GPU
/// context.
fn decode_loop(
    session: Arc<CameraSession>,
    running: Arc<AtomicBool>,
    callback: Arc<RwLock<Option<Arc<FrameCallback>>>>,
) {
    let camera_id = session.config().id.clone();

    while running.load(Ordering::Acquire) {
        match session.state() {
            StreamState::Stopped | StreamState::Error => break,
            StreamState::Connecting | StreamState::Reconnecting => {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            StreamState::Running => {}
        }

        let Some(packet) = session.packet_queue().pop() else {
            // Cooperative yield, not a blocking wait: trades a little CPU
            // for latency.
            std::thread::sleep(Duration::from_millis(1));
            continue;
        };

        let mut guard = session.decoder().lock().expect("lock poisoned");
        let Some(decoder) = guard.as_mut() else {
            continue;
        };

        match decoder.decode(&packet.data, packet.pts) {
            DecodeStatus::Success => {
                if let Some(frame) = decoder.get_frame() {
                    session.record_decoded_frame(frame.pts);
                    // Snapshot the callback Arc so no coordinator lock is
                    // held while user code runs.
                    let sink = callback.read().expect("lock poisoned").clone();
                    if let Some(sink) = sink {
                        (*sink)(&camera_id, frame);
                    }
                }
            }
            DecodeStatus::NeedMoreData => {}
            DecodeStatus::InvalidData => {
                // A single bad packet must not tear the camera down.
                log::debug!("decode loop[{}]: invalid packet skipped", camera_id);
            }
            status @ (DecodeStatus::DecoderFailure | DecodeStatus::OutOfMemory) => {
                log::error!("decode loop[{}]: fatal decode status {:?}", camera_id, status);
                drop(guard);
                session.update_state(StreamState::Error);
                break;
            }
        }
    }

    log::debug!("decode loop[{}]: exited", camera_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_initialization() {
        let coordinator = PipelineCoordinator::new(PipelineConfig::default());
        let result = coordinator.add_camera(CameraConfig::new("cam", "rtsp://203.0.113.1/s"));
        assert!(matches!(result, Err(StreamError::NotInitialized(_))));
    }

    #[test]
    fn initialize_and_shutdown() {
        let mut coordinator = PipelineCoordinator::new(PipelineConfig {
            network_threads: 2,
            decode_threads: 1,
            ..PipelineConfig::default()
        });
        coordinator.initialize().unwrap();
        assert!(coordinator.is_initialized());
        // Idempotent.
        coordinator.initialize().unwrap();

        let stats = coordinator.global_stats();
        assert_eq!(stats.total_cameras, 0);
        assert_eq!(stats.network_pool.per_worker_completed.len(), 2);

        coordinator.shutdown();
        assert!(!coordinator.is_initialized());
        // Idempotent.
        coordinator.shutdown();
    }

    #[test]
    fn unknown_camera_lookups_fail() {
        let mut coordinator = PipelineCoordinator::new(PipelineConfig::default());
        coordinator.initialize().unwrap();
        assert!(coordinator.camera_stats("ghost").is_err());
        assert!(coordinator.remove_camera("ghost").is_err());
        assert!(coordinator
            .set_quality("ghost", StreamQuality::Focused)
            .is_err());
        coordinator.shutdown();
    }
}
