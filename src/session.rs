//! Per-camera session: one RTSP client, one decoder, one packet queue, and
//! the lifecycle state machine tying them together.
//!
//! State transitions:
//! Stopped -> Connecting -> Running on start; Connecting/Running -> Error on
//! failure; Error -> Reconnecting when auto-reconnect is on; Reconnecting ->
//! Running or Error; any state -> Stopped on stop.

use crate::config::CameraConfig;
use crate::decode::{Decoder, DecoderFactory};
use crate::errors::{StreamError, StreamResult};
use crate::gpu::{CudaContextService, GpuMemoryAccountant};
use crate::queue::BoundedQueue;
use crate::rtsp::{NetworkStats, RtspClient, RtspConfig};
use crate::types::{Codec, DecoderConfig, Packet, StreamQuality, StreamState};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Delay between a session-level teardown and the restart attempt.
const RECONNECT_PAUSE: Duration = Duration::from_millis(500);

/// Statistics snapshot for one camera.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub current_fps: u32,
    pub decoded_frames: u64,
    pub dropped_frames: u64,
    pub packets_in_queue: usize,
    pub bytes_received: u64,
    /// PTS of the most recent decoded frame, in microseconds.
    pub last_frame_pts: i64,
    pub network: Option<NetworkStats>,
}

struct StatsInner {
    current_fps: u32,
    decoded_frames: u64,
    dropped_frames: u64,
    last_frame_pts: i64,
    frames_since_update: u32,
    last_fps_update: Instant,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            current_fps: 0,
            decoded_frames: 0,
            dropped_frames: 0,
            last_frame_pts: 0,
            frames_since_update: 0,
            last_fps_update: Instant::now(),
        }
    }
}

/// One camera's state: config, RTSP client, decoder, packet queue.
pub struct CameraSession {
    config: CameraConfig,
    quality: AtomicU8,
    state: AtomicU8,
    /// Cooperative flag observed by the receive and decode loops.
    running: AtomicBool,
    rtsp: Mutex<Option<RtspClient>>,
    decoder: Mutex<Option<Box<dyn Decoder>>>,
    queue: BoundedQueue<Packet>,
    stats: Mutex<StatsInner>,
}

impl CameraSession {
    pub fn new(config: CameraConfig) -> Self {
        let queue = BoundedQueue::with_capacity(config.packet_queue_capacity);
        Self {
            quality: AtomicU8::new(config.quality as u8),
            state: AtomicU8::new(StreamState::Stopped as u8),
            running: AtomicBool::new(false),
            rtsp: Mutex::new(None),
            decoder: Mutex::new(None),
            queue,
            stats: Mutex::new(StatsInner::new()),
            config,
        }
    }

    /// Connect RTSP and build a decoder. On success the session is Running;
    /// any failure leaves it in Error with resources released.
    pub fn start(
        &self,
        gpu: &CudaContextService,
        accountant: Option<Arc<GpuMemoryAccountant>>,
    ) -> StreamResult<()> {
        if self.state() == StreamState::Running {
            return Ok(());
        }
        self.update_state(StreamState::Connecting);

        let mut client = RtspClient::new(RtspConfig {
            url: self.config.url.clone(),
            username: self.config.username.clone(),
            password: self.config.password.clone(),
            auto_reconnect: self.config.auto_reconnect,
            ..RtspConfig::default()
        });

        if let Err(e) = client.connect() {
            log::error!("CameraSession[{}]: RTSP connect failed: {}", self.config.id, e);
            self.update_state(StreamState::Error);
            return Err(e);
        }

        let info = client.stream_info();
        let quality = self.quality();
        let decoder_config = DecoderConfig {
            // H.264 assumed until the bitstream proves otherwise; the vast
            // majority of IP cameras negotiate AVC on the main profile.
            codec: match info.map(|i| i.codec) {
                Some(Codec::H265) => Codec::H265,
                _ => Codec::H264,
            },
            quality,
            max_width: info.map(|i| i.width).filter(|&w| w > 0).unwrap_or(1920),
            max_height: info.map(|i| i.height).filter(|&h| h > 0).unwrap_or(1080),
            prefer_hardware: true,
            is_sub_stream: quality.is_sub_stream(),
        };

        let decoder = match DecoderFactory::create(&decoder_config, gpu, accountant, &self.config.id)
        {
            Some(decoder) => decoder,
            None => {
                client.disconnect();
                self.update_state(StreamState::Error);
                return Err(StreamError::DecoderInit(format!(
                    "no decoder available for camera {}",
                    self.config.id
                )));
            }
        };

        *self.rtsp.lock().expect("lock poisoned") = Some(client);
        *self.decoder.lock().expect("lock poisoned") = Some(decoder);
        self.running.store(true, Ordering::Release);
        self.update_state(StreamState::Running);
        Ok(())
    }

    /// Stop the session: Stopped state, RTSP torn down, decoder dropped,
    /// queue drained, statistics reset. Idempotent; blocks at most one RTSP
    /// timeout waiting for the receive loop to release the client.
    pub fn stop(&self) {
        if self.state() == StreamState::Stopped {
            return;
        }
        self.update_state(StreamState::Stopped);
        self.teardown();
    }

    fn teardown(&self) {
        self.running.store(false, Ordering::Release);

        if let Some(mut client) = self.rtsp.lock().expect("lock poisoned").take() {
            client.disconnect();
        }
        self.decoder.lock().expect("lock poisoned").take();
        self.queue.drain();

        *self.stats.lock().expect("lock poisoned") = StatsInner::new();
    }

    /// Tear down and start again after a short pause. No-op when a
    /// reconnect is already underway.
    pub fn reconnect(
        &self,
        gpu: &CudaContextService,
        accountant: Option<Arc<GpuMemoryAccountant>>,
    ) -> StreamResult<()> {
        if self.state() == StreamState::Reconnecting {
            return Ok(());
        }
        log::info!("CameraSession[{}]: reconnecting", self.config.id);
        self.update_state(StreamState::Reconnecting);
        self.restart(gpu, accountant)
    }

    fn restart(
        &self,
        gpu: &CudaContextService,
        accountant: Option<Arc<GpuMemoryAccountant>>,
    ) -> StreamResult<()> {
        self.teardown();
        std::thread::sleep(RECONNECT_PAUSE);
        // A concurrent stop() wins: it moved the state off Reconnecting.
        if self.state() != StreamState::Reconnecting {
            return Err(StreamError::InvalidArgument(
                "restart aborted: session stopped".into(),
            ));
        }
        self.start(gpu, accountant)
    }

    /// Recover from an unrecoverable receive error, called by the network
    /// receive loop. Tries a transport-level RTSP reconnect first (keeping
    /// the decoder, its surfaces, and the statistics intact), and falls back
    /// to a full teardown/restart. Returns true when the camera is Running
    /// again.
    pub(crate) fn recover_from_receive_error(
        &self,
        gpu: &CudaContextService,
        accountant: Option<Arc<GpuMemoryAccountant>>,
    ) -> bool {
        if !self.try_transition(StreamState::Running, StreamState::Reconnecting) {
            return false;
        }

        let transport = {
            let mut guard = self.rtsp.lock().expect("lock poisoned");
            match guard.as_mut() {
                Some(client) => client.reconnect(&self.running),
                None => Err(StreamError::NotInitialized("no RTSP client".into())),
            }
        };

        match transport {
            Ok(()) => self.try_transition(StreamState::Reconnecting, StreamState::Running),
            Err(e) => {
                log::warn!(
                    "CameraSession[{}]: transport reconnect failed ({}), restarting session",
                    self.config.id,
                    e
                );
                match self.restart(gpu, accountant) {
                    Ok(()) => true,
                    Err(restart_err) => {
                        log::error!(
                            "CameraSession[{}]: restart failed: {}",
                            self.config.id,
                            restart_err
                        );
                        false
                    }
                }
            }
        }
    }

    /// Compare-and-swap state transition; logs and returns true on success.
    pub(crate) fn try_transition(&self, from: StreamState, to: StreamState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            log::info!(
                "Camera {} state: {} -> {}",
                self.config.id,
                from.as_str(),
                to.as_str()
            );
        }
        swapped
    }

    /// Store the new level and forward the surface-pool resize to the
    /// decoder.
    ///
    /// Does not re-negotiate the RTSP session when the new level implies
    /// the other stream profile (main vs sub); the stream keeps its current
    /// resolution until the camera is restarted. Idempotent.
    pub fn set_quality(&self, quality: StreamQuality) {
        let previous = StreamQuality::from_u8(self.quality.swap(quality as u8, Ordering::Relaxed));
        if previous == quality {
            return;
        }
        if let Some(decoder) = self.decoder.lock().expect("lock poisoned").as_mut() {
            decoder.set_quality(quality);
        }
    }

    pub fn quality(&self) -> StreamQuality {
        StreamQuality::from_u8(self.quality.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.stats.lock().expect("lock poisoned");
        let network = self
            .rtsp
            .lock()
            .expect("lock poisoned")
            .as_ref()
            .map(|client| client.stats());
        SessionStats {
            current_fps: inner.current_fps,
            decoded_frames: inner.decoded_frames,
            dropped_frames: inner.dropped_frames,
            packets_in_queue: self.queue.len(),
            bytes_received: network.as_ref().map(|n| n.bytes_received).unwrap_or(0),
            last_frame_pts: inner.last_frame_pts,
            network,
        }
    }

    pub(crate) fn update_state(&self, new_state: StreamState) {
        let old = StreamState::from_u8(
            self.state.swap(new_state as u8, Ordering::AcqRel),
        );
        if old != new_state {
            log::info!(
                "Camera {} state: {} -> {}",
                self.config.id,
                old.as_str(),
                new_state.as_str()
            );
        }
    }

    /// Count one decoded frame; re-samples FPS on one-second windows.
    pub(crate) fn record_decoded_frame(&self, pts: i64) {
        let mut inner = self.stats.lock().expect("lock poisoned");
        inner.decoded_frames += 1;
        inner.frames_since_update += 1;
        inner.last_frame_pts = pts;

        let elapsed = inner.last_fps_update.elapsed();
        if elapsed >= Duration::from_secs(1) {
            inner.current_fps =
                (f64::from(inner.frames_since_update) / elapsed.as_secs_f64()).round() as u32;
            inner.frames_since_update = 0;
            inner.last_fps_update = Instant::now();
        }
    }

    /// Count one packet discarded by the bounded queue.
    pub(crate) fn record_dropped_packet(&self) {
        self.stats.lock().expect("lock poisoned").dropped_frames += 1;
    }

    pub(crate) fn rtsp_client(&self) -> &Mutex<Option<RtspClient>> {
        &self.rtsp
    }

    pub(crate) fn decoder(&self) -> &Mutex<Option<Box<dyn Decoder>>> {
        &self.decoder
    }

    pub(crate) fn packet_queue(&self) -> &BoundedQueue<Packet> {
        &self.queue
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.stop();
    }
}
