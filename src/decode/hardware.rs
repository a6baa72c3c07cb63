//! Hardware decoder on the NVDEC/CUVID stack.
//!
//! The CUVID parser drives three C callbacks: sequence (format changes),
//! decode (picture submission), and display (decoded picture ready). The
//! callbacks receive a stable heap pointer to [`CallbackState`]; everything
//! they mutate (the video decoder handle, the surface pool with its in-use
//! bits, the frame ticket queue, the per-picture intra flags) lives behind
//! one mutex inside that state. The mutex is never held across a blocking
//! call.
//!
//! Decoded pictures are copied out of the decoder's internal DPB surface
//! into a pool surface sized by the current quality level, so a frame stays
//! valid until the pool slot is reused, independent of the decoder's own
//! surface recycling.

use super::Decoder;
use crate::errors::{StreamError, StreamResult};
use crate::gpu::cuda::{
    CuvidDecodeCreateInfo, CuvidParserDispInfo, CuvidParserParams, CuvidPicParams, CuvidRect,
    CuvidSourceDataPacket, CuvidVideoFormat, CudaApi, CudaMemcpy2d, CudaVideoCodec,
    CudaVideoDeinterlaceMode, CudaVideoSurfaceFormat, CUcontext, CUdeviceptr, CUvideodecoder,
    CUvideoparser, CUDA_SUCCESS, CUVID_PKT_ENDOFSTREAM, CUVID_PKT_TIMESTAMP,
    CU_MEMORYTYPE_DEVICE,
};
use crate::gpu::{CudaContextService, GpuMemoryAccountant};
use crate::types::{
    Codec, DecodeStatus, DecodedFrame, DecoderConfig, GpuSurfaceRef, MemoryStats, Plane,
    PixelFormat, StreamQuality,
};
use std::collections::VecDeque;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// cudaVideoCreate_PreferCUVID from cuviddec.h.
const CREATE_PREFER_CUVID: u32 = 0x04;

/// The parser never uses more picture slots than this.
const MAX_PIC_SLOTS: usize = 32;

/// One pitched NV12 allocation: luma plane above the interleaved chroma
/// plane at the same pitch.
struct Surface {
    dptr: CUdeviceptr,
    pitch: usize,
    in_use: bool,
}

/// Queue entry produced by the display callback.
struct FrameTicket {
    surface_index: usize,
    pts: i64,
    keyframe: bool,
}

/// Mutable state shared between the decode thread and the parser callbacks.
struct HwShared {
    decoder: CUvideodecoder,
    coded_width: u32,
    coded_height: u32,
    target_width: u32,
    target_height: u32,
    surfaces: Vec<Surface>,
    queue: VecDeque<FrameTicket>,
    /// Written by the decode callback, read by the display callback.
    intra_flags: [bool; MAX_PIC_SLOTS],
    gpu_bytes: u64,
    frames_decoded: u64,
    /// Latched when surface allocation fails so `decode` can report
    /// out-of-memory instead of a generic failure.
    alloc_failed: bool,
    dropped_no_surface: u64,
}

/// Heap-stable state handed to the CUVID callbacks as user data.
struct CallbackState {
    api: Arc<CudaApi>,
    /// Shared primary context from the context service; not owned here.
    context: CUcontext,
    quality: AtomicU8,
    max_width: u32,
    max_height: u32,
    camera_id: String,
    accountant: Option<Arc<GpuMemoryAccountant>>,
    shared: Mutex<HwShared>,
}

unsafe impl Send for CallbackState {}
unsafe impl Sync for CallbackState {}

impl CallbackState {
    fn pool_size(&self) -> usize {
        StreamQuality::from_u8(self.quality.load(Ordering::Relaxed)).surface_pool_size()
    }

    fn publish_memory(&self, shared: &HwShared) {
        if let Some(accountant) = &self.accountant {
            accountant.update(&self.camera_id, shared.gpu_bytes, shared.surfaces.len());
        }
    }
}

/// Free every pool surface. Caller holds the shared lock and the context.
fn free_surfaces(api: &CudaApi, shared: &mut HwShared) {
    for surface in shared.surfaces.drain(..) {
        if surface.dptr != 0 {
            unsafe {
                (api.cu_mem_free)(surface.dptr);
            }
        }
    }
    shared.gpu_bytes = 0;
}

/// Allocate `count` pitched NV12 surfaces for the current target size.
/// Caller holds the shared lock and the context.
fn allocate_surfaces(api: &CudaApi, shared: &mut HwShared, count: usize) -> bool {
    let width = shared.target_width as usize;
    // NV12: full-height luma plane plus half-height chroma plane.
    let total_height = (shared.target_height + shared.target_height / 2) as usize;
    if width == 0 || total_height == 0 {
        return false;
    }

    for i in 0..count {
        let mut dptr: CUdeviceptr = 0;
        let mut pitch: usize = 0;
        let result =
            unsafe { (api.cu_mem_alloc_pitch)(&mut dptr, &mut pitch, width, total_height, 16) };
        if result != CUDA_SUCCESS {
            log::error!("HardwareDecoder: surface {} allocation failed: {}", i, result);
            free_surfaces(api, shared);
            shared.alloc_failed = true;
            return false;
        }
        shared.gpu_bytes += (pitch * total_height) as u64;
        shared.surfaces.push(Surface {
            dptr,
            pitch,
            in_use: false,
        });
    }

    shared.alloc_failed = false;
    true
}

/// Sequence callback: fired on stream start and on format changes.
extern "C" fn handle_video_sequence(user_data: *mut c_void, format: *mut CuvidVideoFormat) -> i32 {
    if user_data.is_null() || format.is_null() {
        return 0;
    }
    let state = unsafe { &*(user_data as *const CallbackState) };
    let fmt = unsafe { &*format };

    state.api.push_context(state.context);
    let mut shared = state.shared.lock().expect("lock poisoned");

    let needs_decoder = shared.decoder.is_null()
        || shared.coded_width != fmt.coded_width
        || shared.coded_height != fmt.coded_height;

    if needs_decoder {
        log::info!(
            "HardwareDecoder[{}]: sequence {}x{} ({:?}), {} decode surfaces",
            state.camera_id,
            fmt.coded_width,
            fmt.coded_height,
            fmt.codec,
            fmt.min_num_decode_surfaces
        );

        if !shared.decoder.is_null() {
            unsafe {
                (state.api.cuvid_destroy_decoder)(shared.decoder);
            }
            shared.decoder = ptr::null_mut();
        }
        free_surfaces(&state.api, &mut shared);

        let display_width = if fmt.display_area.right > fmt.display_area.left {
            (fmt.display_area.right - fmt.display_area.left) as u32
        } else {
            fmt.coded_width
        };
        let display_height = if fmt.display_area.bottom > fmt.display_area.top {
            (fmt.display_area.bottom - fmt.display_area.top) as u32
        } else {
            fmt.coded_height
        };

        let pool_size = state.pool_size() as u32;
        let mut create_info = CuvidDecodeCreateInfo {
            width: fmt.coded_width.into(),
            height: fmt.coded_height.into(),
            num_decode_surfaces: pool_size
                .max(u32::from(fmt.min_num_decode_surfaces))
                .into(),
            codec_type: fmt.codec,
            chroma_format: fmt.chroma_format,
            creation_flags: CREATE_PREFER_CUVID.into(),
            bit_depth_minus8: u32::from(fmt.bit_depth_luma_minus8).into(),
            intra_decode_only: 0,
            max_width: state.max_width.max(fmt.coded_width).into(),
            max_height: state.max_height.max(fmt.coded_height).into(),
            reserved1: 0,
            display_area: CuvidRect {
                left: fmt.display_area.left as i16,
                top: fmt.display_area.top as i16,
                right: fmt.display_area.right as i16,
                bottom: fmt.display_area.bottom as i16,
            },
            output_format: CudaVideoSurfaceFormat::Nv12,
            deinterlace_mode: CudaVideoDeinterlaceMode::Adaptive,
            target_width: display_width.into(),
            target_height: display_height.into(),
            num_output_surfaces: 2,
            vid_lock: ptr::null_mut(),
            target_rect: Default::default(),
            reserved2: [0; 5],
        };

        let mut decoder: CUvideodecoder = ptr::null_mut();
        let result =
            unsafe { (state.api.cuvid_create_decoder)(&mut decoder, &mut create_info) };
        if result != CUDA_SUCCESS {
            log::error!(
                "HardwareDecoder[{}]: cuvidCreateDecoder failed: {}",
                state.camera_id,
                result
            );
            drop(shared);
            state.api.pop_context();
            return 0;
        }

        shared.decoder = decoder;
        shared.coded_width = fmt.coded_width;
        shared.coded_height = fmt.coded_height;
        shared.target_width = display_width;
        shared.target_height = display_height;

        let count = state.pool_size();
        if !allocate_surfaces(&state.api, &mut shared, count) {
            drop(shared);
            state.api.pop_context();
            return 0;
        }
        state.publish_memory(&shared);
    }

    let surfaces = state.pool_size() as i32;
    drop(shared);
    state.api.pop_context();
    surfaces
}

/// Decode callback: fired per picture; submits it to the video decoder.
extern "C" fn handle_picture_decode(user_data: *mut c_void, pic_params: *mut CuvidPicParams) -> i32 {
    if user_data.is_null() || pic_params.is_null() {
        return 0;
    }
    let state = unsafe { &*(user_data as *const CallbackState) };
    let params = unsafe { &mut *pic_params };

    state.api.push_context(state.context);
    let mut shared = state.shared.lock().expect("lock poisoned");
    if shared.decoder.is_null() {
        drop(shared);
        state.api.pop_context();
        return 0;
    }

    let slot = (params.curr_pic_idx.max(0) as usize) % MAX_PIC_SLOTS;
    shared.intra_flags[slot] = params.intra_pic_flag != 0;

    let result = unsafe { (state.api.cuvid_decode_picture)(shared.decoder, params) };
    drop(shared);
    state.api.pop_context();

    if result != CUDA_SUCCESS {
        log::error!(
            "HardwareDecoder[{}]: cuvidDecodePicture failed: {}",
            state.camera_id,
            result
        );
        return 0;
    }
    1
}

/// Display callback: fired when a decoded picture is ready in display
/// order. Copies it into a free pool surface and queues a ticket.
extern "C" fn handle_picture_display(
    user_data: *mut c_void,
    disp_info: *mut CuvidParserDispInfo,
) -> i32 {
    if user_data.is_null() {
        return 0;
    }
    // A null disp_info signals end of stream.
    if disp_info.is_null() {
        return 1;
    }
    let state = unsafe { &*(user_data as *const CallbackState) };
    let info = unsafe { &*disp_info };

    state.api.push_context(state.context);
    let mut shared = state.shared.lock().expect("lock poisoned");
    if shared.decoder.is_null() {
        drop(shared);
        state.api.pop_context();
        return 0;
    }

    let mut proc_params = crate::gpu::cuda::CuvidProcParams {
        progressive_frame: info.progressive_frame,
        top_field_first: info.top_field_first,
        ..Default::default()
    };

    let mut mapped: CUdeviceptr = 0;
    let mut mapped_pitch: u32 = 0;
    let result = unsafe {
        (state.api.cuvid_map_video_frame)(
            shared.decoder,
            info.picture_index,
            &mut mapped,
            &mut mapped_pitch,
            &mut proc_params,
        )
    };
    if result != CUDA_SUCCESS {
        log::error!(
            "HardwareDecoder[{}]: cuvidMapVideoFrame failed: {}",
            state.camera_id,
            result
        );
        drop(shared);
        state.api.pop_context();
        return 0;
    }

    let free_index = shared.surfaces.iter().position(|s| !s.in_use);
    match free_index {
        Some(index) => {
            shared.surfaces[index].in_use = true;
            let dst_ptr = shared.surfaces[index].dptr;
            let dst_pitch = shared.surfaces[index].pitch;
            let width = shared.target_width as usize;
            let height = shared.target_height as usize;

            // Luma plane.
            let mut copy = CudaMemcpy2d {
                src_memory_type: CU_MEMORYTYPE_DEVICE,
                src_device: mapped,
                src_pitch: mapped_pitch as usize,
                dst_memory_type: CU_MEMORYTYPE_DEVICE,
                dst_device: dst_ptr,
                dst_pitch,
                width_in_bytes: width,
                height,
                ..Default::default()
            };
            unsafe {
                (state.api.cu_memcpy_2d_async)(&copy, ptr::null_mut());
            }

            // Interleaved chroma plane at half height.
            copy.src_device = mapped + (mapped_pitch as u64 * height as u64);
            copy.dst_device = dst_ptr + (dst_pitch as u64 * height as u64);
            copy.height = height / 2;
            unsafe {
                (state.api.cu_memcpy_2d_async)(&copy, ptr::null_mut());
                (state.api.cu_stream_synchronize)(ptr::null_mut());
            }

            let slot = (info.picture_index.max(0) as usize) % MAX_PIC_SLOTS;
            let keyframe = shared.intra_flags[slot];
            shared.queue.push_back(FrameTicket {
                surface_index: index,
                pts: info.timestamp,
                keyframe,
            });
            shared.frames_decoded += 1;
        }
        None => {
            // Every pool surface is still lent out; the frame is dropped
            // rather than blocking the parser thread.
            shared.dropped_no_surface += 1;
            log::debug!(
                "HardwareDecoder[{}]: no free surface, dropping frame",
                state.camera_id
            );
        }
    }

    unsafe {
        (state.api.cuvid_unmap_video_frame)(shared.decoder, mapped);
    }
    drop(shared);
    state.api.pop_context();
    1
}

/// NVDEC-backed decoder with a quality-sized GPU surface pool.
pub struct HardwareDecoder {
    api: Arc<CudaApi>,
    config: DecoderConfig,
    parser: CUvideoparser,
    state: *mut CallbackState,
    current: DecodedFrame,
    /// Surface lent out by the previous `get_frame`, released on the next.
    last_surface: Option<usize>,
    initialized: bool,
}

unsafe impl Send for HardwareDecoder {}

impl HardwareDecoder {
    /// Bind to the shared GPU context. Fails when no driver is usable.
    pub fn new(
        service: &CudaContextService,
        camera_id: &str,
        accountant: Option<Arc<GpuMemoryAccountant>>,
    ) -> StreamResult<Self> {
        let api = service
            .api()
            .ok_or_else(|| StreamError::GpuContext("CUDA driver not loaded".into()))?;
        let context = service.primary_context()?;

        let state = Box::new(CallbackState {
            api: Arc::clone(&api),
            context,
            quality: AtomicU8::new(StreamQuality::GridView as u8),
            max_width: 1920,
            max_height: 1080,
            camera_id: camera_id.to_string(),
            accountant,
            shared: Mutex::new(HwShared {
                decoder: ptr::null_mut(),
                coded_width: 0,
                coded_height: 0,
                target_width: 0,
                target_height: 0,
                surfaces: Vec::new(),
                queue: VecDeque::new(),
                intra_flags: [false; MAX_PIC_SLOTS],
                gpu_bytes: 0,
                frames_decoded: 0,
                alloc_failed: false,
                dropped_no_surface: 0,
            }),
        });

        Ok(Self {
            api,
            config: DecoderConfig::default(),
            parser: ptr::null_mut(),
            state: Box::into_raw(state),
            current: DecodedFrame::blank(),
            last_surface: None,
            initialized: false,
        })
    }

    /// The callback state outlives every borrow of `self` (it is freed only
    /// in `Drop`), so the returned lifetime is deliberately detached to let
    /// callers mutate unrelated fields while holding it.
    fn state<'a>(&self) -> &'a CallbackState {
        unsafe { &*self.state }
    }

    fn destroy_parser(&mut self) {
        if !self.parser.is_null() {
            unsafe {
                (self.api.cuvid_destroy_video_parser)(self.parser);
            }
            self.parser = ptr::null_mut();
        }
    }
}

impl Decoder for HardwareDecoder {
    fn initialize(&mut self, config: &DecoderConfig) -> StreamResult<()> {
        if self.initialized {
            self.reset();
            self.destroy_parser();
        }

        self.config = config.clone();
        // max_width/max_height are only read by the callbacks, and no
        // parser exists yet to fire them.
        unsafe {
            (*self.state).max_width = config.max_width;
            (*self.state).max_height = config.max_height;
        }
        self.state()
            .quality
            .store(config.quality as u8, Ordering::Relaxed);

        let codec_type = match config.codec {
            Codec::H265 => CudaVideoCodec::Hevc,
            _ => CudaVideoCodec::H264,
        };

        let mut parser_params = CuvidParserParams {
            codec_type,
            max_num_decode_surfaces: config.quality.surface_pool_size() as u32,
            clock_rate: 0,
            error_threshold: 100,
            max_display_delay: 1,
            reserved1: [0; 5],
            user_data: self.state as *mut c_void,
            sequence_callback: Some(handle_video_sequence),
            decode_picture: Some(handle_picture_decode),
            display_picture: Some(handle_picture_display),
            ext_video_info: ptr::null_mut(),
        };

        self.api.push_context(self.state().context);
        let result =
            unsafe { (self.api.cuvid_create_video_parser)(&mut self.parser, &mut parser_params) };
        self.api.pop_context();

        if result != CUDA_SUCCESS {
            return Err(StreamError::DecoderInit(format!(
                "cuvidCreateVideoParser failed: {}",
                result
            )));
        }

        self.initialized = true;
        log::info!(
            "HardwareDecoder[{}]: initialized {} parser, quality {}",
            self.state().camera_id,
            config.codec.as_str(),
            config.quality.as_str()
        );
        Ok(())
    }

    fn decode(&mut self, data: &[u8], pts: i64) -> DecodeStatus {
        if !self.initialized || self.parser.is_null() {
            return DecodeStatus::DecoderFailure;
        }

        {
            let shared = self.state().shared.lock().expect("lock poisoned");
            if shared.alloc_failed {
                return DecodeStatus::OutOfMemory;
            }
        }

        let mut packet = CuvidSourceDataPacket {
            flags: CUVID_PKT_TIMESTAMP as libc::c_ulong,
            payload_size: data.len() as libc::c_ulong,
            payload: data.as_ptr(),
            timestamp: pts,
        };

        self.api.push_context(self.state().context);
        let result = unsafe { (self.api.cuvid_parse_video_data)(self.parser, &mut packet) };
        self.api.pop_context();

        if result != CUDA_SUCCESS {
            log::error!(
                "HardwareDecoder[{}]: cuvidParseVideoData failed: {}",
                self.state().camera_id,
                result
            );
            return DecodeStatus::DecoderFailure;
        }

        let shared = self.state().shared.lock().expect("lock poisoned");
        if shared.alloc_failed {
            DecodeStatus::OutOfMemory
        } else if shared.queue.is_empty() {
            DecodeStatus::NeedMoreData
        } else {
            DecodeStatus::Success
        }
    }

    fn get_frame(&mut self) -> Option<&DecodedFrame> {
        let state = self.state();
        let mut shared = state.shared.lock().expect("lock poisoned");

        // The previously returned frame's surface becomes reusable the
        // moment the caller asks for the next frame.
        if let Some(prev) = self.last_surface.take() {
            if let Some(surface) = shared.surfaces.get_mut(prev) {
                surface.in_use = false;
            }
        }

        let ticket = shared.queue.pop_front()?;
        let surface = shared.surfaces.get(ticket.surface_index)?;

        let pitch = surface.pitch;
        let base = surface.dptr;
        let height = shared.target_height;

        self.current = DecodedFrame {
            width: shared.target_width,
            height,
            pts: ticket.pts,
            dts: ticket.pts,
            keyframe: ticket.keyframe,
            format: PixelFormat::Nv12,
            planes: [
                // Device addresses, not host pointers: consumers hand these
                // to CUDA interop, never dereference them on the CPU.
                Plane {
                    ptr: base as *const u8,
                    stride: pitch,
                },
                Plane {
                    ptr: (base + pitch as u64 * u64::from(height)) as *const u8,
                    stride: pitch,
                },
                Plane::empty(),
            ],
            surface: Some(GpuSurfaceRef {
                device_ptr: base,
                pitch: pitch as u32,
            }),
        };
        self.last_surface = Some(ticket.surface_index);
        drop(shared);

        Some(&self.current)
    }

    fn set_quality(&mut self, quality: StreamQuality) {
        let state = self.state();
        let previous = StreamQuality::from_u8(state.quality.swap(quality as u8, Ordering::Relaxed));
        if previous == quality {
            return;
        }
        self.config.quality = quality;

        self.api.push_context(state.context);
        let mut shared = state.shared.lock().expect("lock poisoned");
        shared.queue.clear();
        self.last_surface = None;
        free_surfaces(&self.api, &mut shared);
        if !shared.decoder.is_null() {
            let count = quality.surface_pool_size();
            allocate_surfaces(&self.api, &mut shared, count);
        }
        state.publish_memory(&shared);
        drop(shared);
        self.api.pop_context();

        log::info!(
            "HardwareDecoder[{}]: quality -> {} ({} surfaces)",
            state.camera_id,
            quality.as_str(),
            quality.surface_pool_size()
        );
    }

    fn memory_usage(&self) -> MemoryStats {
        let state = self.state();
        let shared = state.shared.lock().expect("lock poisoned");
        MemoryStats {
            gpu_bytes: shared.gpu_bytes,
            system_bytes: (std::mem::size_of::<Self>()
                + std::mem::size_of::<CallbackState>()
                + shared.surfaces.len() * std::mem::size_of::<Surface>())
                as u64,
            surfaces_used: shared.surfaces.iter().filter(|s| s.in_use).count(),
            surfaces_capacity: state.pool_size(),
        }
    }

    fn flush(&mut self) {
        if self.parser.is_null() {
            return;
        }
        let mut packet = CuvidSourceDataPacket {
            flags: CUVID_PKT_ENDOFSTREAM as libc::c_ulong,
            payload_size: 0,
            payload: ptr::null(),
            timestamp: 0,
        };
        self.api.push_context(self.state().context);
        unsafe {
            (self.api.cuvid_parse_video_data)(self.parser, &mut packet);
        }
        self.api.pop_context();
    }

    fn reset(&mut self) {
        let state = self.state();
        let mut shared = state.shared.lock().expect("lock poisoned");
        shared.queue.clear();
        for surface in shared.surfaces.iter_mut() {
            surface.in_use = false;
        }
        shared.frames_decoded = 0;
        self.last_surface = None;
    }

    fn config(&self) -> &DecoderConfig {
        &self.config
    }

    fn is_hardware_accelerated(&self) -> bool {
        true
    }
}

impl Drop for HardwareDecoder {
    fn drop(&mut self) {
        // Parser first: no callbacks may fire while the state is torn down.
        self.destroy_parser();

        let state = unsafe { Box::from_raw(self.state) };
        {
            let mut shared = state.shared.lock().expect("lock poisoned");
            log::debug!(
                "HardwareDecoder[{}]: dropping after {} frames ({} dropped for surface starvation)",
                state.camera_id,
                shared.frames_decoded,
                shared.dropped_no_surface
            );
            state.api.push_context(state.context);
            if !shared.decoder.is_null() {
                unsafe {
                    (state.api.cuvid_destroy_decoder)(shared.decoder);
                }
                shared.decoder = ptr::null_mut();
            }
            free_surfaces(&state.api, &mut shared);
            state.api.pop_context();
        }
        if let Some(accountant) = &state.accountant {
            accountant.unregister(&state.camera_id);
        }
        // The primary context belongs to the context service.
    }
}
