//! Runtime-loaded CUDA driver and CUVID (NVDEC) bindings.
//!
//! The driver (`libcuda`) and video decode (`libnvcuvid`) libraries are
//! loaded with `libloading` at startup, so the crate builds and runs on
//! hosts without the CUDA toolkit; hardware decode simply reports
//! unavailable when the libraries or a device are missing.
//!
//! [`CudaContextService`] is the process-wide owner of the loaded API and
//! the shared decoder context. It is created by the pipeline coordinator and
//! passed explicitly to the decode pool and decoder factory; there is no
//! global singleton.

use crate::errors::{StreamError, StreamResult};
use std::ffi::c_void;
use std::ptr;
use std::sync::{Arc, Mutex};

pub type CUresult = i32;
pub type CUdevice = i32;
pub type CUcontext = *mut c_void;
pub type CUstream = *mut c_void;
pub type CUdeviceptr = u64;
pub type CUvideoparser = *mut c_void;
pub type CUvideodecoder = *mut c_void;

pub const CUDA_SUCCESS: CUresult = 0;

pub const CUVID_PKT_ENDOFSTREAM: u32 = 0x01;
pub const CUVID_PKT_TIMESTAMP: u32 = 0x02;

pub const CU_MEMORYTYPE_DEVICE: u32 = 0x02;

/// cudaVideoCodec values from cuviddec.h.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CudaVideoCodec {
    Mpeg1 = 0,
    Mpeg2 = 1,
    Mpeg4 = 2,
    Vc1 = 3,
    H264 = 4,
    Jpeg = 5,
    H264Svc = 6,
    H264Mvc = 7,
    Hevc = 8,
    Vp8 = 9,
    Vp9 = 10,
    Av1 = 11,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CudaVideoChromaFormat {
    Monochrome = 0,
    Yuv420 = 1,
    Yuv422 = 2,
    Yuv444 = 3,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CudaVideoSurfaceFormat {
    Nv12 = 0,
    P016 = 1,
    Yuv444 = 2,
    Yuv444P16 = 3,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CudaVideoDeinterlaceMode {
    Weave = 0,
    Bob = 1,
    Adaptive = 2,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CuvidFraction {
    pub numerator: u32,
    pub denominator: u32,
}

/// Short-based rectangle used by CUVIDDECODECREATEINFO.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CuvidRect {
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
}

/// Int-based rectangle used by CUVIDEOFORMAT.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CuvidDisplayRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CuvidAspectRatio {
    pub x: i32,
    pub y: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CuvidVideoSignalDescription {
    pub video_format: u8,
    pub video_full_range_flag: u8,
    pub reserved_zero_bits: u8,
    pub color_primaries: u8,
    pub transfer_characteristics: u8,
    pub matrix_coefficients: u8,
}

/// CUVIDEOFORMAT handed to the sequence callback.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct CuvidVideoFormat {
    pub codec: CudaVideoCodec,
    pub frame_rate: CuvidFraction,
    pub progressive_sequence: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub min_num_decode_surfaces: u8,
    pub coded_width: u32,
    pub coded_height: u32,
    pub display_area: CuvidDisplayRect,
    pub chroma_format: CudaVideoChromaFormat,
    pub bitrate: u32,
    pub display_aspect_ratio: CuvidAspectRatio,
    pub video_signal_description: CuvidVideoSignalDescription,
    pub seqhdr_data_length: u32,
}

/// CUVIDPICPARAMS handed to the decode callback. Codec-specific tail kept
/// opaque.
#[repr(C)]
pub struct CuvidPicParams {
    pub pic_width_in_mbs: i32,
    pub pic_height_in_mbs: i32,
    pub curr_pic_idx: i32,
    pub field_pic_flag: i32,
    pub bottom_field_flag: i32,
    pub second_field: i32,
    pub bitstream_data_len: u32,
    pub bitstream_data: *const u8,
    pub num_slices: u32,
    pub slice_data_offsets: *const u32,
    pub ref_pic_flag: i32,
    pub intra_pic_flag: i32,
    pub reserved: [u32; 30],
    pub codec_specific: [u8; 1024],
}

/// CUVIDPARSERDISPINFO handed to the display callback.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CuvidParserDispInfo {
    pub picture_index: i32,
    pub progressive_frame: i32,
    pub top_field_first: i32,
    pub repeat_first_field: i32,
    pub timestamp: i64,
}

// The SDK declares the ul-prefixed fields as `unsigned long`, which is 8
// bytes on LP64 Linux and 4 on Windows; c_ulong tracks that.
#[repr(C)]
pub struct CuvidDecodeCreateInfo {
    pub width: libc::c_ulong,
    pub height: libc::c_ulong,
    pub num_decode_surfaces: libc::c_ulong,
    pub codec_type: CudaVideoCodec,
    pub chroma_format: CudaVideoChromaFormat,
    pub creation_flags: libc::c_ulong,
    pub bit_depth_minus8: libc::c_ulong,
    pub intra_decode_only: libc::c_ulong,
    pub max_width: libc::c_ulong,
    pub max_height: libc::c_ulong,
    pub reserved1: libc::c_ulong,
    pub display_area: CuvidRect,
    pub output_format: CudaVideoSurfaceFormat,
    pub deinterlace_mode: CudaVideoDeinterlaceMode,
    pub target_width: libc::c_ulong,
    pub target_height: libc::c_ulong,
    pub num_output_surfaces: libc::c_ulong,
    pub vid_lock: *mut c_void,
    pub target_rect: CuvidRect,
    pub reserved2: [libc::c_ulong; 5],
}

pub type SequenceCallback = extern "C" fn(*mut c_void, *mut CuvidVideoFormat) -> i32;
pub type DecodeCallback = extern "C" fn(*mut c_void, *mut CuvidPicParams) -> i32;
pub type DisplayCallback = extern "C" fn(*mut c_void, *mut CuvidParserDispInfo) -> i32;

#[repr(C)]
pub struct CuvidParserParams {
    pub codec_type: CudaVideoCodec,
    pub max_num_decode_surfaces: u32,
    pub clock_rate: u32,
    pub error_threshold: u32,
    pub max_display_delay: u32,
    pub reserved1: [u32; 5],
    pub user_data: *mut c_void,
    pub sequence_callback: Option<SequenceCallback>,
    pub decode_picture: Option<DecodeCallback>,
    pub display_picture: Option<DisplayCallback>,
    pub ext_video_info: *mut c_void,
}

#[repr(C)]
pub struct CuvidSourceDataPacket {
    pub flags: libc::c_ulong,
    pub payload_size: libc::c_ulong,
    pub payload: *const u8,
    pub timestamp: i64,
}

#[repr(C)]
pub struct CuvidProcParams {
    pub progressive_frame: i32,
    pub second_field: i32,
    pub top_field_first: i32,
    pub unpaired_field: i32,
    pub reserved_flags: u32,
    pub reserved_zero: u32,
    pub raw_input_dptr: u64,
    pub raw_input_pitch: u32,
    pub raw_input_format: u32,
    pub raw_output_dptr: u64,
    pub raw_output_pitch: u32,
    pub reserved1: u32,
    pub output_stream: CUstream,
    pub reserved: [u32; 46],
}

impl Default for CuvidProcParams {
    fn default() -> Self {
        // All-zero except the explicit fields callers set.
        unsafe { std::mem::zeroed() }
    }
}

/// CUDA_MEMCPY2D from cuda.h, used for surface-pool copies.
#[repr(C)]
pub struct CudaMemcpy2d {
    pub src_x_in_bytes: usize,
    pub src_y: usize,
    pub src_memory_type: u32,
    pub src_host: *const c_void,
    pub src_device: CUdeviceptr,
    pub src_array: *mut c_void,
    pub src_pitch: usize,
    pub dst_x_in_bytes: usize,
    pub dst_y: usize,
    pub dst_memory_type: u32,
    pub dst_host: *mut c_void,
    pub dst_device: CUdeviceptr,
    pub dst_array: *mut c_void,
    pub dst_pitch: usize,
    pub width_in_bytes: usize,
    pub height: usize,
}

impl Default for CudaMemcpy2d {
    fn default() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

type CuInitFn = unsafe extern "C" fn(u32) -> CUresult;
type CuDeviceGetCountFn = unsafe extern "C" fn(*mut i32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(*mut CUdevice, i32) -> CUresult;
type CuDeviceGetNameFn = unsafe extern "C" fn(*mut u8, i32, CUdevice) -> CUresult;
type CuDeviceTotalMemFn = unsafe extern "C" fn(*mut usize, CUdevice) -> CUresult;
type CuCtxCreateFn = unsafe extern "C" fn(*mut CUcontext, u32, CUdevice) -> CUresult;
type CuCtxDestroyFn = unsafe extern "C" fn(CUcontext) -> CUresult;
type CuCtxPushCurrentFn = unsafe extern "C" fn(CUcontext) -> CUresult;
type CuCtxPopCurrentFn = unsafe extern "C" fn(*mut CUcontext) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(CUcontext) -> CUresult;
type CuMemAllocPitchFn =
    unsafe extern "C" fn(*mut CUdeviceptr, *mut usize, usize, usize, u32) -> CUresult;
type CuMemFreeFn = unsafe extern "C" fn(CUdeviceptr) -> CUresult;
type CuMemcpy2dAsyncFn = unsafe extern "C" fn(*const CudaMemcpy2d, CUstream) -> CUresult;
type CuStreamSynchronizeFn = unsafe extern "C" fn(CUstream) -> CUresult;

type CuvidCreateVideoParserFn =
    unsafe extern "C" fn(*mut CUvideoparser, *mut CuvidParserParams) -> CUresult;
type CuvidDestroyVideoParserFn = unsafe extern "C" fn(CUvideoparser) -> CUresult;
type CuvidParseVideoDataFn =
    unsafe extern "C" fn(CUvideoparser, *mut CuvidSourceDataPacket) -> CUresult;
type CuvidCreateDecoderFn =
    unsafe extern "C" fn(*mut CUvideodecoder, *mut CuvidDecodeCreateInfo) -> CUresult;
type CuvidDestroyDecoderFn = unsafe extern "C" fn(CUvideodecoder) -> CUresult;
type CuvidDecodePictureFn = unsafe extern "C" fn(CUvideodecoder, *mut CuvidPicParams) -> CUresult;
type CuvidMapVideoFrameFn = unsafe extern "C" fn(
    CUvideodecoder,
    i32,
    *mut CUdeviceptr,
    *mut u32,
    *mut CuvidProcParams,
) -> CUresult;
type CuvidUnmapVideoFrameFn = unsafe extern "C" fn(CUvideodecoder, CUdeviceptr) -> CUresult;

/// Loaded CUDA + CUVID entry points. The `libloading` handles live for the
/// lifetime of this struct; the function pointers must not outlive it.
pub struct CudaApi {
    _cuda_lib: libloading::Library,
    _cuvid_lib: libloading::Library,

    pub cu_init: CuInitFn,
    pub cu_device_get_count: CuDeviceGetCountFn,
    pub cu_device_get: CuDeviceGetFn,
    pub cu_device_get_name: CuDeviceGetNameFn,
    pub cu_device_total_mem: CuDeviceTotalMemFn,
    pub cu_ctx_create: CuCtxCreateFn,
    pub cu_ctx_destroy: CuCtxDestroyFn,
    pub cu_ctx_push_current: CuCtxPushCurrentFn,
    pub cu_ctx_pop_current: CuCtxPopCurrentFn,
    pub cu_ctx_set_current: CuCtxSetCurrentFn,
    pub cu_mem_alloc_pitch: CuMemAllocPitchFn,
    pub cu_mem_free: CuMemFreeFn,
    pub cu_memcpy_2d_async: CuMemcpy2dAsyncFn,
    pub cu_stream_synchronize: CuStreamSynchronizeFn,

    pub cuvid_create_video_parser: CuvidCreateVideoParserFn,
    pub cuvid_destroy_video_parser: CuvidDestroyVideoParserFn,
    pub cuvid_parse_video_data: CuvidParseVideoDataFn,
    pub cuvid_create_decoder: CuvidCreateDecoderFn,
    pub cuvid_destroy_decoder: CuvidDestroyDecoderFn,
    pub cuvid_decode_picture: CuvidDecodePictureFn,
    pub cuvid_map_video_frame: CuvidMapVideoFrameFn,
    pub cuvid_unmap_video_frame: CuvidUnmapVideoFrameFn,
}

unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

#[cfg(target_os = "windows")]
fn cuda_lib_candidates() -> Vec<String> {
    vec!["nvcuda.dll".to_string()]
}

#[cfg(target_os = "windows")]
fn cuvid_lib_candidates() -> Vec<String> {
    vec!["nvcuvid.dll".to_string()]
}

#[cfg(target_os = "linux")]
fn cuda_lib_candidates() -> Vec<String> {
    [
        "/usr/lib/x86_64-linux-gnu/libcuda.so.1",
        "/usr/lib/libcuda.so.1",
        "/usr/local/cuda/lib64/libcuda.so.1",
        "libcuda.so.1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(target_os = "linux")]
fn cuvid_lib_candidates() -> Vec<String> {
    [
        "/usr/lib/x86_64-linux-gnu/libnvcuvid.so.1",
        "/usr/lib/libnvcuvid.so.1",
        "/usr/local/cuda/lib64/libnvcuvid.so.1",
        "libnvcuvid.so.1",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn cuda_lib_candidates() -> Vec<String> {
    Vec::new()
}

#[cfg(not(any(target_os = "windows", target_os = "linux")))]
fn cuvid_lib_candidates() -> Vec<String> {
    Vec::new()
}

fn load_first(candidates: &[String]) -> Option<libloading::Library> {
    for path in candidates {
        match unsafe { libloading::Library::new(path) } {
            Ok(lib) => return Some(lib),
            Err(e) => log::debug!("CudaApi: could not load {}: {}", path, e),
        }
    }
    None
}

macro_rules! load_symbol {
    ($lib:expr, $name:literal) => {
        match unsafe { $lib.get($name) } {
            Ok(symbol) => *symbol,
            Err(e) => {
                log::warn!(
                    "CudaApi: missing symbol {}: {}",
                    String::from_utf8_lossy(&$name[..$name.len() - 1]),
                    e
                );
                return None;
            }
        }
    };
}

impl CudaApi {
    /// Load both libraries and resolve every entry point; `None` when the
    /// host has no usable NVIDIA driver.
    pub fn load() -> Option<CudaApi> {
        let cuda_lib = load_first(&cuda_lib_candidates())?;
        let cuvid_lib = load_first(&cuvid_lib_candidates())?;

        let cu_init: CuInitFn = load_symbol!(cuda_lib, b"cuInit\0");
        let cu_device_get_count: CuDeviceGetCountFn =
            load_symbol!(cuda_lib, b"cuDeviceGetCount\0");
        let cu_device_get: CuDeviceGetFn = load_symbol!(cuda_lib, b"cuDeviceGet\0");
        let cu_device_get_name: CuDeviceGetNameFn = load_symbol!(cuda_lib, b"cuDeviceGetName\0");
        let cu_device_total_mem: CuDeviceTotalMemFn =
            load_symbol!(cuda_lib, b"cuDeviceTotalMem_v2\0");
        let cu_ctx_create: CuCtxCreateFn = load_symbol!(cuda_lib, b"cuCtxCreate_v2\0");
        let cu_ctx_destroy: CuCtxDestroyFn = load_symbol!(cuda_lib, b"cuCtxDestroy_v2\0");
        let cu_ctx_push_current: CuCtxPushCurrentFn =
            load_symbol!(cuda_lib, b"cuCtxPushCurrent_v2\0");
        let cu_ctx_pop_current: CuCtxPopCurrentFn =
            load_symbol!(cuda_lib, b"cuCtxPopCurrent_v2\0");
        let cu_ctx_set_current: CuCtxSetCurrentFn = load_symbol!(cuda_lib, b"cuCtxSetCurrent\0");
        let cu_mem_alloc_pitch: CuMemAllocPitchFn =
            load_symbol!(cuda_lib, b"cuMemAllocPitch_v2\0");
        let cu_mem_free: CuMemFreeFn = load_symbol!(cuda_lib, b"cuMemFree_v2\0");
        let cu_memcpy_2d_async: CuMemcpy2dAsyncFn =
            load_symbol!(cuda_lib, b"cuMemcpy2DAsync_v2\0");
        let cu_stream_synchronize: CuStreamSynchronizeFn =
            load_symbol!(cuda_lib, b"cuStreamSynchronize\0");

        let cuvid_create_video_parser: CuvidCreateVideoParserFn =
            load_symbol!(cuvid_lib, b"cuvidCreateVideoParser\0");
        let cuvid_destroy_video_parser: CuvidDestroyVideoParserFn =
            load_symbol!(cuvid_lib, b"cuvidDestroyVideoParser\0");
        let cuvid_parse_video_data: CuvidParseVideoDataFn =
            load_symbol!(cuvid_lib, b"cuvidParseVideoData\0");
        let cuvid_create_decoder: CuvidCreateDecoderFn =
            load_symbol!(cuvid_lib, b"cuvidCreateDecoder\0");
        let cuvid_destroy_decoder: CuvidDestroyDecoderFn =
            load_symbol!(cuvid_lib, b"cuvidDestroyDecoder\0");
        let cuvid_decode_picture: CuvidDecodePictureFn =
            load_symbol!(cuvid_lib, b"cuvidDecodePicture\0");
        let cuvid_map_video_frame: CuvidMapVideoFrameFn = match unsafe {
            cuvid_lib.get(b"cuvidMapVideoFrame64\0")
        } {
            Ok(symbol) => *symbol,
            Err(_) => load_symbol!(cuvid_lib, b"cuvidMapVideoFrame\0"),
        };
        let cuvid_unmap_video_frame: CuvidUnmapVideoFrameFn = match unsafe {
            cuvid_lib.get(b"cuvidUnmapVideoFrame64\0")
        } {
            Ok(symbol) => *symbol,
            Err(_) => load_symbol!(cuvid_lib, b"cuvidUnmapVideoFrame\0"),
        };

        let result = unsafe { cu_init(0) };
        if result != CUDA_SUCCESS {
            log::warn!("CudaApi: cuInit failed with error {}", result);
            return None;
        }

        log::info!("CudaApi: CUDA and CUVID libraries loaded");

        Some(CudaApi {
            _cuda_lib: cuda_lib,
            _cuvid_lib: cuvid_lib,
            cu_init,
            cu_device_get_count,
            cu_device_get,
            cu_device_get_name,
            cu_device_total_mem,
            cu_ctx_create,
            cu_ctx_destroy,
            cu_ctx_push_current,
            cu_ctx_pop_current,
            cu_ctx_set_current,
            cu_mem_alloc_pitch,
            cu_mem_free,
            cu_memcpy_2d_async,
            cu_stream_synchronize,
            cuvid_create_video_parser,
            cuvid_destroy_video_parser,
            cuvid_parse_video_data,
            cuvid_create_decoder,
            cuvid_destroy_decoder,
            cuvid_decode_picture,
            cuvid_map_video_frame,
            cuvid_unmap_video_frame,
        })
    }

    pub fn device_count(&self) -> i32 {
        let mut count = 0;
        let result = unsafe { (self.cu_device_get_count)(&mut count) };
        if result != CUDA_SUCCESS {
            return 0;
        }
        count
    }

    pub fn device_name(&self, device_id: i32) -> Option<String> {
        let mut device: CUdevice = 0;
        if unsafe { (self.cu_device_get)(&mut device, device_id) } != CUDA_SUCCESS {
            return None;
        }
        let mut name = [0u8; 256];
        if unsafe { (self.cu_device_get_name)(name.as_mut_ptr(), name.len() as i32, device) }
            != CUDA_SUCCESS
        {
            return None;
        }
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        Some(String::from_utf8_lossy(&name[..end]).into_owned())
    }

    pub fn device_total_memory(&self, device_id: i32) -> Option<u64> {
        let mut device: CUdevice = 0;
        if unsafe { (self.cu_device_get)(&mut device, device_id) } != CUDA_SUCCESS {
            return None;
        }
        let mut bytes = 0usize;
        if unsafe { (self.cu_device_total_mem)(&mut bytes, device) } != CUDA_SUCCESS {
            return None;
        }
        Some(bytes as u64)
    }

    /// Create a context on the given device.
    pub fn create_context(&self, device_id: i32) -> StreamResult<CUcontext> {
        let mut device: CUdevice = 0;
        let result = unsafe { (self.cu_device_get)(&mut device, device_id) };
        if result != CUDA_SUCCESS {
            return Err(StreamError::GpuContext(format!(
                "cuDeviceGet({}) failed: {}",
                device_id, result
            )));
        }

        let mut context: CUcontext = ptr::null_mut();
        let result = unsafe { (self.cu_ctx_create)(&mut context, 0, device) };
        if result != CUDA_SUCCESS {
            return Err(StreamError::GpuContext(format!(
                "cuCtxCreate failed: {}",
                result
            )));
        }
        Ok(context)
    }

    pub fn destroy_context(&self, context: CUcontext) {
        if !context.is_null() {
            let result = unsafe { (self.cu_ctx_destroy)(context) };
            if result != CUDA_SUCCESS {
                log::warn!("CudaApi: cuCtxDestroy failed: {}", result);
            }
        }
    }

    pub fn push_context(&self, context: CUcontext) {
        unsafe {
            (self.cu_ctx_push_current)(context);
        }
    }

    pub fn pop_context(&self) {
        let mut old: CUcontext = ptr::null_mut();
        unsafe {
            (self.cu_ctx_pop_current)(&mut old);
        }
    }
}

/// CUDA context handle owned by one decode worker thread for its lifetime.
#[derive(Debug, Clone, Copy)]
pub struct GpuWorkerContext {
    pub(crate) raw: CUcontext,
}

// The handle is minted on one worker thread and never leaves it; Send is
// needed only to move it into the worker closure at pool start.
unsafe impl Send for GpuWorkerContext {}

impl GpuWorkerContext {
    pub fn raw(&self) -> CUcontext {
        self.raw
    }
}

/// Process-wide GPU context service.
///
/// Lazily creates one shared "primary" context for hardware decoders and
/// mints dedicated contexts for decode worker threads.
pub struct CudaContextService {
    api: Option<Arc<CudaApi>>,
    device_id: i32,
    // Stored as usize because raw pointers are not Send; the context is
    // shared intentionally and only used through push/pop.
    primary: Mutex<Option<usize>>,
}

impl CudaContextService {
    pub fn new(device_id: i32) -> Self {
        let api = CudaApi::load().map(Arc::new);
        if api.is_none() {
            log::info!("CudaContextService: no usable CUDA driver, hardware decode disabled");
        }
        Self {
            api,
            device_id,
            primary: Mutex::new(None),
        }
    }

    /// True when the driver loaded and at least one device is present.
    pub fn is_available(&self) -> bool {
        self.api
            .as_ref()
            .map(|api| api.device_count() > 0)
            .unwrap_or(false)
    }

    pub fn api(&self) -> Option<Arc<CudaApi>> {
        self.api.clone()
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    pub fn device_count(&self) -> i32 {
        self.api.as_ref().map(|api| api.device_count()).unwrap_or(0)
    }

    pub fn device_name(&self) -> Option<String> {
        self.api.as_ref()?.device_name(self.device_id)
    }

    pub fn device_total_memory(&self) -> Option<u64> {
        self.api.as_ref()?.device_total_memory(self.device_id)
    }

    /// Shared context used by hardware decoders. Created on first use.
    pub fn primary_context(&self) -> StreamResult<CUcontext> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| StreamError::GpuContext("CUDA driver not loaded".into()))?;

        let mut primary = self.primary.lock().expect("lock poisoned");
        if let Some(raw) = *primary {
            return Ok(raw as CUcontext);
        }
        let context = api.create_context(self.device_id)?;
        *primary = Some(context as usize);
        Ok(context)
    }

    /// Dedicated context for one decode worker thread.
    pub fn create_worker_context(&self) -> StreamResult<GpuWorkerContext> {
        let api = self
            .api
            .as_ref()
            .ok_or_else(|| StreamError::GpuContext("CUDA driver not loaded".into()))?;
        let raw = api.create_context(self.device_id)?;
        let result = unsafe { (api.cu_ctx_set_current)(raw) };
        if result != CUDA_SUCCESS {
            api.destroy_context(raw);
            return Err(StreamError::GpuContext(format!(
                "cuCtxSetCurrent failed: {}",
                result
            )));
        }
        Ok(GpuWorkerContext { raw })
    }

    pub fn destroy_worker_context(&self, context: GpuWorkerContext) {
        if let Some(api) = self.api.as_ref() {
            api.destroy_context(context.raw);
        }
    }
}

impl Drop for CudaContextService {
    fn drop(&mut self) {
        if let Some(api) = self.api.as_ref() {
            if let Some(raw) = self.primary.lock().expect("lock poisoned").take() {
                api.destroy_context(raw as CUcontext);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_degrades_without_driver() {
        // On hosts without an NVIDIA driver the service must come up
        // cleanly and report unavailable rather than fail.
        let service = CudaContextService::new(0);
        if !service.is_available() {
            assert_eq!(service.device_count(), 0);
            assert!(service.primary_context().is_err());
            assert!(service.create_worker_context().is_err());
        }
    }

    #[test]
    fn struct_layout_sanity() {
        // Spot-check the hand-written FFI layouts against the SDK headers.
        assert_eq!(std::mem::size_of::<CuvidRect>(), 8);
        assert_eq!(std::mem::size_of::<CuvidDisplayRect>(), 16);
        assert_eq!(std::mem::size_of::<CuvidFraction>(), 8);

        // flags + payload_size are `unsigned long`, then pointer + i64,
        // padded to pointer alignment.
        let ulong = std::mem::size_of::<libc::c_ulong>();
        let expected = (2 * ulong + 7) / 8 * 8 + 8 + 8;
        assert_eq!(std::mem::size_of::<CuvidSourceDataPacket>(), expected);

        // The parser display info ends with an 8-aligned timestamp after
        // four ints.
        assert_eq!(std::mem::size_of::<CuvidParserDispInfo>(), 24);
    }
}
