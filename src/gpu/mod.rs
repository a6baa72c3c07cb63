//! GPU support: runtime-loaded CUDA/CUVID bindings, the per-process context
//! service, and centralized VRAM accounting.

pub mod accountant;
pub mod cuda;

pub use accountant::{AccountantConfig, AccountantStats, GpuMemoryAccountant};
pub use cuda::{CudaApi, CudaContextService, GpuWorkerContext};
