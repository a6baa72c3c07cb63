//! Decoder selection: hardware when available and preferred, software
//! otherwise.

use super::{Decoder, HardwareDecoder, SoftwareDecoder};
use crate::gpu::{CudaContextService, GpuMemoryAccountant};
use crate::types::DecoderConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Explicit decoder selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoderKind {
    /// Hardware when preferred and available, software otherwise.
    Auto,
    Hardware,
    Software,
}

/// Capability probe result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderCapabilities {
    pub hardware_available: bool,
    /// The software decoder is compiled in unconditionally.
    pub software_available: bool,
    pub device_count: i32,
    pub device_name: Option<String>,
    pub recommendation: String,
}

pub struct DecoderFactory;

impl DecoderFactory {
    /// Build and initialize a decoder per the config's hardware preference.
    /// Returns `None` when initialization fails.
    pub fn create(
        config: &DecoderConfig,
        gpu: &CudaContextService,
        accountant: Option<Arc<GpuMemoryAccountant>>,
        camera_id: &str,
    ) -> Option<Box<dyn Decoder>> {
        Self::create_kind(DecoderKind::Auto, config, gpu, accountant, camera_id)
    }

    /// Build and initialize a specific decoder kind.
    pub fn create_kind(
        kind: DecoderKind,
        config: &DecoderConfig,
        gpu: &CudaContextService,
        accountant: Option<Arc<GpuMemoryAccountant>>,
        camera_id: &str,
    ) -> Option<Box<dyn Decoder>> {
        let kind = match kind {
            DecoderKind::Auto => {
                if config.prefer_hardware && Self::is_hardware_available(gpu) {
                    DecoderKind::Hardware
                } else {
                    DecoderKind::Software
                }
            }
            explicit => explicit,
        };

        let mut decoder: Box<dyn Decoder> = match kind {
            DecoderKind::Hardware => {
                if !Self::is_hardware_available(gpu) {
                    log::warn!(
                        "DecoderFactory: hardware requested for {} but unavailable, \
                         falling back to software",
                        camera_id
                    );
                    Box::new(SoftwareDecoder::new())
                } else {
                    match HardwareDecoder::new(gpu, camera_id, accountant) {
                        Ok(decoder) => Box::new(decoder),
                        Err(e) => {
                            log::warn!(
                                "DecoderFactory: hardware decoder for {} failed ({}), \
                                 falling back to software",
                                camera_id,
                                e
                            );
                            Box::new(SoftwareDecoder::new())
                        }
                    }
                }
            }
            _ => Box::new(SoftwareDecoder::new()),
        };

        if let Err(e) = decoder.initialize(config) {
            log::error!("DecoderFactory: decoder init failed for {}: {}", camera_id, e);
            return None;
        }
        Some(decoder)
    }

    /// Whether the hardware path can be used at all: the driver loaded and a
    /// device is present.
    pub fn is_hardware_available(gpu: &CudaContextService) -> bool {
        gpu.is_available()
    }

    /// Probe what this host can decode with.
    pub fn capabilities(gpu: &CudaContextService) -> DecoderCapabilities {
        let hardware_available = Self::is_hardware_available(gpu);
        DecoderCapabilities {
            hardware_available,
            software_available: true,
            device_count: gpu.device_count(),
            device_name: gpu.device_name(),
            recommendation: if hardware_available {
                "NVDEC (hardware)".to_string()
            } else {
                "openh264 (software)".to_string()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn software_is_always_available() {
        let gpu = CudaContextService::new(0);
        let caps = DecoderFactory::capabilities(&gpu);
        assert!(caps.software_available);
    }

    #[test]
    fn explicit_software_kind() {
        let gpu = CudaContextService::new(0);
        let config = DecoderConfig::default();
        let decoder =
            DecoderFactory::create_kind(DecoderKind::Software, &config, &gpu, None, "cam-test")
                .expect("software decoder must initialize");
        assert!(!decoder.is_hardware_accelerated());
    }

    #[test]
    fn auto_falls_back_without_gpu() {
        let gpu = CudaContextService::new(0);
        if DecoderFactory::is_hardware_available(&gpu) {
            return; // Host has a GPU; fallback path not exercised here.
        }
        let config = DecoderConfig {
            prefer_hardware: true,
            ..DecoderConfig::default()
        };
        let decoder = DecoderFactory::create(&config, &gpu, None, "cam-test")
            .expect("fallback decoder must initialize");
        assert!(!decoder.is_hardware_accelerated());
    }
}
