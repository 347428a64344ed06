//! Backend selection
//!
//! CUDA when the `cuda` feature is compiled in, NdArray (CPU) otherwise.

use burn::backend::Autodiff;
use burn::tensor::backend::Backend;
use tracing::{info, warn};

use crate::DeviceConfig;

#[cfg(feature = "cuda")]
pub type DefaultBackend = burn_cuda::Cuda;

#[cfg(not(feature = "cuda"))]
pub type DefaultBackend = burn_ndarray::NdArray;

/// The default autodiff backend for training
pub type TrainingBackend = Autodiff<DefaultBackend>;

pub type DefaultDevice = <DefaultBackend as Backend>::Device;

/// Get the default device
pub fn default_device() -> DefaultDevice {
    DefaultDevice::default()
}

/// Resolve the device requested by the run configuration.
///
/// Asking for CUDA in a CPU-only build falls back to the CPU with a warning.
pub fn select_device(config: &DeviceConfig) -> DefaultDevice {
    #[cfg(feature = "cuda")]
    {
        if config.use_cuda {
            info!("Using CUDA device {}", config.gpu);
            return burn_cuda::CudaDevice::new(config.gpu);
        }
        warn!("CUDA build but use_cuda = false, using default CUDA device");
        default_device()
    }

    #[cfg(not(feature = "cuda"))]
    {
        if config.use_cuda {
            warn!(
                "GPU {} requested but this build has no CUDA support, falling back to CPU",
                config.gpu
            );
        } else {
            info!("Using CPU backend");
        }
        default_device()
    }
}

/// Get a human-readable name for the current backend
pub fn backend_name() -> &'static str {
    #[cfg(feature = "cuda")]
    {
        "CUDA (GPU)"
    }

    #[cfg(not(feature = "cuda"))]
    {
        "NdArray (CPU)"
    }
}
