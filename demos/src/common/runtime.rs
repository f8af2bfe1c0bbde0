//! Process setup shared by the front-ends: the compile-time tensor backend and the
//! tracing subscriber.

use burn::tensor::backend::Backend;
use cfg_if::cfg_if;
use tracing_subscriber::EnvFilter;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        /// Selected backend type
        pub type SelectedBackend = burn::backend::Cuda;
        /// Backend name for logging
        pub const BACKEND_NAME: &str = "CUDA (NVIDIA GPU)";
    } else if #[cfg(feature = "wgpu")] {
        /// Selected backend type
        pub type SelectedBackend = burn::backend::Wgpu;
        /// Backend name for logging
        pub const BACKEND_NAME: &str = "WGPU (GPU)";
    } else {
        /// Selected backend type
        pub type SelectedBackend = burn::backend::NdArray;
        /// Backend name for logging
        pub const BACKEND_NAME: &str = "NdArray (CPU)";
    }
}

/// Device of the selected backend
pub type SelectedDevice = <SelectedBackend as Backend>::Device;

/// Default device of the selected backend
pub fn create_device() -> SelectedDevice {
    SelectedDevice::default()
}

/// Installs a stderr `fmt` subscriber filtered by `RUST_LOG`, or by `default_filter`
/// when the variable is unset.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}
