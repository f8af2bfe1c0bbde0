//! Common utilities for the MdfraNet front-ends.

pub mod image;
pub mod runtime;

pub use image::ImageUtils;
pub use runtime::{create_device, init_tracing, SelectedBackend, SelectedDevice, BACKEND_NAME};
