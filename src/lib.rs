// Library exports for moodcam - live emotion detection, captures and gallery

pub mod camera;
pub mod config;
pub mod detection;
pub mod emotion;
pub mod error;
pub mod gallery;
pub mod logging;
pub mod models;
pub mod notify;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod overlay;
pub mod sampler;
pub mod store;
