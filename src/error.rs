// Error types for moodcam

use thiserror::Error;

/// Main error type for the detection loop, capture store and gallery
#[derive(Debug, Error)]
pub enum MoodcamError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Camera access failed: {0}")]
    CameraAccess(String),

    #[error("Detection cycle failed: {0}")]
    DetectionCycle(String),

    #[error("Capture not ready: {0}")]
    CaptureNotReady(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Selection mode is not active")]
    SelectionModeInactive,

    #[error("Unknown capture id {0}")]
    UnknownCapture(u64),

    #[error("Detection session is closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image decoding error: {0}")]
    ImageDecode(#[from] image::ImageError),
}

impl MoodcamError {
    /// Session-level failures stop the pipeline; everything else is recovered locally
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            MoodcamError::ModelLoad(_) | MoodcamError::CameraAccess(_)
        )
    }
}

/// Result type alias for moodcam operations
pub type Result<T> = std::result::Result<T, MoodcamError>;

impl From<serde_json::Error> for MoodcamError {
    fn from(err: serde_json::Error) -> Self {
        MoodcamError::Persistence(format!("malformed capture data: {err}"))
    }
}

impl From<toml::de::Error> for MoodcamError {
    fn from(err: toml::de::Error) -> Self {
        MoodcamError::Config(err.to_string())
    }
}

// Conversion from nokhwa errors
#[cfg(feature = "camera")]
impl From<nokhwa::NokhwaError> for MoodcamError {
    fn from(err: nokhwa::NokhwaError) -> Self {
        match err {
            nokhwa::NokhwaError::OpenDeviceError(device, error) => {
                MoodcamError::CameraAccess(format!("Device {device}: {error}"))
            }
            nokhwa::NokhwaError::StructureError { structure, error } => {
                MoodcamError::CameraAccess(format!("{structure}: {error}"))
            }
            _ => MoodcamError::CameraAccess(err.to_string()),
        }
    }
}

// Conversion from OpenCV errors
#[cfg(feature = "onnx")]
impl From<opencv::Error> for MoodcamError {
    fn from(err: opencv::Error) -> Self {
        MoodcamError::DetectionCycle(format!("OpenCV: {err}"))
    }
}

// Conversion from ONNX Runtime errors
#[cfg(feature = "onnx")]
impl From<ort::Error> for MoodcamError {
    fn from(err: ort::Error) -> Self {
        MoodcamError::DetectionCycle(format!("ONNX Runtime: {err}"))
    }
}
