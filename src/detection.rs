// Detection adapter around the external expression model

use crate::error::{MoodcamError, Result};
use crate::models::{FaceDetection, Frame};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

/// The opaque face/expression model.
///
/// `load` fetches every sub-module the model needs; `infer` returns zero or
/// more faces, each with a probability per enumerated label.
#[async_trait]
pub trait ExpressionModel: Send + Sync {
    async fn load(&self) -> Result<()>;

    async fn infer(&self, frame: &Frame) -> Result<Vec<FaceDetection>>;
}

/// Wraps an [`ExpressionModel`] with load-once semantics and per-frame error
/// recovery.
pub struct DetectionAdapter {
    model: Arc<dyn ExpressionModel>,
    load_outcome: OnceCell<std::result::Result<(), String>>,
    in_flight: AtomicBool,
    failed_cycles: AtomicU64,
}

impl DetectionAdapter {
    pub fn new(model: Arc<dyn ExpressionModel>) -> Self {
        Self {
            model,
            load_outcome: OnceCell::new(),
            in_flight: AtomicBool::new(false),
            failed_cycles: AtomicU64::new(0),
        }
    }

    /// Loads the model exactly once.
    ///
    /// Later calls return the first outcome; a failed load is not retried.
    pub async fn initialize(&self) -> Result<()> {
        let outcome = self
            .load_outcome
            .get_or_init(|| async {
                info!("Loading expression model");
                match self.model.load().await {
                    Ok(()) => {
                        info!("Expression model ready");
                        Ok(())
                    }
                    Err(e) => {
                        error!("Expression model failed to load: {}", e);
                        Err(e.to_string())
                    }
                }
            })
            .await;

        outcome.clone().map_err(MoodcamError::ModelLoad)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.load_outcome.get(), Some(Ok(())))
    }

    /// Number of cycles that degraded to an empty result
    pub fn failed_cycles(&self) -> u64 {
        self.failed_cycles.load(Ordering::Relaxed)
    }

    /// Runs one detection cycle.
    ///
    /// Any failure is logged and reported as "no face detected". Calls made
    /// before a successful `initialize`, or while another call is outstanding,
    /// also yield an empty list.
    pub async fn detect(&self, frame: &Frame) -> Vec<FaceDetection> {
        match self.try_detect(frame).await {
            Ok(detections) => detections,
            Err(e) => {
                self.failed_cycles.fetch_add(1, Ordering::Relaxed);
                warn!("Detection cycle degraded to empty result: {}", e);
                Vec::new()
            }
        }
    }

    async fn try_detect(&self, frame: &Frame) -> Result<Vec<FaceDetection>> {
        if !self.is_ready() {
            return Err(MoodcamError::DetectionCycle(
                "model has not been initialized".to_string(),
            ));
        }

        let _slot = InFlightSlot::claim(&self.in_flight).ok_or_else(|| {
            MoodcamError::DetectionCycle("a detection call is already outstanding".to_string())
        })?;

        let detections = self.model.infer(frame).await?;
        debug!(
            "Detected {} face(s) in {}x{} frame",
            detections.len(),
            frame.width,
            frame.height
        );
        Ok(detections)
    }
}

/// Marks a detection call as outstanding until dropped
struct InFlightSlot<'a>(&'a AtomicBool);

impl<'a> InFlightSlot<'a> {
    fn claim(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
