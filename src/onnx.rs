// ONNX expression model: Haar cascade face detection + HSEmotion classification

use crate::detection::ExpressionModel;
use crate::error::{MoodcamError, Result};
use crate::models::{BoundingBox, Emotion, ExpressionVector, FaceDetection, Frame};
use async_trait::async_trait;
use opencv::core::{Mat, Rect, Size, Vector};
use opencv::imgproc;
use opencv::objdetect::CascadeClassifier;
use opencv::prelude::*;
use ort::session::Session;
use ort::value::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task;
use tracing::{error, info, warn};

/// Side length of the classifier's square input
const CLASSIFIER_INPUT: usize = 260;

/// A cropped grayscale face and where it was found
struct FaceRegion {
    rect: Rect,
    data: Vec<u8>,
}

/// Face detector using OpenCV Haar Cascade
pub struct FaceDetector {
    classifier: CascadeClassifier,
}

impl FaceDetector {
    /// Creates a new FaceDetector by loading the Haar Cascade classifier
    pub fn new(cascade_path: &Path) -> Result<Self> {
        let path = cascade_path.to_string_lossy();
        let classifier = CascadeClassifier::new(&path).map_err(|e| {
            error!("Failed to load Haar Cascade: {}", e);
            MoodcamError::ModelLoad(format!("Haar Cascade load failed: {e}"))
        })?;

        let empty = classifier
            .empty()
            .map_err(|e| MoodcamError::ModelLoad(format!("Haar Cascade check failed: {e}")))?;
        if empty {
            return Err(MoodcamError::ModelLoad(format!(
                "Haar Cascade classifier at {path} is empty"
            )));
        }

        Ok(Self { classifier })
    }

    /// Detects faces in the given frame and returns their grayscale crops
    fn detect_faces(&mut self, frame: &Frame) -> Result<Vec<FaceRegion>> {
        let mat = Mat::from_slice(&frame.data)?;
        let mat = mat.reshape(3, frame.height as i32)?;

        let mut gray = Mat::default();
        imgproc::cvt_color(
            &mat,
            &mut gray,
            imgproc::COLOR_RGB2GRAY,
            0,
            opencv::core::AlgorithmHint::ALGO_HINT_DEFAULT,
        )?;

        let mut faces = Vector::<Rect>::new();
        self.classifier.detect_multi_scale(
            &gray,
            &mut faces,
            1.1,               // scale factor
            5,                 // min neighbors
            0,                 // flags
            Size::new(40, 40), // min size
            Size::new(0, 0),   // no max size
        )?;

        let mut regions = Vec::with_capacity(faces.len());
        for rect in faces.iter() {
            match extract_face_region(&gray, rect) {
                Ok(data) => regions.push(FaceRegion { rect, data }),
                Err(e) => warn!("Failed to extract face region: {}", e),
            }
        }

        Ok(regions)
    }
}

/// Crops a face region out of the grayscale frame into a continuous buffer
fn extract_face_region(gray: &Mat, rect: Rect) -> Result<Vec<u8>> {
    let face_roi = Mat::roi(gray, rect)?;
    let face_continuous = face_roi.try_clone()?;
    Ok(face_continuous.data_bytes()?.to_vec())
}

/// Converts a grayscale face crop into the normalized HWC RGB input
fn preprocess_face(face: &FaceRegion) -> Result<Vec<f32>> {
    let face_mat = Mat::from_slice(&face.data)?;
    let face_mat = face_mat.reshape(1, face.rect.height)?;

    let mut rgb_mat = Mat::default();
    imgproc::cvt_color_def(&face_mat, &mut rgb_mat, imgproc::COLOR_GRAY2RGB)?;

    let mut resized = Mat::default();
    imgproc::resize(
        &rgb_mat,
        &mut resized,
        Size::new(CLASSIFIER_INPUT as i32, CLASSIFIER_INPUT as i32),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    let data = resized.data_bytes()?;
    Ok(data.iter().map(|&pixel| pixel as f32 / 255.0).collect())
}

/// Emotion classifier using ONNX Runtime
pub struct EmotionClassifier {
    session: Session,
}

impl EmotionClassifier {
    /// Creates a new EmotionClassifier by loading the ONNX model
    pub fn new(model_path: &Path) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| {
                MoodcamError::ModelLoad(format!("Failed to create session builder: {e}"))
            })?
            .commit_from_file(model_path)
            .map_err(|e| {
                error!("Failed to load ONNX model: {}", e);
                MoodcamError::ModelLoad(format!("ONNX model load failed: {e}"))
            })?;

        Ok(Self { session })
    }

    /// Runs the classifier and returns softmax probabilities per model class
    pub fn classify(&mut self, preprocessed_face: &[f32]) -> Result<Vec<f32>> {
        let side = CLASSIFIER_INPUT;
        let channels = 3;

        // HWC -> CHW
        let mut chw_data = vec![0.0f32; channels * side * side];
        for h in 0..side {
            for w in 0..side {
                for c in 0..channels {
                    let hwc_idx = (h * side + w) * channels + c;
                    let chw_idx = c * (side * side) + h * side + w;
                    chw_data[chw_idx] = preprocessed_face[hwc_idx];
                }
            }
        }

        let input_array = ndarray::Array4::from_shape_vec((1, channels, side, side), chw_data)
            .map_err(|e| {
                MoodcamError::DetectionCycle(format!("Failed to create input array: {e}"))
            })?;
        let input_tensor = Value::from_array(input_array)?;

        let outputs = self.session.run(ort::inputs![input_tensor])?;
        let (_, output_value) = outputs
            .iter()
            .next()
            .ok_or_else(|| MoodcamError::DetectionCycle("No output from model".to_string()))?;

        let tensor = output_value.try_extract_tensor::<f32>()?;
        Ok(softmax(tensor.1))
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let exp_sum: f32 = logits.iter().map(|&x| (x - max_logit).exp()).sum();
    logits
        .iter()
        .map(|&x| (x - max_logit).exp() / exp_sum)
        .collect()
}

/// Maps a model output index to a label.
/// HSEmotion: 0=Angry, 1=Disgust, 2=Fear, 3=Happy, 4=Sad, 5=Surprise, 6=Neutral, 7=Contempt
fn index_to_emotion(index: usize) -> Option<Emotion> {
    match index {
        0 => Some(Emotion::Angry),
        1 | 7 => Some(Emotion::Disgust),
        3 => Some(Emotion::Happy),
        4 => Some(Emotion::Sad),
        5 => Some(Emotion::Surprised),
        6 => Some(Emotion::Neutral),
        _ => None,
    }
}

fn to_expression_vector(probabilities: &[f32]) -> ExpressionVector {
    let mut vector = ExpressionVector::new();
    for (index, &p) in probabilities.iter().enumerate() {
        if let Some(emotion) = index_to_emotion(index) {
            vector.add(emotion, p);
        }
    }
    vector
}

struct LoadedModel {
    face_detector: FaceDetector,
    classifier: EmotionClassifier,
}

type ModelSlot = Arc<Mutex<Option<LoadedModel>>>;

/// Expression model backed by an OpenCV cascade and an ONNX classifier.
///
/// Loading and inference run on the blocking pool so the detection loop's
/// runtime thread stays free for ticks and commands.
pub struct OnnxExpressionModel {
    cascade_path: PathBuf,
    classifier_path: PathBuf,
    loaded: ModelSlot,
}

impl OnnxExpressionModel {
    pub fn new(cascade_path: impl Into<PathBuf>, classifier_path: impl Into<PathBuf>) -> Self {
        Self {
            cascade_path: cascade_path.into(),
            classifier_path: classifier_path.into(),
            loaded: Arc::new(Mutex::new(None)),
        }
    }
}

fn load_blocking(
    slot: &Mutex<Option<LoadedModel>>,
    cascade: &Path,
    classifier: &Path,
) -> Result<()> {
    let face_detector = FaceDetector::new(cascade)?;
    let classifier_model = EmotionClassifier::new(classifier)?;

    let mut slot = slot
        .lock()
        .map_err(|_| MoodcamError::ModelLoad("model state poisoned".to_string()))?;
    *slot = Some(LoadedModel {
        face_detector,
        classifier: classifier_model,
    });
    info!(
        "Loaded expression model ({}, {})",
        cascade.display(),
        classifier.display()
    );
    Ok(())
}

fn infer_blocking(slot: &Mutex<Option<LoadedModel>>, frame: &Frame) -> Result<Vec<FaceDetection>> {
    let mut slot = slot
        .lock()
        .map_err(|_| MoodcamError::DetectionCycle("model state poisoned".to_string()))?;
    let model = slot
        .as_mut()
        .ok_or_else(|| MoodcamError::DetectionCycle("model not loaded".to_string()))?;

    let regions = model.face_detector.detect_faces(frame)?;
    let mut detections = Vec::with_capacity(regions.len());
    for region in &regions {
        let preprocessed = preprocess_face(region)?;
        let probabilities = model.classifier.classify(&preprocessed)?;
        let rect = region.rect;
        detections.push(FaceDetection::new(
            BoundingBox::new(
                rect.x as f32,
                rect.y as f32,
                rect.width as f32,
                rect.height as f32,
            ),
            to_expression_vector(&probabilities),
        ));
    }
    Ok(detections)
}

#[async_trait]
impl ExpressionModel for OnnxExpressionModel {
    async fn load(&self) -> Result<()> {
        let slot = self.loaded.clone();
        let cascade = self.cascade_path.clone();
        let classifier = self.classifier_path.clone();
        task::spawn_blocking(move || load_blocking(&slot, &cascade, &classifier))
            .await
            .map_err(|e| MoodcamError::ModelLoad(format!("model loader panicked: {e}")))?
    }

    async fn infer(&self, frame: &Frame) -> Result<Vec<FaceDetection>> {
        let slot = self.loaded.clone();
        let frame = frame.clone();
        task::spawn_blocking(move || infer_blocking(&slot, &frame))
            .await
            .map_err(|e| MoodcamError::DetectionCycle(format!("inference task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contempt_folds_into_disgust_and_fear_is_dropped() {
        let probabilities = [0.1, 0.2, 0.3, 0.0, 0.0, 0.0, 0.0, 0.4];
        let v = to_expression_vector(&probabilities);
        assert!((v.get(Emotion::Disgust) - 0.6).abs() < 1e-6);
        assert!((v.get(Emotion::Angry) - 0.1).abs() < 1e-6);
        let total: f32 = v.iter().map(|(_, p)| p).sum();
        assert!((total - 0.7).abs() < 1e-6);
    }

    #[tokio::test]
    async fn inference_before_load_is_a_cycle_error() {
        let model = OnnxExpressionModel::new("missing.xml", "missing.onnx");
        let frame = Frame::new(vec![0; 12], 2, 2);
        assert!(matches!(
            model.infer(&frame).await,
            Err(MoodcamError::DetectionCycle(_))
        ));
    }

    #[tokio::test]
    async fn missing_model_files_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let model = OnnxExpressionModel::new(
            dir.path().join("missing.xml"),
            dir.path().join("missing.onnx"),
        );
        assert!(matches!(model.load().await, Err(MoodcamError::ModelLoad(_))));
        assert!(model.loaded.lock().unwrap().is_none());
    }

    #[test]
    fn softmax_sums_to_one() {
        let probabilities = softmax(&[1.0, 2.0, 3.0]);
        let total: f32 = probabilities.iter().sum();
        assert!((total - 1.0).abs() < 1e-5);
        assert!(probabilities[2] > probabilities[1]);
    }
}
