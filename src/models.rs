// Core data models for the detection loop

use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Represents a single video frame with RGB data
#[derive(Clone, Debug)]
pub struct Frame {
    /// Raw RGB pixel data (width * height * 3 bytes)
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
}

impl Frame {
    /// Creates a new Frame with the given parameters
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    /// Builds a frame from a decoded RGB image
    pub fn from_rgb_image(image: RgbImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    /// True when the buffer holds exactly one non-empty RGB image
    pub fn is_decodable(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() == self.width as usize * self.height as usize * 3
    }

    /// Reinterprets the buffer as an image, or `None` if it is not decodable
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        if !self.is_decodable() {
            return None;
        }
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// The enumerated emotion labels, in display order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Happy,
    Neutral,
    Sad,
    Surprised,
    Angry,
    Disgust,
}

impl Emotion {
    pub const COUNT: usize = 6;

    /// Every label in enumeration order
    pub const ALL: [Emotion; Emotion::COUNT] = [
        Emotion::Happy,
        Emotion::Neutral,
        Emotion::Sad,
        Emotion::Surprised,
        Emotion::Angry,
        Emotion::Disgust,
    ];

    /// Position in the enumeration, used as the tie-break order
    pub fn index(self) -> usize {
        match self {
            Emotion::Happy => 0,
            Emotion::Neutral => 1,
            Emotion::Sad => 2,
            Emotion::Surprised => 3,
            Emotion::Angry => 4,
            Emotion::Disgust => 5,
        }
    }

    /// Lowercase key as produced by expression models
    pub fn key(self) -> &'static str {
        match self {
            Emotion::Happy => "happy",
            Emotion::Neutral => "neutral",
            Emotion::Sad => "sad",
            Emotion::Surprised => "surprised",
            Emotion::Angry => "angry",
            Emotion::Disgust => "disgust",
        }
    }

    /// Parses a model or user supplied label, case-insensitively.
    ///
    /// Accepts the common aliases `disgusted` and `surprise`. Labels outside the
    /// enumeration (e.g. `fearful`) yield `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "happy" => Some(Emotion::Happy),
            "neutral" => Some(Emotion::Neutral),
            "sad" => Some(Emotion::Sad),
            "surprised" | "surprise" => Some(Emotion::Surprised),
            "angry" => Some(Emotion::Angry),
            "disgust" | "disgusted" => Some(Emotion::Disgust),
            _ => None,
        }
    }
}

impl std::fmt::Display for Emotion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Emotion::Happy => write!(f, "Happy"),
            Emotion::Neutral => write!(f, "Neutral"),
            Emotion::Sad => write!(f, "Sad"),
            Emotion::Surprised => write!(f, "Surprised"),
            Emotion::Angry => write!(f, "Angry"),
            Emotion::Disgust => write!(f, "Disgust"),
        }
    }
}

impl std::str::FromStr for Emotion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Emotion::from_label(s).ok_or_else(|| format!("unknown emotion label '{s}'"))
    }
}

/// Camera facing mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// User-facing camera; displayed mirrored for a natural selfie view
    #[default]
    Front,
    /// Environment-facing camera
    Back,
}

impl FacingMode {
    pub fn opposite(self) -> Self {
        match self {
            FacingMode::Front => FacingMode::Back,
            FacingMode::Back => FacingMode::Front,
        }
    }

    /// Whether overlays must be drawn horizontally mirrored
    pub fn is_mirrored(self) -> bool {
        self == FacingMode::Front
    }
}

impl std::fmt::Display for FacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacingMode::Front => write!(f, "front"),
            FacingMode::Back => write!(f, "back"),
        }
    }
}

impl std::str::FromStr for FacingMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "front" | "user" => Ok(FacingMode::Front),
            "back" | "environment" => Ok(FacingMode::Back),
            other => Err(format!(
                "invalid facing mode '{other}'; expected 'front' or 'back'"
            )),
        }
    }
}

/// Axis-aligned face box in frame pixel space
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// A landmark position in frame pixel space
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Per-face probability for every enumerated label.
///
/// Labels the model did not report hold 0. Values are clamped into [0, 1] and
/// NaN is treated as 0.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ExpressionVector {
    scores: [f32; Emotion::COUNT],
}

impl ExpressionVector {
    /// Creates an all-zero vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a vector from `(label, probability)` pairs, ignoring unknown labels
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f32)>,
        S: AsRef<str>,
    {
        let mut vector = Self::new();
        for (label, probability) in pairs {
            if let Some(emotion) = Emotion::from_label(label.as_ref()) {
                vector.add(emotion, probability);
            }
        }
        vector
    }

    /// Sets one label's probability
    pub fn with(mut self, emotion: Emotion, probability: f32) -> Self {
        self.scores[emotion.index()] = sanitize(probability);
        self
    }

    /// Accumulates into one label, keeping the result a valid probability
    pub fn add(&mut self, emotion: Emotion, probability: f32) {
        let slot = &mut self.scores[emotion.index()];
        *slot = sanitize(*slot + sanitize(probability));
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.scores[emotion.index()]
    }

    /// Iterates `(label, probability)` in enumeration order
    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        Emotion::ALL.iter().map(move |&e| (e, self.get(e)))
    }
}

fn sanitize(probability: f32) -> f32 {
    if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    }
}

/// One face found in a processed frame
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FaceDetection {
    pub bbox: BoundingBox,
    pub landmarks: Vec<Point>,
    pub expressions: ExpressionVector,
}

impl FaceDetection {
    pub fn new(bbox: BoundingBox, expressions: ExpressionVector) -> Self {
        Self {
            bbox,
            landmarks: Vec::new(),
            expressions,
        }
    }

    pub fn with_landmarks(mut self, landmarks: Vec<Point>) -> Self {
        self.landmarks = landmarks;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_parse_with_aliases() {
        assert_eq!(Emotion::from_label("Disgusted"), Some(Emotion::Disgust));
        assert_eq!(Emotion::from_label(" SURPRISE "), Some(Emotion::Surprised));
        assert_eq!(Emotion::from_label("fearful"), None);
    }

    #[test]
    fn expression_vector_ignores_unknown_and_clamps() {
        let v = ExpressionVector::from_pairs([
            ("happy", 0.7),
            ("fearful", 0.2),
            ("sad", f32::NAN),
            ("angry", 1.5),
        ]);
        assert_eq!(v.get(Emotion::Happy), 0.7);
        assert_eq!(v.get(Emotion::Sad), 0.0);
        assert_eq!(v.get(Emotion::Angry), 1.0);
        assert_eq!(v.get(Emotion::Neutral), 0.0);
    }

    #[test]
    fn frame_with_truncated_buffer_is_not_decodable() {
        let frame = Frame::new(vec![0; 11], 2, 2);
        assert!(!frame.is_decodable());
        assert!(frame.to_rgb_image().is_none());

        let frame = Frame::new(vec![0; 12], 2, 2);
        assert!(frame.to_rgb_image().is_some());
    }

    #[test]
    fn only_front_facing_is_mirrored() {
        assert!(FacingMode::Front.is_mirrored());
        assert!(!FacingMode::Back.is_mirrored());
        assert_eq!(FacingMode::Front.opposite(), FacingMode::Back);
    }
}
