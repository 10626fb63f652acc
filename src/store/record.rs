// Persisted capture records, schema versioning and legacy migration

use crate::emotion::{AggregatedEmotionEntry, EmotionSnapshot, UNKNOWN_LABEL};
use crate::error::{MoodcamError, Result};
use crate::models::Emotion;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Capture identifier: creation time in milliseconds, bumped to stay unique
pub type CaptureId = u64;

/// Version written into every record
pub const SCHEMA_VERSION: u32 = 1;

const PNG_DATA_URL_PREFIX: &str = "data:image/png;base64,";

/// A frozen frame with its emotion snapshot. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capture {
    id: CaptureId,
    #[serde(with = "png_data_url")]
    image: Vec<u8>,
    emotion_snapshot: Option<EmotionSnapshot>,
    dominant_label: String,
    created_at: DateTime<Utc>,
}

impl Capture {
    /// Builds a capture; the dominant label is derived from the snapshot
    pub fn new(
        id: CaptureId,
        image_png: Vec<u8>,
        emotion_snapshot: Option<EmotionSnapshot>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let dominant_label = emotion_snapshot
            .as_ref()
            .map(EmotionSnapshot::dominant_label)
            .unwrap_or_else(|| UNKNOWN_LABEL.to_string());
        Self {
            id,
            image: image_png,
            emotion_snapshot,
            dominant_label,
            created_at,
        }
    }

    pub fn id(&self) -> CaptureId {
        self.id
    }

    /// PNG-encoded still frame
    pub fn image_png(&self) -> &[u8] {
        &self.image
    }

    pub fn emotion_snapshot(&self) -> Option<&EmotionSnapshot> {
        self.emotion_snapshot.as_ref()
    }

    pub fn dominant_label(&self) -> &str {
        &self.dominant_label
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Score for `label`, or `None` when the capture has no snapshot
    pub fn score(&self, label: Emotion) -> Option<f32> {
        self.emotion_snapshot.as_ref().map(|s| s.score(label))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CaptureRecordV1 {
    schema_version: u32,
    #[serde(flatten)]
    capture: Capture,
}

/// Shape written before records were versioned
#[derive(Deserialize)]
struct LegacyCapture {
    #[serde(default)]
    id: Option<u64>,
    image: String,
    #[serde(default)]
    emotion: Option<Vec<LegacyEmotionEntry>>,
}

#[derive(Deserialize)]
struct LegacyEmotionEntry {
    mood: String,
    number: f64,
}

enum StoredCapture {
    Current(Capture),
    Legacy(LegacyCapture),
}

impl StoredCapture {
    /// Picks the shape from `schemaVersion`; only unversioned records are legacy
    fn from_value(value: serde_json::Value) -> Result<Self> {
        let Some(version) = value.get("schemaVersion") else {
            return Ok(Self::Legacy(serde_json::from_value(value)?));
        };
        let version = version.as_u64().ok_or_else(|| {
            MoodcamError::Persistence(format!("schemaVersion must be an integer, got {version}"))
        })?;
        if version > u64::from(SCHEMA_VERSION) {
            return Err(MoodcamError::Persistence(format!(
                "unsupported capture schema version {version}"
            )));
        }
        let record: CaptureRecordV1 = serde_json::from_value(value)?;
        Ok(Self::Current(record.capture))
    }

    fn id(&self) -> Option<CaptureId> {
        match self {
            Self::Current(capture) => Some(capture.id),
            Self::Legacy(legacy) => legacy.id,
        }
    }
}

/// Result of loading raw records
#[derive(Debug)]
pub struct DecodedRecords {
    pub captures: Vec<Capture>,
    /// How many records needed migration; callers may write them back
    pub migrated: usize,
}

/// Serializes a capture in the current schema
pub fn encode_record(capture: &Capture) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(CaptureRecordV1 {
        schema_version: SCHEMA_VERSION,
        capture: capture.clone(),
    })?)
}

/// Decodes raw records, migrating legacy ones.
///
/// Any versioned record that is newer than [`SCHEMA_VERSION`] or does not
/// match the current shape fails the whole batch.
///
/// Legacy records without an id get fresh ids above every existing one, in
/// record order, so the assignment is deterministic.
pub fn decode_records(values: Vec<serde_json::Value>) -> Result<DecodedRecords> {
    let mut stored = Vec::with_capacity(values.len());
    for value in values {
        stored.push(StoredCapture::from_value(value)?);
    }

    let mut next_free = stored
        .iter()
        .filter_map(StoredCapture::id)
        .max()
        .map_or(1, |max| max + 1);

    let mut captures = Vec::with_capacity(stored.len());
    let mut migrated = 0;
    for record in stored {
        match record {
            StoredCapture::Current(capture) => captures.push(capture),
            StoredCapture::Legacy(legacy) => {
                let id = legacy.id.unwrap_or_else(|| {
                    let id = next_free;
                    next_free += 1;
                    id
                });
                captures.push(migrate_legacy(id, legacy)?);
                migrated += 1;
            }
        }
    }

    if migrated > 0 {
        debug!("Migrated {} legacy capture record(s)", migrated);
    }
    Ok(DecodedRecords { captures, migrated })
}

fn migrate_legacy(id: CaptureId, legacy: LegacyCapture) -> Result<Capture> {
    let image = decode_data_url(&legacy.image)?;
    let snapshot = legacy.emotion.map(|entries| {
        EmotionSnapshot::from_entries(entries.into_iter().filter_map(|entry| {
            match Emotion::from_label(&entry.mood) {
                Some(label) => Some(AggregatedEmotionEntry {
                    label,
                    score: entry.number as f32,
                }),
                None => {
                    warn!("Dropping unknown legacy emotion '{}'", entry.mood);
                    None
                }
            }
        }))
    });
    // legacy ids are Date.now() values
    let created_at = i64::try_from(id)
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    Ok(Capture::new(id, image, snapshot, created_at))
}

fn decode_data_url(value: &str) -> Result<Vec<u8>> {
    let payload = match value.split_once(',') {
        Some((header, payload)) if header.starts_with("data:") => payload,
        _ => value,
    };
    STANDARD
        .decode(payload.trim())
        .map_err(|e| MoodcamError::Persistence(format!("capture image is not valid base64: {e}")))
}

mod png_data_url {
    use super::{decode_data_url, PNG_DATA_URL_PREFIX, STANDARD};
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{PNG_DATA_URL_PREFIX}{}", STANDARD.encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        decode_data_url(&value).map_err(serde::de::Error::custom)
    }
}
