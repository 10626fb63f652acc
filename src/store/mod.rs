// Capture store: freezes a frame with its emotion snapshot and persists it per owner

mod local;
mod record;
#[cfg(feature = "remote")]
mod remote;

pub use local::JsonFileBackend;
pub use record::{
    decode_records, encode_record, Capture, CaptureId, DecodedRecords, SCHEMA_VERSION,
};
#[cfg(feature = "remote")]
pub use remote::HttpBackend;

use crate::emotion::aggregate;
use crate::error::{MoodcamError, Result};
use crate::models::{ExpressionVector, Frame};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

const OWNER_ID_FILE: &str = "owner_id";

/// Anonymous per-installation identifier partitioning stored captures
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Reads `<data_dir>/owner_id`, creating it on first use
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(OWNER_ID_FILE);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let uuid = Uuid::parse_str(raw.trim()).map_err(|e| {
                MoodcamError::Persistence(format!("invalid owner id in {}: {e}", path.display()))
            })?;
            return Ok(Self(uuid));
        }

        std::fs::create_dir_all(data_dir)?;
        let owner = Self::generate();
        std::fs::write(&path, owner.to_string())?;
        info!("Created owner id {} at {}", owner, path.display());
        Ok(owner)
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Response of a bulk delete
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub deleted_count: usize,
    pub message: String,
}

impl DeleteOutcome {
    pub fn new(deleted_count: usize) -> Self {
        Self {
            deleted_count,
            message: format!("Deleted {deleted_count} capture(s)"),
        }
    }
}

/// Storage for captures keyed by owner
#[async_trait]
pub trait PersistenceBackend: Send + Sync {
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Capture>>;

    /// Stores a new capture and returns it as persisted
    async fn create(&self, owner: &OwnerId, capture: Capture) -> Result<Capture>;

    /// Removes the given ids. Ids the owner does not have are ignored.
    async fn delete_by_ids(&self, owner: &OwnerId, ids: &[CaptureId]) -> Result<DeleteOutcome>;
}

/// In-process backend; contents are lost when dropped
#[derive(Default)]
pub struct MemoryBackend {
    captures: Mutex<HashMap<OwnerId, Vec<Capture>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<OwnerId, Vec<Capture>>>> {
        self.captures
            .lock()
            .map_err(|_| MoodcamError::Persistence("capture table poisoned".to_string()))
    }
}

#[async_trait]
impl PersistenceBackend for MemoryBackend {
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Capture>> {
        Ok(self.lock()?.get(owner).cloned().unwrap_or_default())
    }

    async fn create(&self, owner: &OwnerId, capture: Capture) -> Result<Capture> {
        let mut table = self.lock()?;
        let captures = table.entry(*owner).or_default();
        if captures.iter().any(|c| c.id() == capture.id()) {
            return Err(MoodcamError::Persistence(format!(
                "capture {} already exists",
                capture.id()
            )));
        }
        captures.push(capture.clone());
        Ok(capture)
    }

    async fn delete_by_ids(&self, owner: &OwnerId, ids: &[CaptureId]) -> Result<DeleteOutcome> {
        let mut table = self.lock()?;
        let Some(captures) = table.get_mut(owner) else {
            return Ok(DeleteOutcome::new(0));
        };
        let before = captures.len();
        captures.retain(|c| !ids.contains(&c.id()));
        Ok(DeleteOutcome::new(before - captures.len()))
    }
}

/// Hands out strictly increasing capture ids based on wall-clock milliseconds
#[derive(Clone, Copy, Debug, Default)]
pub struct CaptureIdGenerator {
    last: CaptureId,
}

impl CaptureIdGenerator {
    /// Starts above every id in `existing`
    pub fn seeded<'a>(existing: impl IntoIterator<Item = &'a Capture>) -> Self {
        Self {
            last: existing.into_iter().map(Capture::id).max().unwrap_or(0),
        }
    }

    pub fn next_at(&mut self, now: DateTime<Utc>) -> CaptureId {
        let millis = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        let id = millis.max(self.last + 1);
        self.last = id;
        id
    }
}

/// Creates, lists and deletes the current owner's captures
pub struct CaptureStore {
    backend: Arc<dyn PersistenceBackend>,
    owner: OwnerId,
    ids: CaptureIdGenerator,
}

impl CaptureStore {
    /// Opens the store, seeding id generation from what the owner already has
    pub async fn open(backend: Arc<dyn PersistenceBackend>, owner: OwnerId) -> Result<Self> {
        let existing = backend.list_by_owner(&owner).await?;
        debug!("Capture store opened for {} with {} capture(s)", owner, existing.len());
        Ok(Self {
            ids: CaptureIdGenerator::seeded(&existing),
            backend,
            owner,
        })
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Freezes `frame` together with the live expression vectors.
    ///
    /// No faces means no snapshot and an "Unknown" dominant label. A frame
    /// that cannot be encoded fails with `CaptureNotReady` and stores nothing.
    pub async fn capture(&mut self, frame: &Frame, live: &[ExpressionVector]) -> Result<Capture> {
        let image = encode_png(frame)?;
        let snapshot = (!live.is_empty()).then(|| aggregate(live));
        let created_at = Utc::now();
        let capture = Capture::new(self.ids.next_at(created_at), image, snapshot, created_at);

        let stored = self.backend.create(&self.owner, capture).await?;
        info!(
            "Captured {} ({} face(s), dominant {})",
            stored.id(),
            live.len(),
            stored.dominant_label()
        );
        Ok(stored)
    }

    pub async fn list(&self) -> Result<Vec<Capture>> {
        self.backend.list_by_owner(&self.owner).await
    }

    pub async fn delete(&self, ids: &[CaptureId]) -> Result<DeleteOutcome> {
        let outcome = self.backend.delete_by_ids(&self.owner, ids).await?;
        if outcome.deleted_count != ids.len() {
            warn!(
                "Asked to delete {} capture(s), backend removed {}",
                ids.len(),
                outcome.deleted_count
            );
        }
        Ok(outcome)
    }
}

fn encode_png(frame: &Frame) -> Result<Vec<u8>> {
    let image = frame.to_rgb_image().ok_or_else(|| {
        MoodcamError::CaptureNotReady(format!(
            "frame {}x{} has no decodable pixels",
            frame.width, frame.height
        ))
    })?;
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ids_increase_even_within_one_millisecond() {
        let now = Utc.timestamp_millis_opt(1_000).unwrap();
        let mut ids = CaptureIdGenerator::default();
        assert_eq!(ids.next_at(now), 1_000);
        assert_eq!(ids.next_at(now), 1_001);
        assert_eq!(ids.next_at(Utc.timestamp_millis_opt(999).unwrap()), 1_002);
        assert_eq!(ids.next_at(Utc.timestamp_millis_opt(5_000).unwrap()), 5_000);
    }

    #[test]
    fn seeded_generator_starts_above_existing() {
        let existing = vec![Capture::new(9_000, vec![], None, Utc::now())];
        let mut ids = CaptureIdGenerator::seeded(&existing);
        assert_eq!(ids.next_at(Utc.timestamp_millis_opt(10).unwrap()), 9_001);
    }

    #[tokio::test]
    async fn memory_backend_partitions_by_owner() {
        let backend = MemoryBackend::new();
        let (alice, bob) = (OwnerId::generate(), OwnerId::generate());
        backend
            .create(&alice, Capture::new(1, vec![], None, Utc::now()))
            .await
            .unwrap();

        assert_eq!(backend.list_by_owner(&alice).await.unwrap().len(), 1);
        assert!(backend.list_by_owner(&bob).await.unwrap().is_empty());
        assert_eq!(backend.delete_by_ids(&bob, &[1]).await.unwrap().deleted_count, 0);
        assert_eq!(backend.delete_by_ids(&alice, &[1, 2]).await.unwrap().deleted_count, 1);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let backend = MemoryBackend::new();
        let owner = OwnerId::generate();
        backend
            .create(&owner, Capture::new(1, vec![], None, Utc::now()))
            .await
            .unwrap();
        assert!(matches!(
            backend.create(&owner, Capture::new(1, vec![], None, Utc::now())).await,
            Err(MoodcamError::Persistence(_))
        ));
    }

    #[test]
    fn owner_id_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let first = OwnerId::load_or_create(dir.path()).unwrap();
        let second = OwnerId::load_or_create(dir.path()).unwrap();
        assert_eq!(first, second);
    }
}
