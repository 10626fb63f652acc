// JSON file backend: one array of records per owner

use super::record::{decode_records, encode_record, Capture, CaptureId};
use super::{DeleteOutcome, OwnerId, PersistenceBackend};
use crate::error::{MoodcamError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Stores each owner's captures in `<root>/<owner>.json`.
///
/// Writes go through a temporary file and a rename so a crash never leaves a
/// half-written array behind.
pub struct JsonFileBackend {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, owner: &OwnerId) -> PathBuf {
        self.root.join(format!("{owner}.json"))
    }

    fn read_all(path: &Path) -> Result<(Vec<Capture>, usize)> {
        if !path.exists() {
            return Ok((Vec::new(), 0));
        }
        let raw = std::fs::read_to_string(path).map_err(|e| persistence(path, e))?;
        if raw.trim().is_empty() {
            return Ok((Vec::new(), 0));
        }
        let values: Vec<serde_json::Value> = serde_json::from_str(&raw)?;
        let decoded = decode_records(values)?;
        Ok((decoded.captures, decoded.migrated))
    }

    fn write_all(path: &Path, captures: &[Capture]) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| persistence(parent, e))?;
        }
        let records = captures
            .iter()
            .map(encode_record)
            .collect::<Result<Vec<_>>>()?;
        let body = serde_json::to_vec_pretty(&records)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, body).map_err(|e| persistence(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| persistence(path, e))?;
        debug!("Wrote {} capture(s) to {}", captures.len(), path.display());
        Ok(())
    }
}

fn persistence(path: &Path, err: std::io::Error) -> MoodcamError {
    MoodcamError::Persistence(format!("{}: {err}", path.display()))
}

#[async_trait]
impl PersistenceBackend for JsonFileBackend {
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Capture>> {
        let path = self.path_for(owner);
        let (captures, migrated) = Self::read_all(&path)?;
        if migrated > 0 {
            let _guard = self.write_lock.lock().await;
            Self::write_all(&path, &captures)?;
            info!("Rewrote {} with {} migrated record(s)", path.display(), migrated);
        }
        Ok(captures)
    }

    async fn create(&self, owner: &OwnerId, capture: Capture) -> Result<Capture> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(owner);
        let (mut captures, _) = Self::read_all(&path)?;
        if captures.iter().any(|c| c.id() == capture.id()) {
            return Err(MoodcamError::Persistence(format!(
                "capture {} already exists",
                capture.id()
            )));
        }
        captures.push(capture.clone());
        Self::write_all(&path, &captures)?;
        Ok(capture)
    }

    async fn delete_by_ids(&self, owner: &OwnerId, ids: &[CaptureId]) -> Result<DeleteOutcome> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(owner);
        let (mut captures, _) = Self::read_all(&path)?;
        let before = captures.len();
        captures.retain(|c| !ids.contains(&c.id()));
        let deleted = before - captures.len();
        if deleted > 0 {
            Self::write_all(&path, &captures)?;
        }
        Ok(DeleteOutcome::new(deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn captures_survive_a_new_backend_instance() {
        let dir = tempfile::tempdir().unwrap();
        let owner = OwnerId::generate();

        let backend = JsonFileBackend::new(dir.path());
        backend
            .create(&owner, Capture::new(3, vec![7, 7], None, Utc::now()))
            .await
            .unwrap();

        let reopened = JsonFileBackend::new(dir.path());
        let captures = reopened.list_by_owner(&owner).await.unwrap();
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].image_png(), &[7, 7]);
        assert!(!dir.path().join(format!("{owner}.json.tmp")).exists());
    }

    #[tokio::test]
    async fn corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let owner = OwnerId::generate();
        std::fs::write(dir.path().join(format!("{owner}.json")), "{not json").unwrap();

        let backend = JsonFileBackend::new(dir.path());
        assert!(matches!(
            backend.list_by_owner(&owner).await,
            Err(MoodcamError::Persistence(_))
        ));
    }

    #[tokio::test]
    async fn newer_records_are_left_on_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let owner = OwnerId::generate();
        let path = dir.path().join(format!("{owner}.json"));
        let body = r#"[
            {"image": "data:image/png;base64,AQID", "emotion": null},
            {"schemaVersion": 2, "id": 9, "image": "data:image/png;base64,AQID",
             "emotionSnapshot": null, "dominantLabel": "Unknown",
             "capturedAt": "2024-01-01T00:00:00Z"}
        ]"#;
        std::fs::write(&path, body).unwrap();

        let backend = JsonFileBackend::new(dir.path());
        assert!(matches!(
            backend.list_by_owner(&owner).await,
            Err(MoodcamError::Persistence(_))
        ));
        assert!(backend
            .create(&owner, Capture::new(10, vec![1], None, Utc::now()))
            .await
            .is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), body);
    }
}
