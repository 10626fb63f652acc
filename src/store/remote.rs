// HTTP backend for a remote capture service

use super::record::{decode_records, encode_record, Capture, CaptureId};
use super::{DeleteOutcome, OwnerId, PersistenceBackend};
use crate::error::{MoodcamError, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

/// Talks to a capture service exposing
/// `GET /captures?ownerId=`, `POST /captures` and `POST /captures/delete`.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }
}

fn remote(err: reqwest::Error) -> MoodcamError {
    MoodcamError::Persistence(format!("capture service: {err}"))
}

#[async_trait]
impl PersistenceBackend for HttpBackend {
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<Capture>> {
        let values: Vec<serde_json::Value> = self
            .client
            .get(self.url("captures"))
            .query(&[("ownerId", owner.to_string())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(remote)?
            .json()
            .await
            .map_err(remote)?;
        debug!("Fetched {} capture record(s) for {}", values.len(), owner);
        Ok(decode_records(values)?.captures)
    }

    async fn create(&self, owner: &OwnerId, capture: Capture) -> Result<Capture> {
        let stored: serde_json::Value = self
            .client
            .post(self.url("captures"))
            .json(&json!({
                "ownerId": owner,
                "capture": encode_record(&capture)?,
            }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(remote)?
            .json()
            .await
            .map_err(remote)?;

        decode_records(vec![stored])?
            .captures
            .pop()
            .ok_or_else(|| {
                MoodcamError::Persistence("capture service returned nothing".to_string())
            })
    }

    async fn delete_by_ids(&self, owner: &OwnerId, ids: &[CaptureId]) -> Result<DeleteOutcome> {
        self.client
            .post(self.url("captures/delete"))
            .json(&json!({
                "ownerId": owner,
                "ids": ids,
            }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(remote)?
            .json()
            .await
            .map_err(remote)
    }
}
