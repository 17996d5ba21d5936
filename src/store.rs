//! Append-only slip log with best-effort upload to the gallery's record
//! store.
//!
//! Every slip becomes `<uuid>.json` (and optionally `<uuid>.png`) under the
//! output directory. Files are never rewritten except to flip `uploaded`
//! after the record store confirms the row. Slips that could not be uploaded
//! stay pending and are retried at the start of later cycles.

use crate::composer::{ComposerError, Raster};
use crate::slip::SlipRecord;

use log::{debug, info, warn};
use std::{
    error::Error,
    fmt, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Json(serde_json::Error),
    Png(ComposerError),
    /// The record store answered, but not with success.
    Upload(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "slip store io error: {}", e),
            StoreError::Json(e) => write!(f, "slip record serialization error: {}", e),
            StoreError::Png(e) => write!(f, "figurine bitmap error: {}", e),
            StoreError::Upload(why) => write!(f, "slip upload failed: {}", why),
        }
    }
}

impl Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        StoreError::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Json(value)
    }
}

impl From<ComposerError> for StoreError {
    fn from(value: ComposerError) -> Self {
        StoreError::Png(value)
    }
}

struct Uploader {
    http: reqwest::blocking::Client,
    url: String,
    key: Option<String>,
}

pub struct SlipStore {
    dir: PathBuf,
    uploader: Option<Uploader>,
}

impl SlipStore {
    /// `output_dir` is created if needed. Without a record-store URL the
    /// store runs offline: slips persist locally and uploads are skipped.
    pub fn new(
        output_dir: &Path,
        record_store_url: Option<String>,
        record_store_key: Option<String>,
    ) -> Result<Self, StoreError> {
        let dir = output_dir.join("slips");
        fs::create_dir_all(&dir)?;

        let uploader = record_store_url.map(|url| Uploader {
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            url,
            key: record_store_key,
        });
        if uploader.is_none() {
            info!("record store not configured, slips stay local");
        }

        Ok(SlipStore { dir, uploader })
    }

    fn record_path(&self, record: &SlipRecord) -> PathBuf {
        self.dir.join(format!("{}.json", record.slip_uuid))
    }

    /// Append the slip to the log, with its figurine bitmap if provided.
    pub fn persist(
        &self,
        record: &SlipRecord,
        figurine: Option<&Raster>,
    ) -> Result<PathBuf, StoreError> {
        let path = self.record_path(record);
        fs::write(&path, serde_json::to_vec_pretty(record)?)?;
        if let Some(raster) = figurine {
            raster.save_png(&self.dir.join(format!("{}.png", record.slip_uuid)))?;
        }
        debug!("slip {} persisted", record.slip_uuid);
        Ok(path)
    }

    /// Flip `uploaded` on the in-memory record and rewrite its file. The
    /// flag is the only field that ever changes on disk.
    fn mark_uploaded(&self, record: &mut SlipRecord) -> Result<(), StoreError> {
        record.uploaded = true;
        fs::write(self.record_path(record), serde_json::to_vec_pretty(record)?)?;
        Ok(())
    }

    /// Push one slip to the record store. `Ok(false)` means the store is
    /// offline and the slip stays pending.
    pub fn upload(&self, record: &SlipRecord) -> Result<bool, StoreError> {
        let uploader = match &self.uploader {
            Some(u) => u,
            None => return Ok(false),
        };

        let row = serde_json::json!({
            "data_id": record.slip_uuid,
            "figure_id": record.figurine_id,
            "title": record.title,
            "paragraph1": record.paragraph1,
            "paragraph2": record.paragraph2,
            "resource_tools": record.resources_tools,
            "resource_places": record.resources_places,
            "resource_programs": record.resources_programs,
            "used_fallback": record.used_fallback,
            "printed": record.printed,
            "generated_at": record.generated_at,
        });

        let mut request = uploader
            .http
            .post(&uploader.url)
            .header("Idempotency-Key", record.slip_uuid.to_string())
            .json(&row);
        if let Some(key) = &uploader.key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .map_err(|e| StoreError::Upload(e.to_string()))?;
        if !response.status().is_success() {
            return Err(StoreError::Upload(format!("http {}", response.status())));
        }
        Ok(true)
    }

    /// Persist, then try the upload once, flipping the flag on success.
    /// Upload trouble is logged, never fatal.
    pub fn persist_and_upload(
        &self,
        record: &mut SlipRecord,
        figurine: Option<&Raster>,
    ) -> Result<(), StoreError> {
        self.persist(record, figurine)?;
        match self.upload(record) {
            Ok(true) => self.mark_uploaded(record),
            Ok(false) => Ok(()),
            Err(e) => {
                warn!("slip {} stays pending: {}", record.slip_uuid, e);
                Ok(())
            }
        }
    }

    /// All slips still waiting for upload, oldest first.
    pub fn pending(&self) -> Vec<SlipRecord> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut pending: Vec<SlipRecord> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| {
                let raw = fs::read_to_string(e.path()).ok()?;
                serde_json::from_str::<SlipRecord>(&raw).ok()
            })
            .filter(|record| !record.uploaded)
            .collect();
        pending.sort_by_key(|record| record.generated_at);
        pending
    }

    /// Retry pending uploads, at most `limit` per pass so a long outage
    /// cannot stall the next visitor. Returns how many went through.
    pub fn flush_pending(&self, limit: usize) -> usize {
        if self.uploader.is_none() {
            return 0;
        }
        let mut flushed = 0;
        for mut record in self.pending().into_iter().take(limit) {
            match self.upload(&record) {
                Ok(true) => match self.mark_uploaded(&mut record) {
                    Ok(()) => flushed += 1,
                    Err(e) => warn!("uploaded but could not mark {}: {}", record.slip_uuid, e),
                },
                Ok(false) => break,
                Err(e) => {
                    debug!("pending slip {} still failing: {}", record.slip_uuid, e);
                }
            }
        }
        if flushed > 0 {
            info!("flushed {} pending slip(s)", flushed);
        }
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::Raster;
    use chrono::Utc;
    use uuid::Uuid;

    fn record(uploaded: bool) -> SlipRecord {
        SlipRecord {
            slip_uuid: Uuid::new_v4(),
            figurine_id: 1,
            answer_indices: [0; 6],
            title: "Titel".into(),
            paragraph1: "Eins.".into(),
            paragraph2: "Zwei.".into(),
            resources_tools: String::new(),
            resources_places: String::new(),
            resources_programs: String::new(),
            used_fallback: false,
            printed: true,
            generated_at: Utc::now(),
            uploaded,
        }
    }

    fn offline_store(dir: &tempfile::TempDir) -> SlipStore {
        SlipStore::new(dir.path(), None, None).unwrap()
    }

    #[test]
    fn persist_writes_json_and_png() {
        let dir = tempfile::tempdir().unwrap();
        let store = offline_store(&dir);
        let r = record(false);
        let raster = Raster::new(64, 64);

        let path = store.persist(&r, Some(&raster)).unwrap();
        assert!(path.exists());
        assert!(dir
            .path()
            .join("slips")
            .join(format!("{}.png", r.slip_uuid))
            .exists());

        let read: SlipRecord =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, r);
    }

    #[test]
    fn mark_uploaded_flips_only_that_flag() {
        let dir = tempfile::tempdir().unwrap();
        let store = offline_store(&dir);
        let mut r = record(false);
        store.persist(&r, None).unwrap();

        let before: SlipRecord = serde_json::from_str(
            &fs::read_to_string(store.record_path(&r)).unwrap(),
        )
        .unwrap();
        store.mark_uploaded(&mut r).unwrap();
        let after: SlipRecord = serde_json::from_str(
            &fs::read_to_string(store.record_path(&r)).unwrap(),
        )
        .unwrap();

        assert!(!before.uploaded);
        assert!(after.uploaded);
        assert_eq!(
            SlipRecord {
                uploaded: false,
                ..after
            },
            before
        );
    }

    #[test]
    fn pending_lists_only_unuploaded_slips_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = offline_store(&dir);

        let mut old = record(false);
        old.generated_at = Utc::now() - chrono::Duration::hours(2);
        let fresh = record(false);
        let done = record(true);
        store.persist(&old, None).unwrap();
        store.persist(&fresh, None).unwrap();
        store.persist(&done, None).unwrap();

        let pending = store.pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].slip_uuid, old.slip_uuid);
        assert_eq!(pending[1].slip_uuid, fresh.slip_uuid);
    }

    #[test]
    fn offline_store_skips_upload_and_keeps_slips_pending() {
        let dir = tempfile::tempdir().unwrap();
        let store = offline_store(&dir);
        let mut r = record(false);

        store.persist_and_upload(&mut r, None).unwrap();
        assert!(!r.uploaded);
        assert_eq!(store.flush_pending(10), 0);
        assert_eq!(store.pending().len(), 1);
    }

    #[test]
    fn unreachable_record_store_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SlipStore::new(
            dir.path(),
            Some("http://127.0.0.1:9/slips".into()),
            Some("key".into()),
        )
        .unwrap();
        let mut r = record(false);

        store.persist_and_upload(&mut r, None).unwrap();
        assert!(!r.uploaded);
        assert_eq!(store.pending().len(), 1);
        assert_eq!(store.flush_pending(10), 0);
    }
}
