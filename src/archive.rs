//! Per-patient versioned radiograph archive.
//!
//! Each study occupies one slot `{patient_id}/Study{N}/` holding the
//! re-encoded original radiograph, the Grad-CAM overlay, and the metadata
//! record. N is 1-based and never reused. Writes are strict and ordered with
//! the metadata record last, so "info.txt exists" doubles as the slot's
//! completeness marker; reads are lenient and skip incomplete slots.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::error::{KneegradeError, Result};
use crate::object_store::ObjectStore;
use crate::study::StudyRecord;

/// URLs of one saved study's three artifacts plus its assigned slot.
#[derive(Debug, Clone, Serialize)]
pub struct StudyArtifacts {
    pub sequence_index: u32,
    pub original_url: String,
    pub overlay_url: String,
    pub metadata_url: String,
}

/// A stored study read back from the archive.
#[derive(Debug, Clone, Serialize)]
pub struct StoredStudy {
    pub sequence_index: u32,
    pub record: StudyRecord,
}

/// Lightweight gallery entry for one archived original radiograph.
#[derive(Debug, Clone, Serialize)]
pub struct RadiographImage {
    pub name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

pub struct RadiographArchive<S: ObjectStore> {
    store: Arc<S>,
    // Index assignment and the slot writes for one patient must not
    // interleave: the scan-then-write pattern would otherwise let two
    // uploads claim the same slot and silently overwrite each other.
    patient_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn slot_prefix(patient_id: &str, index: u32) -> String {
    format!("{patient_id}/Study{index}")
}

fn original_path(patient_id: &str, index: u32) -> String {
    format!("{}/original_image{index}.png", slot_prefix(patient_id, index))
}

fn overlay_path(patient_id: &str, index: u32) -> String {
    format!("{}/gradcam_image{index}.png", slot_prefix(patient_id, index))
}

fn info_path(patient_id: &str, index: u32) -> String {
    format!("{}/info.txt", slot_prefix(patient_id, index))
}

/// Extract the slot index from a blob name `{patient}/Study{N}/...`.
fn slot_index_of(name: &str) -> Option<u32> {
    let folder = name.split('/').nth(1)?;
    folder.strip_prefix("Study")?.parse().ok()
}

impl<S: ObjectStore> RadiographArchive<S> {
    pub fn new(store: Arc<S>) -> RadiographArchive<S> {
        RadiographArchive {
            store,
            patient_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn patient_lock(&self, patient_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .patient_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(patient_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Distinct slot indices present for a patient, in ascending order.
    /// Partial slots count: an index is considered taken as soon as any of
    /// its objects exists.
    fn slot_indices(&self, patient_id: &str) -> Result<BTreeSet<u32>> {
        let blobs = self.store.list(&format!("{patient_id}/"))?;
        Ok(blobs
            .iter()
            .filter_map(|b| slot_index_of(&b.name))
            .collect())
    }

    /// The next slot a new study for this patient would be assigned.
    ///
    /// Computed as max existing index + 1 under the per-patient lock, so
    /// concurrent uploads for one patient can never both observe the same
    /// value, and gaps left by partial slots are never re-filled.
    pub fn next_sequence_index(&self, patient_id: &str) -> Result<u32> {
        let lock = self.patient_lock(patient_id);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.next_index_locked(patient_id)
    }

    fn next_index_locked(&self, patient_id: &str) -> Result<u32> {
        let max = self.slot_indices(patient_id)?.into_iter().max().unwrap_or(0);
        Ok(max + 1)
    }

    /// Persist a study's three artifacts into the patient's next slot.
    ///
    /// The three uploads have no transaction underneath them; the metadata
    /// record is written last so an interrupted save leaves a slot that
    /// `list_studies` and `get_study` treat as absent. Failures surface to
    /// the caller unchanged, never as partial success.
    pub fn save_study(
        &self,
        patient_id: &str,
        original_png: &[u8],
        overlay_png: &[u8],
        record: &StudyRecord,
    ) -> Result<StudyArtifacts> {
        let lock = self.patient_lock(patient_id);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let index = self.next_index_locked(patient_id)?;

        let original_url =
            self.store
                .upload(&original_path(patient_id, index), original_png, "image/png")?;
        let overlay_url =
            self.store
                .upload(&overlay_path(patient_id, index), overlay_png, "image/png")?;
        let metadata_url = self.store.upload(
            &info_path(patient_id, index),
            record.to_info_text().as_bytes(),
            "text/plain",
        )?;

        info!(
            "Archived study {index} for patient {patient_id} ({} + {} bytes)",
            original_png.len(),
            overlay_png.len()
        );

        Ok(StudyArtifacts {
            sequence_index: index,
            original_url,
            overlay_url,
            metadata_url,
        })
    }

    /// Read back one study's metadata record.
    pub fn get_study(&self, patient_id: &str, sequence_index: u32) -> Result<StoredStudy> {
        let bytes = self
            .store
            .download(&info_path(patient_id, sequence_index))
            .map_err(|e| match e {
                KneegradeError::BlobNotFound(_) => KneegradeError::StudyNotFound {
                    patient_id: patient_id.to_string(),
                    sequence_index,
                },
                other => other,
            })?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(StoredStudy {
            sequence_index,
            record: StudyRecord::parse_info_text(&text),
        })
    }

    /// Enumerate all complete studies for a patient in ascending slot order.
    ///
    /// Lenient read: a slot missing any of its three objects is skipped, so
    /// orphans from interrupted saves never corrupt the listing.
    pub fn list_studies(&self, patient_id: &str) -> Result<Vec<StoredStudy>> {
        let mut studies = Vec::new();
        for index in self.slot_indices(patient_id)? {
            if !self.store.exists(&original_path(patient_id, index))?
                || !self.store.exists(&overlay_path(patient_id, index))?
            {
                debug!("Skipping incomplete slot {index} for patient {patient_id}");
                continue;
            }
            match self.get_study(patient_id, index) {
                Ok(study) => studies.push(study),
                Err(KneegradeError::StudyNotFound { .. }) => {
                    debug!("Skipping slot {index} without metadata for patient {patient_id}");
                }
                Err(e) => {
                    warn!("Failed to read slot {index} for patient {patient_id}: {e}");
                }
            }
        }
        Ok(studies)
    }

    /// Gallery listing: every archived original radiograph image for a
    /// patient, with its URL and storage date.
    pub fn list_radiograph_images(&self, patient_id: &str) -> Result<Vec<RadiographImage>> {
        let blobs = self.store.list(&format!("{patient_id}/"))?;
        Ok(blobs
            .into_iter()
            .filter(|b| b.name.contains("original_image") && b.name.ends_with(".png"))
            .map(|b| RadiographImage {
                name: b.name,
                url: b.url,
                created_at: b.created_at,
            })
            .collect())
    }

    /// Store a caller-contributed image in the shared training dataset area.
    pub fn upload_to_dataset(
        &self,
        patient_id: &str,
        side: &str,
        file_name: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String> {
        let side = if side.trim().is_empty() { "Unknown" } else { side };
        let path = format!("dataset/{patient_id}_{side}_{file_name}");
        self.store.upload(&path, bytes, content_type)
    }
}
