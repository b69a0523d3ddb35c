//! Integration tests for the radiograph archive over a local directory
//! store: slot assignment, round-trips, lenient listing, and the
//! concurrent-upload index fix.

use std::sync::Arc;

use kneegrade::archive::RadiographArchive;
use kneegrade::error::KneegradeError;
use kneegrade::object_store::{LocalDirStore, ObjectStore};
use kneegrade::study::StudyRecord;
use tempfile::TempDir;

fn test_archive(dir: &TempDir) -> RadiographArchive<LocalDirStore> {
    let store = LocalDirStore::new(dir.path()).unwrap();
    RadiographArchive::new(Arc::new(store))
}

fn sample_record(patient_id: &str, knee_side: &str) -> StudyRecord {
    StudyRecord {
        patient_uid: patient_id.to_string(),
        patient_name: "Ada".to_string(),
        patient_surname: "Rossi".to_string(),
        birthdate: "1961-04-02".to_string(),
        tax_code: "RSSDAA61D42H501X".to_string(),
        address: "Via Roma 1".to_string(),
        postal_code: "00100".to_string(),
        gender: "F".to_string(),
        study_id: "11111111-2222-3333-4444-555555555555".to_string(),
        uploaded_at: "2026-08-07 10:30:00".to_string(),
        predicted_grade: "Grade 2: Mild osteoarthritis".to_string(),
        knee_side: knee_side.to_string(),
        confidence: "0.91".to_string(),
        doctor_name: "Bruno Bianchi".to_string(),
        doctor_uid: "d42".to_string(),
        doctor_code: "MED-7781".to_string(),
    }
}

#[test]
fn test_sequence_indices_are_monotone_without_gaps() {
    let dir = TempDir::new().unwrap();
    let archive = test_archive(&dir);

    assert_eq!(archive.next_sequence_index("p1").unwrap(), 1);

    for expected in 1..=3 {
        let artifacts = archive
            .save_study("p1", b"original", b"overlay", &sample_record("p1", "Left"))
            .unwrap();
        assert_eq!(artifacts.sequence_index, expected);
    }

    assert_eq!(archive.next_sequence_index("p1").unwrap(), 4);
}

#[test]
fn test_patients_have_independent_sequences() {
    let dir = TempDir::new().unwrap();
    let archive = test_archive(&dir);

    archive
        .save_study("p1", b"o", b"g", &sample_record("p1", "Left"))
        .unwrap();
    let artifacts = archive
        .save_study("p2", b"o", b"g", &sample_record("p2", "Right"))
        .unwrap();

    assert_eq!(artifacts.sequence_index, 1);
}

#[test]
fn test_save_and_get_round_trip() {
    let dir = TempDir::new().unwrap();
    let archive = test_archive(&dir);
    let record = sample_record("p1", "Right");

    let artifacts = archive
        .save_study("p1", b"original-bytes", b"overlay-bytes", &record)
        .unwrap();
    assert!(artifacts.original_url.contains("p1/Study1/original_image1.png"));
    assert!(artifacts.overlay_url.contains("p1/Study1/gradcam_image1.png"));
    assert!(artifacts.metadata_url.contains("p1/Study1/info.txt"));

    let stored = archive.get_study("p1", 1).unwrap();
    assert_eq!(stored.sequence_index, 1);
    assert_eq!(stored.record, record);
}

#[test]
fn test_get_study_not_found() {
    let dir = TempDir::new().unwrap();
    let archive = test_archive(&dir);

    match archive.get_study("p1", 99) {
        Err(KneegradeError::StudyNotFound {
            patient_id,
            sequence_index,
        }) => {
            assert_eq!(patient_id, "p1");
            assert_eq!(sequence_index, 99);
        }
        other => panic!("expected StudyNotFound, got {other:?}"),
    }
}

#[test]
fn test_listing_skips_slot_missing_metadata() {
    let dir = TempDir::new().unwrap();
    let archive = test_archive(&dir);

    archive
        .save_study("p1", b"o", b"g", &sample_record("p1", "Left"))
        .unwrap();

    // Simulate an interrupted save: images landed, metadata never did.
    archive
        .store()
        .upload("p1/Study2/original_image2.png", b"o", "image/png")
        .unwrap();
    archive
        .store()
        .upload("p1/Study2/gradcam_image2.png", b"g", "image/png")
        .unwrap();

    let studies = archive.list_studies("p1").unwrap();
    assert_eq!(studies.len(), 1);
    assert_eq!(studies[0].sequence_index, 1);
}

#[test]
fn test_listing_skips_slot_missing_an_image() {
    let dir = TempDir::new().unwrap();
    let archive = test_archive(&dir);

    archive
        .save_study("p1", b"o", b"g", &sample_record("p1", "Left"))
        .unwrap();
    archive
        .save_study("p1", b"o", b"g", &sample_record("p1", "Right"))
        .unwrap();

    std::fs::remove_file(dir.path().join("p1/Study1/gradcam_image1.png")).unwrap();

    let studies = archive.list_studies("p1").unwrap();
    assert_eq!(studies.len(), 1);
    assert_eq!(studies[0].sequence_index, 2);
    assert_eq!(studies[0].record.knee_side, "Right");
}

#[test]
fn test_partial_slot_never_reassigned() {
    let dir = TempDir::new().unwrap();
    let archive = test_archive(&dir);

    // An orphaned partial slot occupies its index for good.
    archive
        .store()
        .upload("p1/Study1/original_image1.png", b"o", "image/png")
        .unwrap();

    let artifacts = archive
        .save_study("p1", b"o", b"g", &sample_record("p1", "Left"))
        .unwrap();
    assert_eq!(artifacts.sequence_index, 2);
}

#[test]
fn test_concurrent_saves_get_distinct_slots() {
    let dir = TempDir::new().unwrap();
    let archive = Arc::new(test_archive(&dir));

    let mut handles = Vec::new();
    for i in 0..4 {
        let archive = Arc::clone(&archive);
        handles.push(std::thread::spawn(move || {
            let side = if i % 2 == 0 { "Left" } else { "Right" };
            archive
                .save_study("p1", b"original", b"overlay", &sample_record("p1", side))
                .unwrap()
                .sequence_index
        }));
    }

    let mut indices: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![1, 2, 3, 4]);

    // No overwrites: every slot is complete and readable.
    let studies = archive.list_studies("p1").unwrap();
    assert_eq!(studies.len(), 4);
}

#[test]
fn test_radiograph_image_gallery_listing() {
    let dir = TempDir::new().unwrap();
    let archive = test_archive(&dir);

    archive
        .save_study("p1", b"o1", b"g1", &sample_record("p1", "Left"))
        .unwrap();
    archive
        .save_study("p1", b"o2", b"g2", &sample_record("p1", "Right"))
        .unwrap();

    let images = archive.list_radiograph_images("p1").unwrap();
    let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "p1/Study1/original_image1.png",
            "p1/Study2/original_image2.png"
        ]
    );
    assert!(images.iter().all(|i| i.url.starts_with("file://")));
}

#[test]
fn test_dataset_contribution_path() {
    let dir = TempDir::new().unwrap();
    let archive = test_archive(&dir);

    let url = archive
        .upload_to_dataset("p1", "Left", "xray.png", b"bytes", "image/png")
        .unwrap();
    assert!(url.ends_with("dataset/p1_Left_xray.png"));

    let url = archive
        .upload_to_dataset("p1", "  ", "xray.png", b"bytes", "image/png")
        .unwrap();
    assert!(url.ends_with("dataset/p1_Unknown_xray.png"));
}
