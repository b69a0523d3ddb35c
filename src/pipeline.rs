//! End-to-end prediction: preprocess an uploaded radiograph, classify it,
//! render the Grad-CAM overlay, and archive the study.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

use crate::archive::RadiographArchive;
use crate::classifier::{argmax_confidence, Classifier};
use crate::color_utils::symbols;
use crate::error::{KneegradeError, Result};
use crate::gradcam::gradcam_heatmap;
use crate::object_store::ObjectStore;
use crate::overlay::{encode_png_rgb, render_overlay};
use crate::preprocessing::{encode_png_gray, preprocess_radiograph};
use crate::severity::SeverityGrade;
use crate::study::{DoctorInfo, PatientDirectory, StudyRecord};

/// One upload to classify and archive.
pub struct PredictionRequest {
    pub patient_id: String,
    pub knee_side: String,
    pub doctor: DoctorInfo,
    pub image_bytes: Vec<u8>,
}

/// Fully-populated success payload. Operations either return this or an
/// error; there is no partially-filled success.
#[derive(Debug, Clone, Serialize)]
pub struct PredictionOutcome {
    pub predicted_class: String,
    pub confidence: f32,
    pub sequence_index: u32,
    pub study_id: String,
    pub original_image_url: String,
    pub gradcam_image_url: String,
    pub info_url: String,
}

/// The assembled prediction service: classifier, archive, and patient
/// directory wired together once at startup.
pub struct PredictionPipeline<S: ObjectStore> {
    classifier: Arc<Classifier>,
    archive: RadiographArchive<S>,
    patients: Arc<dyn PatientDirectory>,
}

impl<S: ObjectStore> PredictionPipeline<S> {
    pub fn new(
        classifier: Arc<Classifier>,
        archive: RadiographArchive<S>,
        patients: Arc<dyn PatientDirectory>,
    ) -> PredictionPipeline<S> {
        PredictionPipeline {
            classifier,
            archive,
            patients,
        }
    }

    pub fn archive(&self) -> &RadiographArchive<S> {
        &self.archive
    }

    /// Run the full pipeline for one upload.
    ///
    /// Input validation (form fields, image decode, patient record
    /// completeness) happens before any model or storage work.
    pub fn run(&self, request: &PredictionRequest) -> Result<PredictionOutcome> {
        let processing_start = Instant::now();

        if request.patient_id.trim().is_empty() {
            return Err(KneegradeError::InvalidInput("missing patient id".into()));
        }
        if request.knee_side.trim().is_empty() {
            return Err(KneegradeError::InvalidInput("missing knee side".into()));
        }

        let pre = preprocess_radiograph(&request.image_bytes)?;

        let patient = self.patients.get_patient_information(&request.patient_id)?;
        let missing = patient.missing_fields();
        if !missing.is_empty() {
            return Err(KneegradeError::InvalidInput(format!(
                "missing patient information: {}",
                missing.join(", ")
            )));
        }

        let pass = self.classifier.forward(&pre.tensor)?;
        let (class_index, confidence) = argmax_confidence(&pass.probabilities.view());
        let grade = SeverityGrade::from_index(class_index).ok_or_else(|| {
            KneegradeError::Internal(format!("classifier produced class index {class_index}"))
        })?;
        debug!(
            "{} Predicted {} ({confidence:.4})",
            symbols::checking(),
            grade.label()
        );

        let heatmap = gradcam_heatmap(
            &pass.features,
            self.classifier.head(),
            &pass.probabilities.view(),
            class_index,
        )?;
        let overlay_image = render_overlay(&heatmap, &pre.display)?;
        let overlay_png = encode_png_rgb(&overlay_image)?;
        let original_png = encode_png_gray(&pre.source_gray)?;

        let record = StudyRecord {
            patient_uid: request.patient_id.clone(),
            patient_name: patient.name.clone(),
            patient_surname: patient.family_name.clone(),
            birthdate: patient.birthdate.clone(),
            tax_code: patient.tax_code.clone(),
            address: patient.address.clone(),
            postal_code: patient.cap_code.clone(),
            gender: patient.gender.clone(),
            study_id: Uuid::new_v4().to_string(),
            uploaded_at: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            predicted_grade: grade.label().to_string(),
            knee_side: request.knee_side.clone(),
            confidence: format!("{confidence:.2}"),
            doctor_name: request.doctor.display_name(),
            doctor_uid: request.doctor.uid.clone(),
            doctor_code: request.doctor.doctor_id.clone(),
        };

        let artifacts =
            self.archive
                .save_study(&request.patient_id, &original_png, &overlay_png, &record)?;

        info!(
            "{} Study {} for patient {} graded as '{}' in {:.1}ms",
            symbols::completed_successfully(),
            artifacts.sequence_index,
            request.patient_id,
            grade.label(),
            processing_start.elapsed().as_secs_f64() * 1000.0
        );

        Ok(PredictionOutcome {
            predicted_class: grade.label().to_string(),
            confidence,
            sequence_index: artifacts.sequence_index,
            study_id: record.study_id,
            original_image_url: artifacts.original_url,
            gradcam_image_url: artifacts.overlay_url,
            info_url: artifacts.metadata_url,
        })
    }
}
