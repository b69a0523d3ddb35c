//! Study metadata schema and the collaborating patient/doctor records.
//!
//! The metadata record is persisted as flat `Key: value` lines. The key set
//! is a fixed schema independent of any display language; the parser is
//! tolerant (unknown keys ignored, missing keys default to empty) while the
//! writer always emits every field.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KneegradeError, Result};

/// Doctor identity snapshot captured at upload time, exactly as the upload
/// form supplies it.
#[derive(Debug, Clone, Deserialize)]
pub struct DoctorInfo {
    pub uid: String,
    pub name: String,
    pub family_name: String,
    #[serde(rename = "doctorID")]
    pub doctor_id: String,
}

impl DoctorInfo {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.name, self.family_name)
    }
}

/// Patient demographic record from the document-store collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientInfo {
    pub name: String,
    pub family_name: String,
    pub birthdate: String,
    pub tax_code: String,
    pub address: String,
    pub cap_code: String,
    pub gender: String,
}

impl PatientInfo {
    /// Names of required fields that are empty, in declaration order.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        let fields: [(&'static str, &str); 7] = [
            ("name", &self.name),
            ("family_name", &self.family_name),
            ("birthdate", &self.birthdate),
            ("tax_code", &self.tax_code),
            ("address", &self.address),
            ("cap_code", &self.cap_code),
            ("gender", &self.gender),
        ];
        for (label, value) in fields {
            if value.trim().is_empty() {
                missing.push(label);
            }
        }
        missing
    }
}

/// Lookup surface for patient demographics.
pub trait PatientDirectory: Send + Sync {
    fn get_patient_information(&self, patient_id: &str) -> Result<PatientInfo>;
}

/// Patient directory backed by a JSON map `{patient_id: PatientInfo}`.
pub struct JsonPatientDirectory {
    patients: HashMap<String, PatientInfo>,
}

impl JsonPatientDirectory {
    pub fn load(path: &Path) -> Result<JsonPatientDirectory> {
        let bytes = std::fs::read(path)?;
        let patients: HashMap<String, PatientInfo> = serde_json::from_slice(&bytes)?;
        Ok(JsonPatientDirectory { patients })
    }

    pub fn from_map(patients: HashMap<String, PatientInfo>) -> JsonPatientDirectory {
        JsonPatientDirectory { patients }
    }
}

impl PatientDirectory for JsonPatientDirectory {
    fn get_patient_information(&self, patient_id: &str) -> Result<PatientInfo> {
        self.patients
            .get(patient_id)
            .cloned()
            .ok_or_else(|| KneegradeError::PatientNotFound(patient_id.to_string()))
    }
}

/// One study's metadata record, as stored in the slot's `info.txt`.
///
/// Every field is a string: the record is a snapshot of what was true at
/// upload time, not a live reference, and round-trips byte-exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StudyRecord {
    pub patient_uid: String,
    pub patient_name: String,
    pub patient_surname: String,
    pub birthdate: String,
    pub tax_code: String,
    pub address: String,
    pub postal_code: String,
    pub gender: String,
    pub study_id: String,
    pub uploaded_at: String,
    pub predicted_grade: String,
    pub knee_side: String,
    pub confidence: String,
    pub doctor_name: String,
    pub doctor_uid: String,
    pub doctor_code: String,
}

const KEY_PATIENT_UID: &str = "Patient UID";
const KEY_PATIENT_NAME: &str = "Patient name";
const KEY_PATIENT_SURNAME: &str = "Patient surname";
const KEY_BIRTHDATE: &str = "Patient birthdate";
const KEY_TAX_CODE: &str = "Patient tax code";
const KEY_ADDRESS: &str = "Patient address";
const KEY_POSTAL_CODE: &str = "Patient postal code";
const KEY_GENDER: &str = "Patient gender";
const KEY_STUDY_ID: &str = "Study ID";
const KEY_UPLOADED_AT: &str = "Upload timestamp";
const KEY_PREDICTED_GRADE: &str = "Predicted grade";
const KEY_KNEE_SIDE: &str = "Knee side";
const KEY_CONFIDENCE: &str = "Confidence";
const KEY_DOCTOR_NAME: &str = "Uploaded by";
const KEY_DOCTOR_UID: &str = "Doctor UID";
const KEY_DOCTOR_CODE: &str = "Doctor code";

impl StudyRecord {
    /// Serialize to the newline-delimited `Key: value` wire format.
    pub fn to_info_text(&self) -> String {
        let mut text = String::new();
        for (key, value) in [
            (KEY_PATIENT_UID, &self.patient_uid),
            (KEY_PATIENT_NAME, &self.patient_name),
            (KEY_PATIENT_SURNAME, &self.patient_surname),
            (KEY_BIRTHDATE, &self.birthdate),
            (KEY_TAX_CODE, &self.tax_code),
            (KEY_ADDRESS, &self.address),
            (KEY_POSTAL_CODE, &self.postal_code),
            (KEY_GENDER, &self.gender),
            (KEY_STUDY_ID, &self.study_id),
            (KEY_UPLOADED_AT, &self.uploaded_at),
            (KEY_PREDICTED_GRADE, &self.predicted_grade),
            (KEY_KNEE_SIDE, &self.knee_side),
            (KEY_CONFIDENCE, &self.confidence),
            (KEY_DOCTOR_NAME, &self.doctor_name),
            (KEY_DOCTOR_UID, &self.doctor_uid),
            (KEY_DOCTOR_CODE, &self.doctor_code),
        ] {
            text.push_str(key);
            text.push_str(": ");
            text.push_str(value);
            text.push('\n');
        }
        text
    }

    /// Parse the wire format. Values split on the first ':' only, so
    /// timestamps survive. Any recognized key may be absent (its field stays
    /// empty); unrecognized keys are ignored.
    pub fn parse_info_text(text: &str) -> StudyRecord {
        let mut record = StudyRecord::default();
        for line in text.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim().to_string();
            match key.trim() {
                KEY_PATIENT_UID => record.patient_uid = value,
                KEY_PATIENT_NAME => record.patient_name = value,
                KEY_PATIENT_SURNAME => record.patient_surname = value,
                KEY_BIRTHDATE => record.birthdate = value,
                KEY_TAX_CODE => record.tax_code = value,
                KEY_ADDRESS => record.address = value,
                KEY_POSTAL_CODE => record.postal_code = value,
                KEY_GENDER => record.gender = value,
                KEY_STUDY_ID => record.study_id = value,
                KEY_UPLOADED_AT => record.uploaded_at = value,
                KEY_PREDICTED_GRADE => record.predicted_grade = value,
                KEY_KNEE_SIDE => record.knee_side = value,
                KEY_CONFIDENCE => record.confidence = value,
                KEY_DOCTOR_NAME => record.doctor_name = value,
                KEY_DOCTOR_UID => record.doctor_uid = value,
                KEY_DOCTOR_CODE => record.doctor_code = value,
                _ => {}
            }
        }
        record
    }
}
