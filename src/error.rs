use thiserror::Error;

/// Unified error type for the grading pipeline and archive.
#[derive(Error, Debug)]
pub enum KneegradeError {
    #[error("invalid radiograph image: {0}")]
    Decode(String),

    #[error("model bundle not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("saliency computation failed: {0}")]
    Saliency(String),

    #[error("study not found: patient {patient_id}, index {sequence_index}")]
    StudyNotFound {
        patient_id: String,
        sequence_index: u32,
    },

    #[error("patient not found: {0}")]
    PatientNotFound(String),

    #[error("blob not found: {0}")]
    BlobNotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse failure category, used by transport glue to pick a status code
/// (400 / 404 / 500) without this crate depending on any web framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or missing caller input; reject before model/storage work.
    InvalidInput,
    /// A referenced patient, study, or blob does not exist.
    NotFound,
    /// Model, storage, or other internal failure.
    Internal,
}

impl KneegradeError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            KneegradeError::Decode(_) | KneegradeError::InvalidInput(_) => {
                ErrorCategory::InvalidInput
            }
            KneegradeError::StudyNotFound { .. }
            | KneegradeError::PatientNotFound(_)
            | KneegradeError::BlobNotFound(_) => ErrorCategory::NotFound,
            _ => ErrorCategory::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, KneegradeError>;
