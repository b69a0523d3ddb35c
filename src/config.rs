//! Configuration layer separating CLI arguments from internal pipeline
//! configuration.
//!
//! CLI structs own argument parsing, help text, and validation; the internal
//! config structs carry only what the pipeline needs. Conversion happens in
//! one place per command via `from_args`.

use std::path::PathBuf;

use clap::Parser;
use clap_verbosity_flag::Verbosity;

use crate::error::{KneegradeError, Result};
use crate::study::DoctorInfo;

/// Environment variable overriding the model bundle directory.
pub const MODEL_DIR_ENV: &str = "KNEEGRADE_MODEL_DIR";

/// Global CLI arguments shared by all kneegrade commands.
#[derive(Parser, Debug, Clone)]
pub struct GlobalArgs {
    /// Root directory of the radiograph archive
    #[arg(long, default_value = "archive", global = true)]
    pub archive_dir: String,

    /// Directory containing the model bundle (backbone.onnx + head.json).
    /// Falls back to the KNEEGRADE_MODEL_DIR environment variable.
    #[arg(long, global = true)]
    pub model_dir: Option<String>,

    /// Verbosity level (-q/--quiet, -v/-vv/-vvv/-vvvv for info/debug/trace)
    #[command(flatten)]
    pub verbosity: Verbosity,

    /// Disable colored output (also respects NO_COLOR and KNEEGRADE_NO_COLOR env vars)
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// CLI command for grading one radiograph upload.
#[derive(Parser, Debug, Clone)]
pub struct PredictCommand {
    /// Path to the radiograph image to grade
    #[arg(value_name = "IMAGE")]
    pub image: String,

    /// Patient identifier
    #[arg(long)]
    pub patient: String,

    /// Which knee the radiograph shows (e.g. Left, Right)
    #[arg(long)]
    pub side: String,

    /// Uploading doctor as inline JSON ({"uid":...,"name":...,"family_name":...,"doctorID":...})
    /// or a path to a JSON file with the same shape
    #[arg(long)]
    pub doctor: String,

    /// Path to the patient directory JSON file ({patient_id: {name, ...}})
    #[arg(long)]
    pub patients_file: String,
}

/// CLI command for listing a patient's archived studies.
#[derive(Parser, Debug, Clone)]
pub struct StudiesCommand {
    /// Patient identifier
    #[arg(long)]
    pub patient: String,
}

/// CLI command for fetching one study's metadata record.
#[derive(Parser, Debug, Clone)]
pub struct InfoCommand {
    /// Patient identifier
    #[arg(long)]
    pub patient: String,

    /// 1-based study sequence index
    #[arg(long)]
    pub index: u32,
}

/// CLI command for contributing an image to the training dataset area.
#[derive(Parser, Debug, Clone)]
pub struct DatasetAddCommand {
    /// Path to the image to contribute
    #[arg(value_name = "IMAGE")]
    pub image: String,

    /// Patient identifier
    #[arg(long)]
    pub patient: String,

    /// Which knee the image shows
    #[arg(long, default_value = "Unknown")]
    pub side: String,
}

/// Internal configuration for the predict command.
#[derive(Debug, Clone)]
pub struct PredictConfig {
    pub image: PathBuf,
    pub patient_id: String,
    pub knee_side: String,
    pub doctor: DoctorInfo,
    pub patients_file: PathBuf,
    pub archive_dir: PathBuf,
    pub model_dir: PathBuf,
}

impl PredictConfig {
    pub fn from_args(global: GlobalArgs, cmd: PredictCommand) -> Result<PredictConfig> {
        Ok(PredictConfig {
            image: PathBuf::from(cmd.image),
            patient_id: cmd.patient,
            knee_side: cmd.side,
            doctor: parse_doctor_arg(&cmd.doctor)?,
            patients_file: PathBuf::from(cmd.patients_file),
            archive_dir: PathBuf::from(global.archive_dir),
            model_dir: resolve_model_dir(global.model_dir)?,
        })
    }
}

/// Parse the --doctor argument: inline JSON when it looks like an object,
/// otherwise a path to a JSON file.
pub fn parse_doctor_arg(value: &str) -> Result<DoctorInfo> {
    let json = if value.trim_start().starts_with('{') {
        value.to_string()
    } else {
        std::fs::read_to_string(value).map_err(|e| {
            KneegradeError::InvalidInput(format!("cannot read doctor file {value}: {e}"))
        })?
    };
    serde_json::from_str(&json)
        .map_err(|e| KneegradeError::InvalidInput(format!("invalid doctor info: {e}")))
}

/// Resolve the model bundle directory: CLI argument first, then the
/// environment variable. Failing both is a startup error, not a
/// per-request one.
pub fn resolve_model_dir(cli_value: Option<String>) -> Result<PathBuf> {
    if let Some(dir) = cli_value {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(dir) = std::env::var(MODEL_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    Err(KneegradeError::ModelNotLoaded(format!(
        "no model directory configured (pass --model-dir or set {MODEL_DIR_ENV})"
    )))
}
