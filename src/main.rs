use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use colored::*;
use env_logger::{Builder, Env};
use log::{error, info, Level};
use std::io::Write;

use kneegrade::archive::RadiographArchive;
use kneegrade::classifier::Classifier;
use kneegrade::color_utils::init_color_config;
use kneegrade::config::{
    DatasetAddCommand, GlobalArgs, InfoCommand, PredictCommand, PredictConfig, StudiesCommand,
};
use kneegrade::object_store::LocalDirStore;
use kneegrade::pipeline::{PredictionPipeline, PredictionRequest};
use kneegrade::study::JsonPatientDirectory;

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Grade a knee radiograph and archive the study
    Predict(PredictCommand),

    /// List a patient's archived studies
    Studies(StudiesCommand),

    /// Show one study's metadata record
    Info(InfoCommand),

    /// Contribute an image to the training dataset area
    DatasetAdd(DatasetAddCommand),

    /// Show version information
    Version,
}

#[derive(Parser)]
#[command(name = "kneegrade")]
#[command(about = "Knee osteoarthritis grading and radiograph archiving")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn get_log_level_from_verbosity(
    verbosity: clap_verbosity_flag::Verbosity<clap_verbosity_flag::ErrorLevel>,
) -> log::LevelFilter {
    let base_level = verbosity.log_level_filter();
    let adjusted_level = match base_level {
        log::LevelFilter::Off => log::LevelFilter::Off,
        log::LevelFilter::Error => log::LevelFilter::Warn,
        log::LevelFilter::Warn => log::LevelFilter::Info,
        log::LevelFilter::Info => log::LevelFilter::Debug,
        log::LevelFilter::Debug => log::LevelFilter::Trace,
        log::LevelFilter::Trace => log::LevelFilter::Trace,
    };

    if verbosity.is_silent() {
        log::LevelFilter::Error
    } else {
        adjusted_level
    }
}

fn run_predict(global: GlobalArgs, cmd: PredictCommand) -> Result<()> {
    let config = PredictConfig::from_args(global, cmd)?;

    let classifier = Arc::new(Classifier::load_from_dir(&config.model_dir)?);
    let store = Arc::new(LocalDirStore::new(&config.archive_dir)?);
    let archive = RadiographArchive::new(store);
    let patients = Arc::new(JsonPatientDirectory::load(&config.patients_file)?);

    let pipeline = PredictionPipeline::new(classifier, archive, patients);

    let image_bytes = std::fs::read(&config.image)?;
    let request = PredictionRequest {
        patient_id: config.patient_id,
        knee_side: config.knee_side,
        doctor: config.doctor,
        image_bytes,
    };

    let outcome = pipeline.run(&request)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn run_studies(global: GlobalArgs, cmd: StudiesCommand) -> Result<()> {
    let store = Arc::new(LocalDirStore::new(&global.archive_dir)?);
    let archive = RadiographArchive::new(store);

    let studies = archive.list_studies(&cmd.patient)?;
    info!("Found {} complete studies for {}", studies.len(), cmd.patient);
    println!("{}", serde_json::to_string_pretty(&studies)?);
    Ok(())
}

fn run_info(global: GlobalArgs, cmd: InfoCommand) -> Result<()> {
    let store = Arc::new(LocalDirStore::new(&global.archive_dir)?);
    let archive = RadiographArchive::new(store);

    let study = archive.get_study(&cmd.patient, cmd.index)?;
    println!("{}", serde_json::to_string_pretty(&study)?);
    Ok(())
}

fn run_dataset_add(global: GlobalArgs, cmd: DatasetAddCommand) -> Result<()> {
    let store = Arc::new(LocalDirStore::new(&global.archive_dir)?);
    let archive = RadiographArchive::new(store);

    let path = std::path::Path::new(&cmd.image);
    let bytes = std::fs::read(path)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.png".to_string());
    let content_type = match path.extension().map(|e| e.to_string_lossy().to_lowercase()) {
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    };

    let url = archive.upload_to_dataset(&cmd.patient, &cmd.side, &file_name, &bytes, content_type)?;
    println!("{url}");
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    init_color_config(cli.global.no_color);

    // If user didn't pass -v/-q and RUST_LOG is set, honor the env var.
    let use_env = !cli.global.verbosity.is_present() && std::env::var_os("RUST_LOG").is_some();

    let mut logger = if use_env {
        Builder::from_env(Env::default())
    } else {
        let level_filter = get_log_level_from_verbosity(cli.global.verbosity.clone());

        let mut b = Builder::new();
        b.filter_level(level_filter);
        b
    };

    logger
        .format(|buf, record| {
            let level_str = match record.level() {
                Level::Error => "ERROR".red().bold().to_string(),
                Level::Warn => "WARN".yellow().to_string(),
                Level::Info => "INFO".green().to_string(),
                Level::Debug => "DEBUG".blue().to_string(),
                Level::Trace => "TRACE".magenta().to_string(),
            };
            writeln!(buf, "[{}] {}", level_str, record.args())
        })
        .init();

    let global = cli.global.clone();
    let result = match cli.command {
        Some(Commands::Predict(cmd)) => {
            info!(
                "🩻 Grading {} for patient {} ({} knee)",
                cmd.image, cmd.patient, cmd.side
            );
            run_predict(global, cmd)
        }
        Some(Commands::Studies(cmd)) => run_studies(global, cmd),
        Some(Commands::Info(cmd)) => run_info(global, cmd),
        Some(Commands::DatasetAdd(cmd)) => run_dataset_add(global, cmd),
        Some(Commands::Version) => {
            println!("kneegrade v{}", env!("CARGO_PKG_VERSION"));
            println!("Repository: {}", env!("CARGO_PKG_REPOSITORY"));
            Ok(())
        }
        None => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            cmd.print_help().unwrap();
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("❌ {e}");
        std::process::exit(1);
    }
}
