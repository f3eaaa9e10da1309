use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::frame::encode_data_url;
use rollcall_core::{
    AttendanceService, CaptureRequest, Config, RecognizeRequest, Reports, ServiceStatus, SystemClock,
    TrainingPipeline,
};
use rollcall_vision::{LbphBackend, ScrfdDetector};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance")]
struct Cli {
    /// TOML config file; without it, defaults plus ROLLCALL_* variables apply
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture enrollment samples for a student from image files
    Enroll {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        /// Frames to capture, in order
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Rebuild the recognition model from all enrollment samples
    Train,
    /// Identify faces in image files and record attendance
    Recognize {
        #[arg(required = true)]
        frames: Vec<PathBuf>,
    },
    /// Show registered students and who is present today
    Roster,
    /// Print every attendance record
    History,
    /// Copy the attendance ledger to a file
    Export {
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Show whether a trained model is available
    Status,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn frame_url(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading frame {}", path.display()))?;
    Ok(encode_data_url(&bytes))
}

fn open_service(config: &Config) -> Result<AttendanceService> {
    let model = config.detector_model_path();
    let detector = ScrfdDetector::load(&model)
        .with_context(|| format!("loading face detector from {}", model.display()))?;
    let backend = LbphBackend::new(config.classifier);
    Ok(AttendanceService::open(config, Arc::new(detector), Arc::new(backend))?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::from_toml(path)?,
        None => Config::from_env()?,
    };
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    match cli.command {
        Commands::Enroll { id, name, frames } => {
            let service = open_service(&config)?;
            let mut progress = None;
            for path in &frames {
                let request = CaptureRequest::new(id.as_str(), name.as_str(), frame_url(path)?);
                let step = service.capture_face(&request)?;
                tracing::info!(frame = %path.display(), count = step.count, "frame captured");
                progress = Some(step);
                if step.done {
                    break;
                }
            }
            print_json(&progress)?;
        }
        Commands::Train => {
            let pipeline = TrainingPipeline::open(&config, Arc::new(LbphBackend::new(config.classifier)))?;
            let (_, report) = pipeline.run()?;
            print_json(&report)?;
        }
        Commands::Recognize { frames } => {
            let service = open_service(&config)?;
            if !service.status().model_loaded {
                tracing::warn!("no trained model; every frame will report no faces until `rollcall train` runs");
            }
            for path in &frames {
                let request = RecognizeRequest {
                    image: Some(frame_url(path)?),
                };
                let faces = service.process_attendance(&request)?;
                print_json(&serde_json::json!({ "frame": path, "faces": faces }))?;
            }
        }
        Commands::Roster => {
            let reports = Reports::open(&config, Arc::new(SystemClock))?;
            print_json(&reports.roster()?)?;
        }
        Commands::History => {
            let reports = Reports::open(&config, Arc::new(SystemClock))?;
            print_json(&reports.history()?)?;
        }
        Commands::Export { out } => {
            let reports = Reports::open(&config, Arc::new(SystemClock))?;
            let bytes = reports.export(&out)?;
            println!("exported {bytes} bytes to {}", out.display());
        }
        Commands::Status => {
            let pipeline = TrainingPipeline::open(&config, Arc::new(LbphBackend::new(config.classifier)))?;
            let current = pipeline.load_persisted()?;
            print_json(&ServiceStatus {
                version: env!("CARGO_PKG_VERSION"),
                model_loaded: current.is_some(),
                generation: current.as_ref().map(|s| s.generation.clone()),
                labels: current.as_ref().map_or(0, |s| s.labels.len()),
            })?;
        }
    }

    Ok(())
}
