mod annotate;
mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::Config;
use likeness_core::pipeline::{EnrollMode, Enrollment, Recognition};
use likeness_core::{
    GalleryStore, Identity, MatchResult, Normalizer, NormalizerConfig, OnnxProvider, PipelineError,
};
use likeness_hw::{Camera, CaptureSettings};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "likeness", about = "Face gallery enrollment and recognition")]
struct Cli {
    /// Print recognition results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the gallery from a folder of labeled images (file stem = label)
    Enroll {
        /// Folder of training images
        dir: PathBuf,
        /// Add to the existing gallery instead of replacing it
        #[arg(long)]
        append: bool,
    },
    /// Recognize faces against the enrolled gallery
    Recognize {
        #[command(subcommand)]
        mode: RecognizeMode,
    },
    /// List enrolled labels
    List,
    /// List V4L2 capture devices
    Devices,
}

#[derive(Subcommand)]
enum RecognizeMode {
    /// Capture one frame from the camera and identify the person in it
    Single,
    /// Identify every face in a photo
    Group {
        /// Path to the group photo
        path: PathBuf,
        /// Write a copy of the normalized photo with a labeled box per face
        #[arg(long, value_name = "OUT")]
        annotate: Option<PathBuf>,
    },
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    tracing::debug!(?config, "configuration loaded");

    match cli.command {
        Commands::Enroll { dir, append } => {
            let mode = if append {
                EnrollMode::Append
            } else {
                EnrollMode::Rebuild
            };
            enroll(&config, &dir, mode)
        }
        Commands::Recognize { mode } => match mode {
            RecognizeMode::Single => recognize_single(&config, cli.json),
            RecognizeMode::Group { path, annotate } => {
                recognize_group(&config, &path, annotate.as_deref(), cli.json)
            }
        },
        Commands::List => list(&config),
        Commands::Devices => devices(),
    }
}

fn normalizer(config: &Config) -> Normalizer {
    Normalizer::new(NormalizerConfig {
        max_width: config.max_width,
    })
}

fn load_provider(config: &Config) -> Result<OnnxProvider> {
    OnnxProvider::load(&config.model_dir)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))
}

fn enroll(config: &Config, dir: &Path, mode: EnrollMode) -> Result<ExitCode> {
    let mut provider = load_provider(config)?;
    let report = Enrollment::new(&mut provider, normalizer(config))
        .run(dir)
        .with_context(|| format!("enrolling from {}", dir.display()))?;

    for skipped in &report.skipped {
        println!("skipped {}: {}", skipped.path.display(), skipped.reason);
    }

    let store = GalleryStore::new(&config.gallery_path);
    let gallery = report
        .commit(&store, mode)
        .with_context(|| format!("saving gallery to {}", store.path().display()))?;

    println!(
        "Enrolled {} face(s), skipped {}; gallery now holds {} entries ({})",
        report.entries.len(),
        report.skipped.len(),
        gallery.len(),
        store.path().display()
    );
    Ok(ExitCode::SUCCESS)
}

fn open_recognition<'a>(
    config: &Config,
    provider: &'a mut OnnxProvider,
) -> Result<Recognition<'a, OnnxProvider>> {
    let store = GalleryStore::new(&config.gallery_path);
    let gallery = store
        .load()
        .with_context(|| format!("loading gallery {}", store.path().display()))?;
    Ok(Recognition::new(
        gallery,
        provider,
        normalizer(config),
        config.match_policy.matcher(),
        config.tolerance,
    )?)
}

fn recognize_single(config: &Config, json: bool) -> Result<ExitCode> {
    let mut provider = load_provider(config)?;
    let mut recognition = open_recognition(config, &mut provider)?;

    let camera = Camera::open(&config.camera_device)
        .with_context(|| format!("opening camera {}", config.camera_device))?;
    let frame = camera
        .capture(CaptureSettings {
            warmup_frames: config.warmup_frames,
            max_attempts: config.capture_attempts,
        })
        .context("capturing frame")?;

    let image = image::DynamicImage::ImageRgb8(frame.image);
    let result = match recognition.recognize_single(&image) {
        Ok(result) => result,
        Err(PipelineError::NoFaceDetected) => {
            if json {
                println!("{}", serde_json::json!({ "error": "no_face_detected" }));
            } else {
                println!("No faces detected. Please try again.");
            }
            return Ok(ExitCode::from(2));
        }
        Err(e) => return Err(anyhow::Error::new(e).context("recognizing captured frame")),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        match &result.identity {
            Identity::Known(label) => println!("Recognized: {label}"),
            Identity::Unknown => println!("Face not recognized."),
        }
    }

    Ok(if result.identity.is_known() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn recognize_group(
    config: &Config,
    path: &Path,
    annotate_out: Option<&Path>,
    json: bool,
) -> Result<ExitCode> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;

    let mut provider = load_provider(config)?;
    let mut recognition = open_recognition(config, &mut provider)?;
    let group = recognition
        .recognize_group_bytes(&bytes)
        .with_context(|| format!("recognizing {}", path.display()))?;

    if let Some(out) = annotate_out {
        let font = annotate::load_font(config.label_font.as_deref());
        if font.is_none() {
            tracing::warn!("no label font found; set label_font to draw names on the boxes");
        }
        annotate::annotate(&group.image, &group.results, font.as_ref())
            .save(out)
            .with_context(|| format!("writing annotated image {}", out.display()))?;
        tracing::info!(path = %out.display(), "annotated image written");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&group.results)?);
    } else if group.results.is_empty() {
        println!("No faces detected in the group photo.");
    } else {
        print_group(&group.results);
    }

    Ok(ExitCode::SUCCESS)
}

fn print_group(results: &[MatchResult]) {
    let names: Vec<String> = results.iter().map(|r| r.identity.to_string()).collect();
    println!("Recognized faces: {}", names.join(", "));
    for (i, r) in results.iter().enumerate() {
        let distance = r
            .distance
            .map(|d| format!("{d:.3}"))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  [{i}] {:<16} distance {distance:>6}  box ({}, {})-({}, {})",
            r.identity.to_string(),
            r.region.left,
            r.region.top,
            r.region.right,
            r.region.bottom
        );
    }
}

fn list(config: &Config) -> Result<ExitCode> {
    let store = GalleryStore::new(&config.gallery_path);
    let gallery = store
        .load()
        .with_context(|| format!("loading gallery {}", store.path().display()))?;

    if gallery.is_empty() {
        println!("No faces enrolled ({})", store.path().display());
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{} entries, model {} ({})",
        gallery.len(),
        gallery.model_version().unwrap_or("unknown"),
        store.path().display()
    );
    for (label, count) in gallery.labels() {
        println!("  {label:<24} {count} shot(s)");
    }
    Ok(ExitCode::SUCCESS)
}

fn devices() -> Result<ExitCode> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(ExitCode::SUCCESS)
}
