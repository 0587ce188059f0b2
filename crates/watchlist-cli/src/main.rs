use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use watchlist_core::embedder::DEFAULT_EMBEDDER_INPUT_SIZE;
use watchlist_core::{
    extract_signature, record_sighting, CancelToken, CosineMatcher, GalleryStore, ModelRegistry,
    SightingOutcome, SuspiciousRecord, UploadedImage, DEFAULT_SIMILARITY_THRESHOLD,
};
use watchlist_store::{ErrorLog, SqliteGallery, UploadStore};

#[derive(Parser)]
#[command(name = "watchlist", about = "Watchlist operator CLI", version)]
struct Cli {
    /// SQLite gallery path
    #[arg(long, env = "WATCHLIST_DB_PATH", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ModelArgs {
    /// Directory containing the ONNX models
    #[arg(long, env = "WATCHLIST_MODEL_DIR")]
    model_dir: Option<PathBuf>,
    #[arg(
        long,
        env = "WATCHLIST_DETECTOR_MODEL",
        default_value = "det_500m.onnx"
    )]
    detector_model: String,
    #[arg(
        long,
        env = "WATCHLIST_EMBEDDER_MODEL",
        default_value = "mobilenet_v2.onnx"
    )]
    embedder_model: String,
    /// Square input side of the embedding model
    #[arg(
        long,
        env = "WATCHLIST_EMBEDDER_INPUT",
        default_value_t = DEFAULT_EMBEDDER_INPUT_SIZE
    )]
    embedder_input: u32,
}

impl ModelArgs {
    fn load(&self) -> Result<ModelRegistry> {
        let dir = self
            .model_dir
            .clone()
            .unwrap_or_else(watchlist_core::default_model_dir);
        ModelRegistry::load_onnx(
            &dir.join(&self.detector_model),
            &dir.join(&self.embedder_model),
            self.embedder_input,
        )
        .with_context(|| format!("failed to load models from {}", dir.display()))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run photos through the pipeline and record each sighting
    Scan {
        /// Image files to process, in order
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[command(flatten)]
        models: ModelArgs,
        /// Directory scanned photos are copied to
        #[arg(long, env = "WATCHLIST_UPLOAD_DIR", default_value = "uploads")]
        upload_dir: PathBuf,
        #[arg(long, env = "WATCHLIST_ERROR_LOG", default_value = "error.log")]
        error_log: PathBuf,
        #[arg(
            long,
            env = "WATCHLIST_SIMILARITY_THRESHOLD",
            default_value_t = DEFAULT_SIMILARITY_THRESHOLD,
            value_parser = parse_threshold
        )]
        threshold: f32,
        /// Per-photo processing budget in seconds
        #[arg(
            long,
            env = "WATCHLIST_TASK_TIMEOUT_SECS",
            default_value_t = 30,
            value_parser = clap::value_parser!(u64).range(1..=3600)
        )]
        timeout: u64,
    },
    /// List gallery records, most-sighted first
    List,
    /// Print one record as JSON
    Show {
        /// Record ID
        id: String,
    },
    /// Mark a record as a legitimate person
    Legit {
        /// Record ID
        id: String,
        /// Clear the flag instead of setting it
        #[arg(long)]
        revoke: bool,
    },
    /// Check that both models load
    CheckModels {
        #[command(flatten)]
        models: ModelArgs,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = cli
        .db
        .clone()
        .unwrap_or_else(|| watchlist_core::default_data_dir().join("gallery.db"));
    let open_gallery = || {
        SqliteGallery::open(&db_path)
            .with_context(|| format!("failed to open gallery at {}", db_path.display()))
    };

    match cli.command {
        Commands::Scan {
            paths,
            models,
            upload_dir,
            error_log,
            threshold,
            timeout,
        } => {
            let mut registry = models.load()?;
            let gallery = open_gallery()?;
            let uploads = UploadStore::new(upload_dir, "/uploads");
            let error_log = ErrorLog::new(error_log);

            let scanner = Scanner {
                gallery: &gallery,
                uploads: &uploads,
                threshold,
                timeout: Duration::from_secs(timeout),
            };

            let mut failures = 0usize;
            for path in &paths {
                match scanner.scan(&mut registry, path) {
                    Ok(outcome) => println!("{}: {}", path.display(), describe(&outcome)),
                    Err(e) => {
                        failures += 1;
                        let context = format!("scan {}", path.display());
                        error_log.record(&context, &format!("{e:#}"));
                        eprintln!("{}: {e:#}", path.display());
                    }
                }
            }
            if failures > 0 {
                anyhow::bail!("{failures} of {} photos failed", paths.len());
            }
        }
        Commands::List => {
            let mut records = open_gallery()?.all()?;
            records.sort_by(|a, b| b.sighting_count.cmp(&a.sighting_count));
            if records.is_empty() {
                println!("No suspicious records");
            }
            for record in &records {
                println!("{}", summary_line(record));
            }
        }
        Commands::Show { id } => {
            let record = open_gallery()?
                .get(&id)?
                .with_context(|| format!("no record with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Legit { id, revoke } => {
            let record = open_gallery()?.set_legitimate(&id, !revoke)?;
            println!("{}", summary_line(&record));
        }
        Commands::CheckModels { models } => {
            models.load()?;
            println!("Models loaded");
        }
    }

    Ok(())
}

/// Everything a scan needs besides the models.
struct Scanner<'a> {
    gallery: &'a dyn GalleryStore,
    uploads: &'a UploadStore,
    threshold: f32,
    timeout: Duration,
}

impl Scanner<'_> {
    /// Copy one photo into the upload directory, extract its signature and
    /// record the sighting.
    fn scan(&self, models: &mut ModelRegistry, path: &Path) -> Result<SightingOutcome> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let image = UploadedImage::new(bytes, None)?;
        let original_name = path.file_name().and_then(|n| n.to_str());
        let source = self
            .uploads
            .save(image.bytes(), original_name, image.extension())?;

        tracing::debug!(path = %path.display(), stored = %source.filename, "scanning photo");

        let cancel = CancelToken::with_timeout(self.timeout).started();
        let extraction = extract_signature(models, image.bytes(), &cancel)?;
        drop(image);

        let outcome = record_sighting(
            self.gallery,
            &CosineMatcher,
            extraction.signature,
            source,
            self.threshold,
            Utc::now(),
        )?;
        Ok(outcome)
    }
}

/// Cosine similarity thresholds must be a number in [-1, 1].
fn parse_threshold(raw: &str) -> std::result::Result<f32, String> {
    let value: f32 = raw.trim().parse().map_err(|e| format!("{raw:?}: {e}"))?;
    if value.is_finite() && (-1.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("{value} is not in [-1, 1]"))
    }
}

fn describe(outcome: &SightingOutcome) -> String {
    match outcome {
        SightingOutcome::Repeat { record, similarity } => format!(
            "seen again as {} (similarity {similarity:.3}, {} sightings)",
            record.id, record.sighting_count
        ),
        SightingOutcome::New {
            record,
            best_similarity,
        } => format!(
            "new record {} (closest similarity {best_similarity:.3})",
            record.id
        ),
    }
}

fn summary_line(record: &SuspiciousRecord) -> String {
    format!(
        "{}  sightings={:<4} legitimate={:<5} last_seen={}  {}",
        record.id,
        record.sighting_count,
        record.is_legitimate,
        record.last_seen_at.format("%Y-%m-%d %H:%M:%S"),
        record.filename,
    )
}
