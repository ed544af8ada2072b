//! voxhost CLI - inspect engines, run synthesis jobs, fine-tune with previews

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;

use voxhost::engine::{builtin_profile_map, register_builtin, EngineRegistry};
use voxhost::jobs::{open_store, FileJobStore, JobOrchestrator, JobRequest, JobStore};
use voxhost::lifecycle::{EngineStatus, ModelLifecycleManager};
use voxhost::training::{
    shared_backend, CheckpointManager, PreviewSpec, ReferenceTrainer, TrainingPhase,
};
use voxhost::{Placement, ServiceConfig, VERSION};

/// voxhost - multi-engine TTS hosting on one accelerator
#[derive(Parser, Debug)]
#[command(name = "voxhost")]
#[command(author, version, about, long_about = None)]
#[command(long_about = "
voxhost hosts several TTS engines on one accelerator, serves jobs with
fallback to a default engine, and fine-tunes voices with checkpoint previews.

Examples:
  # Show the engine catalog and live availability
  voxhost engines

  # Run one job, falling back to the default engine if f5tts cannot load
  voxhost synth --engine f5tts --profile ultra_natural --text \"Hello world\" --output-dir out

  # Fine-tune the reference trainer, previewing every 50 updates
  voxhost train --epochs 5 --preview \"Hello world\"
")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Keep every engine in host memory
    #[arg(long, global = true)]
    cpu: bool,

    /// Allow engines without weights to load with random initialization
    #[arg(long, global = true)]
    allow_random_init: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered engines with live health
    Engines,

    /// Show the fallback profile mapping and any gaps in it
    Profiles,

    /// Submit one synthesis job and print its record
    Synth {
        /// Engine to request
        #[arg(short, long)]
        engine: Option<String>,

        /// Quality profile; the engine's baseline when omitted
        #[arg(short, long)]
        profile: Option<String>,

        /// Text to synthesize
        #[arg(short, long)]
        text: String,

        /// Voice identifier
        #[arg(long)]
        voice: Option<String>,

        /// Language code (e.g. en, zh)
        #[arg(long)]
        language: Option<String>,

        /// Clone the voice from this reference recording
        #[arg(long)]
        clone: Option<String>,

        /// Directory receiving `<job-id>.wav`
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Print a job record from the file job store
    Status {
        /// Job id
        job_id: String,

        /// Job store directory (overrides the config)
        #[arg(long)]
        store_dir: Option<PathBuf>,
    },

    /// Fine-tune the reference trainer with checkpoints and previews
    Train {
        /// Epochs to train (overrides the config)
        #[arg(long)]
        epochs: Option<u64>,

        /// Updates per epoch
        #[arg(long, default_value = "20")]
        updates_per_epoch: u64,

        /// Checkpoint directory (overrides the config)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Preview text, rendered at every sampling point (repeatable)
        #[arg(long = "preview")]
        previews: Vec<String>,

        /// Reference recording paired with each preview
        #[arg(long)]
        reference: Option<PathBuf>,
    },
}

fn setup_logging(level: &str, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        level.parse::<Level>().unwrap_or(Level::INFO)
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

fn create_progress_bar(total: u64) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=> "),
    );
    Ok(pb)
}

fn load_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load_or_default(cli.config.as_deref())
        .context("Failed to load config")?;
    if cli.cpu {
        config.lifecycle.use_accelerator = false;
    }
    if cli.allow_random_init {
        config.lifecycle.allow_random_init = true;
    }
    Ok(config)
}

fn build_lifecycle(config: &ServiceConfig) -> Result<ModelLifecycleManager> {
    let registry = Arc::new(EngineRegistry::new());
    register_builtin(&registry, &config.lifecycle)?;
    Ok(ModelLifecycleManager::new(registry, config.lifecycle.clone()))
}

fn print_engines(lifecycle: &ModelLifecycleManager) -> Result<()> {
    let health = lifecycle.health()?;
    let registry = lifecycle.registry();

    println!("\n{:<12} {:<12} {:<10} {:<16} {}", "ENGINE", "STATUS", "RESIDENT", "STRATEGY", "PROFILES");
    for engine in &health.engines {
        let profiles = registry
            .get(&engine.engine_id)
            .map(|d| d.profile_ids().join(", "))
            .unwrap_or_default();
        let status = match engine.status {
            EngineStatus::Available => "available",
            EngineStatus::Unavailable => "unavailable",
        };
        println!(
            "{:<12} {:<12} {:<10} {:<16} {}",
            engine.engine_id,
            status,
            if engine.resident { "yes" } else { "no" },
            engine.strategy.as_deref().unwrap_or("-"),
            profiles
        );
        if let Some(detail) = &engine.detail {
            println!("  {}", detail);
        }
    }
    println!("\nTotal: {} engine(s) registered", health.engines.len());
    Ok(())
}

async fn run_train(
    config: ServiceConfig,
    epochs: Option<u64>,
    updates_per_epoch: u64,
    checkpoint_dir: Option<PathBuf>,
    previews: Vec<String>,
    reference: Option<PathBuf>,
) -> Result<()> {
    let mut training = config.training.clone();
    if let Some(epochs) = epochs {
        training = training.with_epochs(epochs);
    }
    if let Some(dir) = checkpoint_dir {
        training = training.with_checkpoint_dir(dir);
    }

    let lifecycle = build_lifecycle(&config)?;
    let sample = lifecycle
        .registry()
        .get(&training.sample_engine)
        .context("Sample engine is not registered")?;
    let trainer = ReferenceTrainer::for_descriptor(&sample, updates_per_epoch, Placement::Host)?;

    let previews = previews
        .into_iter()
        .map(|text| {
            let spec = PreviewSpec::new(text);
            match &reference {
                Some(path) => spec.reference(path),
                None => spec,
            }
        })
        .collect();

    let pb = create_progress_bar(training.epochs * updates_per_epoch)?;
    let bar = pb.clone();
    let metrics = lifecycle.metrics().clone();
    let manager = CheckpointManager::new(training, lifecycle, shared_backend(trainer))?
        .with_previews(previews)
        .on_progress(move |phase, progress| {
            bar.set_position(progress.sequence);
            let loss = progress
                .last_loss
                .map(|l| format!("loss {:.5}", l))
                .unwrap_or_default();
            match phase {
                TrainingPhase::Sampling => bar.set_message(format!("sampling at {}", progress.sequence)),
                _ => bar.set_message(loss),
            }
        });

    let start = Instant::now();
    let report = manager.run().await?;
    pb.finish_with_message(format!("done in {:.1}s", start.elapsed().as_secs_f32()));
    println!("{}", serde_json::to_string_pretty(&report)?);
    debug!("Metrics:\n{}", metrics.report());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    setup_logging(&config.logging.level, cli.verbose)?;

    info!("voxhost v{}", VERSION);

    match cli.command {
        Commands::Engines => {
            let lifecycle = build_lifecycle(&config)?;
            print_engines(&lifecycle)
        }

        Commands::Profiles => {
            let lifecycle = build_lifecycle(&config)?;
            let map = builtin_profile_map();
            println!("\nFallback target: {}\n", config.orchestrator.default_engine);
            for entry in map.entries() {
                println!(
                    "  {}/{} -> {}/{}",
                    entry.source_engine, entry.source_profile, entry.target_engine, entry.target_profile
                );
            }

            let gaps = map.audit(lifecycle.registry(), &config.orchestrator.default_engine)?;
            if gaps.is_empty() {
                println!("\nEvery profile has a mapped equivalent.");
            } else {
                println!("\nProfiles falling back to the baseline:");
                for gap in gaps {
                    println!("  {}/{}: {}", gap.engine, gap.profile, gap.reason);
                }
            }
            Ok(())
        }

        Commands::Synth {
            engine,
            profile,
            text,
            voice,
            language,
            clone,
            output_dir,
        } => {
            let mut orchestrator_config = config.orchestrator.clone();
            if output_dir.is_some() {
                orchestrator_config.output_dir = output_dir;
            }
            let lifecycle = build_lifecycle(&config)?;
            let store = open_store(&orchestrator_config)?;
            let engine = engine.unwrap_or_else(|| orchestrator_config.default_engine.clone());
            let orchestrator =
                JobOrchestrator::new(lifecycle, store, builtin_profile_map(), orchestrator_config)?;

            let mut request = JobRequest::new(text, engine);
            if let Some(profile) = profile {
                request = request.profile(profile);
            }
            if let Some(voice) = voice {
                request = request.voice(voice);
            }
            if let Some(language) = language {
                request = request.language(language);
            }
            if let Some(reference) = clone {
                request = request.cloned(reference);
            }

            let job = orchestrator.submit(request).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            orchestrator.lifecycle().shutdown()?;
            debug!("Metrics:\n{}", orchestrator.lifecycle().metrics().report());
            Ok(())
        }

        Commands::Status { job_id, store_dir } => {
            let dir = store_dir
                .or(config.orchestrator.job_store_dir.clone())
                .context("No job store directory configured; pass --store-dir")?;
            let store = FileJobStore::open(dir)?;
            let job = store
                .get(&job_id)?
                .with_context(|| format!("Job {} not found", job_id))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            Ok(())
        }

        Commands::Train {
            epochs,
            updates_per_epoch,
            checkpoint_dir,
            previews,
            reference,
        } => {
            run_train(config, epochs, updates_per_epoch, checkpoint_dir, previews, reference).await
        }
    }
}
