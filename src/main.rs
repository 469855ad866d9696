use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voxcore::{
    AudioFormat, ClassifierConfig, EngineConfig, PhonemeSequence, SynthesisEngine,
    SynthesisParams, VoiceManifest, classify, discover_models,
};

/// voxcore - acoustic backend core for speech synthesis
#[derive(Parser, Debug)]
#[command(name = "voxcore")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Classify model files and print their descriptors
    Classify {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Classify every model in a directory
    Models { dir: PathBuf },

    /// Build a checksum manifest for a directory of voice files
    Manifest {
        voices_dir: PathBuf,

        /// Output file (defaults to <voices-dir>/manifest.json)
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },

    /// Synthesize one phoneme sequence to a file
    Synthesize {
        #[arg(long)]
        voice: String,

        /// Token ids, comma or space separated
        #[arg(long, default_value = "")]
        tokens: String,

        #[arg(long, default_value = "")]
        phonemes: String,

        #[arg(long, default_value_t = 1.0)]
        speed: f32,

        #[arg(long = "sample-rate", default_value_t = voxcore::core::types::DEFAULT_SAMPLE_RATE)]
        sample_rate: u32,

        /// pcm16, float32 or wav
        #[arg(long, default_value = "wav")]
        format: AudioFormat,

        #[arg(short = 'o', long = "output")]
        output: PathBuf,
    },

    /// Load the configured backends and print their state as JSON
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Classify { paths } => {
            let classifier = classifier_config(cli.config.as_ref())?;
            for path in paths {
                match classify(&path, &classifier) {
                    Ok(descriptor) => println!("{}", serde_json::to_string(&descriptor)?),
                    Err(e) => eprintln!("{}: {e}", path.display()),
                }
            }
        }
        Commands::Models { dir } => {
            let classifier = classifier_config(cli.config.as_ref())?;
            let descriptors = discover_models(&dir, &classifier)?;
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
        }
        Commands::Manifest { voices_dir, output } => {
            let manifest = VoiceManifest::build_from_dir(&voices_dir)?;
            let output = output.unwrap_or_else(|| voices_dir.join("manifest.json"));
            manifest.save(&output)?;
            println!(
                "Wrote manifest with {} voice(s) to {}",
                manifest.len(),
                output.display()
            );
        }
        Commands::Synthesize {
            voice,
            tokens,
            phonemes,
            speed,
            sample_rate,
            format,
            output,
        } => {
            let engine = build_engine(cli.config.as_ref()).await?;
            let tokens = parse_tokens(&tokens)?;
            let params = SynthesisParams {
                speed,
                sample_rate,
                format,
            };

            let result = engine
                .synthesize(&PhonemeSequence::new(phonemes, tokens), &voice, &params)
                .await;
            engine.shutdown().await;

            let synthesized = result?;
            let audio = &synthesized.audio;
            std::fs::write(&output, audio.data())
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(
                output = %output.display(),
                backend = %audio.produced_by(),
                duration_ms = audio.duration().as_millis() as u64,
                bytes = audio.data().len(),
                "Audio written"
            );
        }
        Commands::Status => {
            let engine = build_engine(cli.config.as_ref()).await?;
            if let Err(e) = engine.warm_up().await {
                warn!(error = %e, "No backend could be loaded");
            }
            println!("{}", serde_json::to_string_pretty(&engine.status())?);
            engine.shutdown().await;
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            EngineConfig::from_file(path).map_err(|e| anyhow!(e.to_string()))
        }
        None => EngineConfig::from_env().map_err(|e| anyhow!(e.to_string())),
    }
}

/// Classification needs no backends or voices, so an incomplete
/// configuration falls back to the default threshold
fn classifier_config(path: Option<&PathBuf>) -> anyhow::Result<ClassifierConfig> {
    match path {
        Some(_) => Ok(load_config(path)?.classifier_config()),
        None => Ok(EngineConfig::from_env()
            .map(|config| config.classifier_config())
            .unwrap_or_default()),
    }
}

async fn build_engine(path: Option<&PathBuf>) -> anyhow::Result<SynthesisEngine> {
    let config = load_config(path)?;
    let engine = SynthesisEngine::from_config(&config)?;

    if !config.preload_voices.is_empty() {
        let report = engine.preload_voices(&config.preload_voices).await;
        for (voice_id, error) in &report.failed {
            warn!(voice_id = %voice_id, error = %error, "Voice preload failed");
        }
    }
    Ok(engine)
}

fn parse_tokens(raw: &str) -> anyhow::Result<Vec<i64>> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| {
            t.parse::<i64>()
                .with_context(|| format!("Invalid token id: {t:?}"))
        })
        .collect()
}
