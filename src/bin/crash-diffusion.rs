//! crash-diffusion CLI — train a 1-D v-diffusion model or sample from one.
//!
//! ```sh
//! crash-diffusion train --config config.json
//! crash-diffusion sample --checkpoint checkpoints/step_00010000_ema.safetensors \
//!     --steps 100 --eta 0 --num 4 --output fakes.npy
//! ```
//!
//! `sample` prints a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"fakes.npy","shape":[4,2,65536],"steps":100,"eta":0.0,"seed":42}
//! ```

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use crash_diffusion::{
    checkpoint::{self, CONFIG_FILE},
    config::DiffusionConfig,
    dataset::SampleDataset,
    diffusion::{noise::randn, sample},
    training::DiffusionTrainer,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Parser, Debug)]
#[command(
    name = "crash-diffusion",
    about = "Unconditional v-diffusion over 1-D signals with the crash schedule"
)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// CUDA device ordinal, used when built with CUDA support.
    #[arg(long, global = true, default_value_t = 0)]
    device: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train on a `.npy` array of fixed-length segments.
    Train {
        /// JSON config file; missing fields take their defaults.
        #[arg(long, short = 'c')]
        config: PathBuf,

        /// Resume from the checkpoint written at this step in `save_path`.
        #[arg(long)]
        resume_step: Option<usize>,
    },

    /// Generate signals from a trained checkpoint.
    Sample {
        /// Weights file (normally a `*_ema.safetensors`).
        #[arg(long)]
        checkpoint: PathBuf,

        /// Training config; defaults to `config.json` next to the checkpoint.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Number of sampling steps (at least 1).
        #[arg(long, default_value_t = 100)]
        steps: usize,

        /// Stochasticity: 0 is deterministic DDIM.
        #[arg(long, default_value_t = 0.0)]
        eta: f64,

        /// Number of signals to generate.
        #[arg(long, short = 'n', default_value_t = 1)]
        num: usize,

        /// Random seed. Defaults to the config seed.
        #[arg(long, short = 's')]
        seed: Option<u64>,

        /// Output `.npy` path, shape [num, channels, sample_size].
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let device = candle_core::Device::cuda_if_available(args.device)?;
    tracing::info!("Using device: {:?}", device);

    match args.command {
        Command::Train {
            config,
            resume_step,
        } => train(&config, resume_step, &device),
        Command::Sample {
            checkpoint,
            config,
            steps,
            eta,
            num,
            seed,
            output,
        } => {
            let config = config.unwrap_or_else(|| {
                checkpoint
                    .parent()
                    .unwrap_or_else(|| Path::new("."))
                    .join(CONFIG_FILE)
            });
            generate(&checkpoint, &config, steps, eta, num, seed, &output, &device)
        }
    }
}

fn train(
    config_path: &Path,
    resume_step: Option<usize>,
    device: &candle_core::Device,
) -> anyhow::Result<()> {
    let config = DiffusionConfig::from_json_file(config_path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", config_path.display()))?;

    let dataset = SampleDataset::from_npy(&config.training_dir, config.channels, device)
        .map_err(|e| anyhow::anyhow!("failed to load training data: {e}"))?;

    let save_path = config.save_path.clone();
    let mut trainer = DiffusionTrainer::new(config, device)?;
    if let Some(step) = resume_step {
        let paths = checkpoint::CheckpointPaths::for_step(&save_path, step);
        trainer.resume(&paths, step)?;
    }

    tracing::info!(
        segments = dataset.len(),
        epochs = trainer.config().max_epochs,
        "starting training"
    );
    trainer
        .fit(&dataset)
        .map_err(|e| anyhow::anyhow!("training failed: {e}"))?;
    tracing::info!(step = trainer.global_step(), "training finished");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn generate(
    checkpoint_path: &Path,
    config_path: &Path,
    steps: usize,
    eta: f64,
    num: usize,
    seed: Option<u64>,
    output: &Path,
    device: &candle_core::Device,
) -> anyhow::Result<()> {
    if num == 0 {
        anyhow::bail!("--num must be at least 1");
    }
    let config = DiffusionConfig::from_json_file(config_path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", config_path.display()))?;
    let (_vars, model) = checkpoint::load_model(checkpoint_path, &config.unet_config(), device)?;

    let seed = seed.unwrap_or(config.seed);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let noise = randn(
        (num, config.channels, config.sample_size),
        candle_core::DType::F32,
        device,
        &mut rng,
    )?;

    tracing::info!(num, steps, eta, "sampling");
    let fakes = sample(&model, &noise, steps, eta, &mut rng)
        .map_err(|e| anyhow::anyhow!("sampling failed: {e}"))?;

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    fakes.write_npy(output)?;

    let summary = serde_json::json!({
        "path": output.display().to_string(),
        "shape": fakes.dims(),
        "steps": steps,
        "eta": eta,
        "seed": seed,
    });
    println!("{summary}");
    Ok(())
}
