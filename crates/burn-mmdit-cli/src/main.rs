//! burn-mmdit CLI
//!
//! Inspect MMDiT configurations and run smoke forward passes.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::prelude::*;
use burn::tensor::{Distribution, ElementConversion};
use burn_mmdit::{
    load_mmdit, ClassConditioning, Mmdit, MmditConfig, MmditInput, TrainPolicy,
    UnconditionalEmbeddings,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "burn-mmdit")]
#[command(about = "MMDiT diffusion backbone in pure Rust")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Built-in model layouts
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Preset {
    /// Two blocks, 128 wide
    #[default]
    Tiny,
    /// SD3-Medium (24 blocks)
    Sd3Medium,
    /// SD3.5-Large (38 blocks, RMS q/k norm)
    Sd35Large,
}

impl Preset {
    fn config(self) -> MmditConfig {
        match self {
            Preset::Tiny => MmditConfig::tiny(),
            Preset::Sd3Medium => MmditConfig::sd3_medium(),
            Preset::Sd35Large => MmditConfig::sd3_5_large(),
        }
    }
}

/// Which weight groups the report counts as trainable
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum Policy {
    #[default]
    All,
    Finetune,
}

impl Policy {
    fn train_policy(self) -> TrainPolicy {
        match self {
            Policy::All => TrainPolicy::all(),
            Policy::Finetune => TrainPolicy::sd3_finetune(),
        }
    }
}

#[derive(clap::Args)]
struct ModelArgs {
    /// Built-in configuration
    #[arg(long, value_enum, default_value_t = Preset::Tiny)]
    preset: Preset,

    /// JSON configuration file, overrides --preset
    #[arg(long)]
    config: Option<PathBuf>,
}

impl ModelArgs {
    fn resolve(&self) -> Result<MmditConfig> {
        match &self.config {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                MmditConfig::from_json(&json)
                    .with_context(|| format!("parsing {}", path.display()))
            }
            None => {
                let config = self.preset.config();
                config.validate()?;
                Ok(config)
            }
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the resolved configuration and parameter counts per weight group
    Info {
        #[command(flatten)]
        model: ModelArgs,

        /// Train policy used to split the parameter report
        #[arg(long, value_enum, default_value_t = Policy::All)]
        policy: Policy,
    },

    /// Build the model and run one forward pass on random inputs
    Run {
        #[command(flatten)]
        model: ModelArgs,

        /// Safetensors checkpoint; random weights if omitted
        #[arg(short, long)]
        weights: Option<PathBuf>,

        /// Unconditional context embedding (safetensors)
        #[arg(long, requires = "uncond_pooled")]
        uncond_context: Option<PathBuf>,

        /// Unconditional pooled embedding (safetensors)
        #[arg(long, requires = "uncond_context")]
        uncond_pooled: Option<PathBuf>,

        /// Latent width
        #[arg(long, default_value = "32")]
        width: usize,

        /// Latent height
        #[arg(long, default_value = "32")]
        height: usize,

        #[arg(short, long, default_value = "1")]
        batch: usize,

        /// Timestep in [0, 1]
        #[arg(short, long, default_value = "0.5")]
        timestep: f64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    #[cfg(feature = "wgpu")]
    {
        use burn_wgpu::{Wgpu, WgpuDevice};
        let device = WgpuDevice::default();
        run_command::<Wgpu<f32>>(cli.command, &device)
    }

    #[cfg(all(feature = "ndarray", not(feature = "wgpu")))]
    {
        use burn_ndarray::NdArray;
        let device = Default::default();
        run_command::<NdArray<f32>>(cli.command, &device)
    }

    #[cfg(not(any(feature = "wgpu", feature = "ndarray")))]
    {
        let _ = cli;
        anyhow::bail!("No backend enabled. Enable 'wgpu' or 'ndarray' feature.")
    }
}

#[allow(dead_code)]
fn run_command<B: Backend>(command: Commands, device: &B::Device) -> Result<()> {
    match command {
        Commands::Info { model, policy } => {
            let config = model.resolve()?;
            println!("burn-mmdit: MMDiT diffusion backbone\n");
            println!("Configuration:");
            println!("{}", serde_json::to_string_pretty(&config)?);
            println!();
            println!("  Hidden:   {}", config.hidden_size());
            println!("  Heads:    {}", config.num_heads());
            println!("  Out:      {} channels", config.out_channels());

            let model: Mmdit<B> = config.init(None, device)?;
            let (_, report) = model.with_train_policy(&policy.train_policy());
            println!("\nParameters ({policy:?} policy):");
            println!("{report}");
            Ok(())
        }

        Commands::Run {
            model,
            weights,
            uncond_context,
            uncond_pooled,
            width,
            height,
            batch,
            timestep,
        } => {
            let config = model.resolve()?;
            let uncond = match (uncond_context, uncond_pooled) {
                (Some(context), Some(pooled)) => Some(
                    UnconditionalEmbeddings::<B>::from_safetensors(&context, &pooled, device)
                        .context("loading unconditional embeddings")?,
                ),
                _ => None,
            };

            let model: Mmdit<B> = match &weights {
                Some(path) => load(path, &config, uncond, device)?,
                None => config.init(uncond, device)?,
            };

            println!("Configuration:");
            println!("  Depth:    {}", config.depth);
            println!("  Size:     {}x{}", width, height);
            println!("  Batch:    {}", batch);
            println!("  Timestep: {}", timestep);
            println!(
                "  Weights:  {}",
                weights
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(random)".to_string())
            );

            let input = random_input::<B>(&config, batch, width, height, timestep, device);
            let sample = model.forward(input).sample;
            let [b, c, h, w] = sample.dims();
            let flat = sample.flatten::<1>(0, 3);
            let mean = flat.clone().mean().into_scalar().elem::<f32>();
            let std = flat.var(0).sqrt().into_scalar().elem::<f32>();

            println!("\nOutput: [{b}, {c}, {h}, {w}]  mean {mean:.4}  std {std:.4}");
            Ok(())
        }
    }
}

fn load<B: Backend>(
    path: &Path,
    config: &MmditConfig,
    uncond: Option<UnconditionalEmbeddings<B>>,
    device: &B::Device,
) -> Result<Mmdit<B>> {
    if !path.exists() {
        anyhow::bail!("Weights path does not exist: {}", path.display());
    }
    load_mmdit(path, config, uncond, device)
        .with_context(|| format!("loading weights from {}", path.display()))
}

fn random_input<B: Backend>(
    config: &MmditConfig,
    batch: usize,
    width: usize,
    height: usize,
    timestep: f64,
    device: &B::Device,
) -> MmditInput<B> {
    let normal = || Distribution::Normal(0.0, 1.0);
    let input = MmditInput::new(
        Tensor::random([batch, config.in_channels, height, width], normal(), device),
        Tensor::full([batch], timestep, device),
        Tensor::random([batch, config.context_len, config.context_in_dim()], normal(), device),
    );

    if config.pooling.is_some() {
        return input;
    }
    match config.class_conditioning {
        ClassConditioning::Vector { input_dim } => {
            input.with_pooled(Tensor::random([batch, input_dim], normal(), device))
        }
        ClassConditioning::Label { num_classes } => input.with_labels(
            Tensor::<B, 1>::random([batch], Distribution::Uniform(0.0, num_classes as f64), device)
                .int(),
        ),
    }
}
