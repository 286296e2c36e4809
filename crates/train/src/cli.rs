//! CLI wiring for policyforge.

use crate::config::TrainConfig;
use crate::trainer::{evaluate_checkpoint, Trainer};
use anyhow::Result;
use clap::{Parser, Subcommand};
use policyforge_data::synthetic::{write_dataset, SyntheticConfig};
use policyforge_data::{format_data_mixture, make_dataset_kwargs_and_weights, named_mix, DatasetRegistry, MixOptions};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "policyforge", about = "Behavior cloning for transformer robot policies")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Train a policy from a TOML or JSON config.
    Train {
        #[arg(long)]
        config: PathBuf,
        /// Overrides `num_steps`.
        #[arg(long)]
        steps: Option<usize>,
        #[arg(long)]
        save_dir: Option<PathBuf>,
        /// Checkpoint directory to finetune from.
        #[arg(long)]
        pretrained: Option<PathBuf>,
    },
    /// Report validation metrics of a checkpoint.
    Evaluate {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        checkpoint: PathBuf,
    },
    /// Write a synthetic reaching dataset and register it.
    Synthesize {
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "synthetic")]
        name: String,
        #[arg(long, default_value_t = 64)]
        trajectories: usize,
        #[arg(long, default_value_t = 8)]
        val_trajectories: usize,
        #[arg(long, default_value_t = 16)]
        image_size: usize,
        #[arg(long, default_value_t = 7)]
        action_dim: usize,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
    /// Print the datasets and weights a mixture resolves to.
    DescribeMix {
        #[arg(long)]
        mix: String,
        #[arg(long)]
        registry: PathBuf,
        #[arg(long, default_value = ".")]
        data_dir: PathBuf,
    },
}

pub fn run_cli(cli: Cli) -> Result<()> {
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    match cli.command {
        Command::Train {
            config,
            steps,
            save_dir,
            pretrained,
        } => {
            let mut train_config = TrainConfig::from_file(&config)?;
            if let Some(steps) = steps {
                train_config.num_steps = steps;
            }
            if save_dir.is_some() {
                train_config.save_dir = save_dir;
            }
            if pretrained.is_some() {
                train_config.pretrained = pretrained;
            }
            info!(config = %config.display(), "loaded training config");
            let mut trainer = Trainer::new(train_config)?;
            let summary = trainer.run()?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Evaluate { config, checkpoint } => {
            let train_config = TrainConfig::from_file(&config)?;
            let metrics = evaluate_checkpoint(&train_config, &checkpoint)?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Command::Synthesize {
            output,
            name,
            trajectories,
            val_trajectories,
            image_size,
            action_dim,
            seed,
        } => {
            let config = SyntheticConfig {
                image_size,
                action_dim,
                ..SyntheticConfig::default()
            };
            let mut rng = fastrand::Rng::with_seed(seed);
            let registry = write_dataset(&output, &name, trajectories, val_trajectories, &config, &mut rng)?;
            println!("registry={}", registry.display());
        }
        Command::DescribeMix {
            mix,
            registry,
            data_dir,
        } => {
            let registry = DatasetRegistry::from_file(&registry)?;
            let entries = named_mix(&mix)?;
            let (kwargs, weights) =
                make_dataset_kwargs_and_weights(&entries, &registry, &data_dir, &MixOptions::default())?;
            println!("{}", format_data_mixture(&kwargs, &weights));
        }
    }
    Ok(())
}
