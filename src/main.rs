//   Copyright 2025 miprobe developers
//
//   Licensed under the Apache License, Version 2.0 (the "License");
//   you may not use this file except in compliance with the License.
//   You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
//   Unless required by applicable law or agreed to in writing, software
//   distributed under the License is distributed on an "AS IS" BASIS,
//   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//   See the License for the specific language governing permissions and
//   limitations under the License.

//! Command line entry point: train a classifier with periodic MI estimation
//! or split a dataset into the per-class shards that are observed.

use std::error::Error as _;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};

use miprobe::data::dataset::{ClassKey, Dataset};
use miprobe::error::Result;
use miprobe::mi::bound::EstimatorKind;
use miprobe::mi::estimate::MiConfig;
use miprobe::mi::pairing::Pairing;
use miprobe::train::schedule::MiSchedule;
use miprobe::train::trainer::{TrainConfig, Trainer};

#[derive(Parser)]
#[command(name = "miprobe", version, about = "Class-wise mutual information estimation for image classifiers")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a classifier and estimate MI at scheduled epochs
    Train(TrainArgs),
    /// Split a dataset into per-class shards
    Shard(ShardArgs),
    /// Print the default configuration as TOML
    Config,
}

#[derive(Parser)]
struct TrainArgs {
    /// TOML configuration; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    train_data: Option<PathBuf>,

    #[arg(long)]
    test_data: Option<PathBuf>,

    /// Base path of the per-class shards
    #[arg(long)]
    sample_data: Option<PathBuf>,

    /// Triggered test set used for the attack success rate
    #[arg(long)]
    poisoned_test_data: Option<PathBuf>,

    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    learning_rate: Option<f64>,

    #[arg(long)]
    target_class: Option<usize>,

    /// Observed classes, e.g. `0,1,0_backdoor,0_clean`
    #[arg(long, value_delimiter = ',')]
    observe: Vec<String>,

    /// Epochs after which MI is estimated, e.g. `1,5,10`
    #[arg(long, value_delimiter = ',')]
    schedule: Vec<usize>,

    /// Epochs of every MI estimation
    #[arg(long)]
    mi_epochs: Option<usize>,

    /// Learning rate of the statistics network
    #[arg(long)]
    mi_learning_rate: Option<f64>,

    /// Estimator used for every pairing (DV, infoNCE, infoNCE-sampled, JSD).
    /// Selects the estimator's preset; `--mi-epochs` and `--mi-learning-rate` still apply.
    #[arg(long)]
    estimator: Option<String>,

    #[arg(long)]
    seed: Option<u64>,

    /// Disable progress bars
    #[arg(long)]
    no_progress: bool,
}

#[derive(Parser)]
struct ShardArgs {
    /// Dataset to split
    #[arg(short, long)]
    input: PathBuf,

    /// Base path of the written shards
    #[arg(short, long)]
    base: PathBuf,

    /// Class whose backdoor, clean and sample subsets are written
    #[arg(long, default_value_t = 0)]
    target_class: usize,

    /// Size of the random sample of the target class
    #[arg(long, default_value_t = 1000)]
    sample_size: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,
}

impl TrainArgs {
    fn into_config(self) -> Result<TrainConfig> {
        let mut config = match &self.config {
            Some(path) => toml::from_str(&fs::read_to_string(path)?)?,
            None => TrainConfig::default(),
        };

        macro_rules! override_with {
            ($args:ident, $config:ident; $($field:ident),*) => {
                $(if let Some(value) = $args.$field {
                    $config.$field = value;
                })*
            };
        }
        override_with!(
            self, config;
            train_data,
            test_data,
            sample_data,
            output_dir,
            epochs,
            batch_size,
            learning_rate,
            target_class,
            seed
        );

        if self.poisoned_test_data.is_some() {
            config.poisoned_test_data = self.poisoned_test_data;
        }
        if !self.observe.is_empty() {
            config.observe_classes = self
                .observe
                .iter()
                .map(|key| key.trim().parse::<ClassKey>())
                .collect::<Result<Vec<_>>>()?;
        }
        if !self.schedule.is_empty() {
            config.schedule = MiSchedule::epochs(self.schedule);
        }
        let estimator = self.estimator.as_deref().map(str::parse::<EstimatorKind>).transpose()?;
        for mi in config.mi.iter_mut() {
            if let Some(estimator) = estimator {
                *mi = estimator_preset(mi.pairing, estimator);
            }
            if let Some(epochs) = self.mi_epochs {
                mi.epochs = epochs;
            }
            if let Some(lr) = self.mi_learning_rate {
                mi.learning_rate = lr;
            }
        }
        if self.no_progress {
            config.progress = false;
        }
        Ok(config)
    }
}

/// Sampled InfoNCE keeps the class-wise preset; the other estimators use the logit-based one.
fn estimator_preset(pairing: Pairing, estimator: EstimatorKind) -> MiConfig {
    match estimator {
        EstimatorKind::InfoNceSampled => MiConfig::classwise(pairing),
        _ => MiConfig::logit_based(pairing, estimator),
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Train(args) => {
            let config = args.into_config()?;
            let summary = Trainer::new(config)?.run()?;
            info!(
                "Finished {} epochs with best test accuracy {:.2}% and {} MI checkpoints",
                summary.records.len(),
                summary.best_accuracy,
                summary.checkpoints.len()
            );
        }
        Command::Shard(args) => {
            let dataset = Dataset::load_npz(&args.input)?;
            let shards = dataset.shard(&args.base, args.target_class, args.sample_size, args.seed)?;
            info!("Wrote {} shards next to {}", shards.len(), args.base.display());
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&TrainConfig::default())?);
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            let mut source = err.source();
            while let Some(cause) = source {
                error!("  caused by: {}", cause);
                source = cause.source();
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use miprobe::mi::bound::NonFinitePolicy;
    use miprobe::mi::pairing::TargetSource;

    use super::*;

    #[test]
    fn test_estimator_flag_selects_preset() {
        let args = TrainArgs::parse_from(["train", "--estimator", "DV", "--mi-epochs", "7"]);
        let config = args.into_config().unwrap();
        for mi in &config.mi {
            assert_eq!(mi.estimator, EstimatorKind::DonskerVaradhan);
            assert_eq!(mi.target, TargetSource::Logits);
            assert_eq!(mi.non_finite, NonFinitePolicy::RepeatLast);
            assert_eq!(mi.epochs, 7);
            mi.validate().unwrap();
        }

        let args = TrainArgs::parse_from(["train", "--estimator", "JSD", "--mi-learning-rate", "0.01"]);
        let config = args.into_config().unwrap();
        let expected = config
            .mi
            .iter()
            .map(|mi| MiConfig {
                learning_rate: 0.01,
                ..MiConfig::logit_based(mi.pairing, EstimatorKind::JensenShannon)
            })
            .collect::<Vec<_>>();
        assert_eq!(config.mi, expected);
    }

    #[test]
    fn test_sampled_estimator_keeps_classwise_preset() {
        let config = TrainArgs::parse_from(["train", "--estimator", "infoNCE-sampled"])
            .into_config()
            .unwrap();
        for mi in &config.mi {
            assert_eq!(*mi, MiConfig::classwise(mi.pairing));
        }
        assert!(TrainArgs::parse_from(["train", "--estimator", "MINE"]).into_config().is_err());
    }
}
