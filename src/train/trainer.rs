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

//! The training orchestrator: trains the classifier and pauses at scheduled
//! epochs to estimate MI for every observed class.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indicatif::MultiProgress;
use log::{debug, info, warn};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::metrics::{self, ClassTally};
use super::schedule::MiSchedule;
use super::worker::{run_pool, ClassResult, WorkerTask};
use crate::analysis::{find_suspicious, SuspiciousReport};
use crate::data::dataset::{ClassKey, Dataset};
use crate::data::loader::{Loader, OrderOption};
use crate::error::{Error, Result};
use crate::mi::estimate::MiConfig;
use crate::mi::pairing::Pairing;
use crate::model::dense::{DenseArchitecture, DenseClassifier};
use crate::model::snapshot::ClassifierSnapshot;
use crate::nn::optim::{Optimizer, PlateauConfig, ReduceLrOnPlateau, Sgd};
use crate::output;

/// Hidden layout of the classifier; input shape and (by default) the number
/// of classes are taken from the training data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelLayout {
    pub hidden: Vec<usize>,
    pub feature_channels: usize,
    pub feature_spatial: usize,
    pub num_classes: Option<usize>,
}

impl Default for ModelLayout {
    fn default() -> Self {
        ModelLayout {
            hidden: vec![256],
            feature_channels: 32,
            feature_spatial: 4,
            num_classes: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub output_dir: PathBuf,
    pub train_data: PathBuf,
    pub test_data: PathBuf,
    /// Base path of the per-class shards (`{base}_class_{key}.npz`)
    pub sample_data: PathBuf,
    /// Triggered test inputs for the attack success rate
    pub poisoned_test_data: Option<PathBuf>,
    pub target_class: usize,
    pub model: ModelLayout,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    pub scheduler: Option<PlateauConfig>,
    pub schedule: MiSchedule,
    pub observe_classes: Vec<ClassKey>,
    /// Estimations to run at every scheduled epoch, in order
    pub mi: Vec<MiConfig>,
    pub mi_batch_size: usize,
    pub subset_fraction: f64,
    /// Scores above `mean + suspicious_k * std` are flagged
    pub suspicious_k: f64,
    pub seed: u64,
    pub progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            output_dir: PathBuf::from("outputs"),
            train_data: PathBuf::new(),
            test_data: PathBuf::new(),
            sample_data: PathBuf::new(),
            poisoned_test_data: None,
            target_class: 0,
            model: ModelLayout::default(),
            epochs: 100,
            batch_size: 512,
            learning_rate: 0.1,
            momentum: 0.9,
            weight_decay: 5e-4,
            scheduler: Some(PlateauConfig::default()),
            schedule: MiSchedule::default(),
            observe_classes: (0..10).map(ClassKey::Class).collect(),
            mi: Pairing::ALL.iter().map(|&p| MiConfig::classwise(p)).collect(),
            mi_batch_size: 128,
            subset_fraction: 0.25,
            suspicious_k: 2.0,
            seed: 0,
            progress: true,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(msg.to_string()));
        if self.epochs == 0 {
            return invalid("training needs at least one epoch");
        }
        if self.batch_size == 0 || self.mi_batch_size == 0 {
            return invalid("batch sizes must be positive");
        }
        if !(self.subset_fraction > 0.0 && self.subset_fraction <= 1.0) {
            return invalid("subset fraction must be in (0, 1]");
        }
        let pairings = self.mi.iter().map(|c| c.pairing).collect::<BTreeSet<_>>();
        if pairings.len() != self.mi.len() {
            return invalid("every pairing may be estimated only once per checkpoint");
        }
        for config in &self.mi {
            config.validate()?;
        }
        Ok(())
    }
}

/// Classifier statistics of one training epoch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub learning_rate: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub test_loss: f64,
    pub test_accuracy: f64,
    pub attack_success_rate: Option<f64>,
}

/// MI results of all observed classes for one pairing at one epoch.
#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub epoch: usize,
    pub pairing: Pairing,
    pub results: Vec<ClassResult>,
    pub suspicious: Option<SuspiciousReport>,
}

#[derive(Clone, Debug)]
pub struct TrainSummary {
    pub records: Vec<EpochRecord>,
    /// Mean training loss of every class, one entry per epoch
    pub class_losses: Vec<Array1<f64>>,
    pub checkpoints: Vec<Checkpoint>,
    pub best_accuracy: f64,
    pub train_class_accuracy: Vec<f64>,
    pub test_class_accuracy: Vec<f64>,
}

#[derive(Debug)]
pub struct Trainer {
    config: TrainConfig,
    classifier: DenseClassifier,
    train: Loader,
    test: Loader,
    poisoned: Option<Loader>,
    optimizer: Sgd,
    scheduler: Option<ReduceLrOnPlateau>,
    best: Option<(f64, ClassifierSnapshot)>,
}

fn load_nonempty(path: &Path) -> Result<Dataset> {
    let dataset = Dataset::load_npz(path)?;
    if dataset.is_empty() {
        return Err(Error::EmptyDataset(path.to_path_buf()));
    }
    Ok(dataset)
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Result<Trainer> {
        config.validate()?;
        let train = load_nonempty(&config.train_data)?;
        let test = load_nonempty(&config.test_data)?;
        if test.shape() != train.shape() {
            return Err(Error::Shape {
                expected: train.shape().flat_dim(),
                got: test.shape().flat_dim(),
            });
        }

        let poisoned = match &config.poisoned_test_data {
            Some(path) => Some(load_nonempty(path)?),
            None => None,
        };

        // every evaluated label needs an output logit
        let max_label = [&train, &test]
            .into_iter()
            .chain(poisoned.as_ref())
            .filter_map(|dataset| dataset.classes().last().copied())
            .max();
        let num_classes = match config.model.num_classes {
            Some(n) => n,
            None => max_label.map_or(0, |c| c + 1),
        };
        if let Some(label) = max_label.filter(|&c| c >= num_classes) {
            return Err(Error::IndexOutOfBounds { index: label, len: num_classes });
        }
        let arch = DenseArchitecture {
            input: train.shape(),
            hidden: config.model.hidden.clone(),
            feature_channels: config.model.feature_channels,
            feature_spatial: config.model.feature_spatial,
            num_classes,
        };
        let mut rng = StdRng::seed_from_u64(config.seed);
        let classifier = DenseClassifier::new(arch, &mut rng)?;
        info!("Classifier {}", classifier.architecture());

        if !config.schedule.scheduled(config.epochs).is_empty() {
            for class in &config.observe_classes {
                let shard = class.shard_path(&config.sample_data);
                if !shard.exists() {
                    return Err(Error::InvalidConfig(format!(
                        "shard of {} not found at {}",
                        class.display_name(),
                        shard.display()
                    )));
                }
            }
        }

        let poisoned = match poisoned {
            Some(dataset) => Some(Loader::new(dataset, config.batch_size, OrderOption::Sequential)?),
            None => None,
        };

        Ok(Trainer {
            train: Loader::new(train, config.batch_size, OrderOption::Random { seed: config.seed })?,
            test: Loader::new(test, config.batch_size, OrderOption::Sequential)?,
            poisoned,
            optimizer: Sgd::new(config.learning_rate, config.momentum, config.weight_decay),
            scheduler: config.scheduler.map(ReduceLrOnPlateau::new),
            classifier,
            best: None,
            config,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn classifier(&self) -> &DenseClassifier {
        &self.classifier
    }

    /// Trains the classifier for one epoch and evaluates it.
    ///
    /// Returns the epoch record and the mean training loss per class.
    pub fn train_epoch(&mut self, epoch: usize) -> (EpochRecord, Array1<f64>) {
        let learning_rate = self.optimizer.learning_rate();
        self.train.reshuffle(self.config.seed.wrapping_add(epoch as u64));

        let mut tally = ClassTally::new(self.classifier.architecture().num_classes);
        for batch in self.train.iter() {
            let stats = self
                .classifier
                .train_step(batch.images.view(), batch.labels.view(), &mut self.optimizer);
            tally.add(&stats, &batch.labels);
        }

        let test = metrics::evaluate(&self.classifier, &self.test);
        let asr = self
            .poisoned
            .as_ref()
            .map(|loader| metrics::attack_success_rate(&self.classifier, loader, self.config.target_class));

        info!(
            "Epoch {}: train loss {:.4} acc {:.2}%, test loss {:.4} acc {:.2}%{}",
            epoch,
            tally.mean_loss(),
            tally.accuracy(),
            test.loss,
            test.accuracy,
            asr.map(|a| format!(", ASR {:.2}%", a)).unwrap_or_default()
        );

        if self.best.as_ref().map_or(test.accuracy > 0.0, |(best, _)| test.accuracy > *best) {
            info!("New best model with test accuracy {:.2}%", test.accuracy);
            self.best = Some((test.accuracy, self.classifier.snapshot()));
        }
        if let Some(scheduler) = self.scheduler.as_mut() {
            scheduler.step(test.loss, &mut self.optimizer);
        }

        let record = EpochRecord {
            epoch,
            learning_rate,
            train_loss: tally.mean_loss(),
            train_accuracy: tally.accuracy(),
            test_loss: test.loss,
            test_accuracy: test.accuracy,
            attack_success_rate: asr,
        };
        (record, tally.class_losses())
    }

    /// Estimates MI for every configured pairing and observed class on a
    /// snapshot of the current classifier, and persists the results.
    pub fn estimate_checkpoint(&self, epoch: usize) -> Result<Vec<Checkpoint>> {
        let snapshot = Arc::new(self.classifier.snapshot());
        let progress = self.config.progress.then(MultiProgress::new);
        let dir = &self.config.output_dir;
        let mut checkpoints = Vec::with_capacity(self.config.mi.len());

        for mi in &self.config.mi {
            let tasks = self
                .config
                .observe_classes
                .iter()
                .map(|&class| WorkerTask {
                    class,
                    shard: class.shard_path(&self.config.sample_data),
                    config: mi.clone(),
                    batch_size: self.config.mi_batch_size,
                    subset_fraction: self.config.subset_fraction,
                    order_seed: self.config.seed,
                })
                .collect::<Vec<_>>();
            info!(
                "Estimating {} ({}) for {} classes after epoch {}",
                mi.pairing,
                mi.estimator,
                tasks.len(),
                epoch
            );

            let results = run_pool(Arc::clone(&snapshot), tasks, progress.clone())?;
            output::write_checkpoint(dir, mi.pairing, epoch, &results)?;

            let suspicious = find_suspicious(&results, self.config.suspicious_k);
            match &suspicious {
                Some(report) => output::write_suspicious(dir, mi.pairing, epoch, report)?,
                None => debug!("No per-sample scores for {} at epoch {}", mi.pairing, epoch),
            }
            checkpoints.push(Checkpoint {
                epoch,
                pairing: mi.pairing,
                results,
                suspicious,
            });
        }
        Ok(checkpoints)
    }

    /// Runs the full training schedule and writes all outputs.
    pub fn run(mut self) -> Result<TrainSummary> {
        let dir = self.config.output_dir.clone();
        fs::create_dir_all(&dir)?;
        output::write_config(&dir, &self.config)?;

        let mut records = Vec::with_capacity(self.config.epochs);
        let mut class_losses = Vec::with_capacity(self.config.epochs);
        let mut checkpoints = Vec::new();

        for epoch in 1..=self.config.epochs {
            let (record, losses) = self.train_epoch(epoch);
            records.push(record);
            class_losses.push(losses);
            if self.config.schedule.contains(epoch) {
                checkpoints.extend(self.estimate_checkpoint(epoch)?);
            }
        }

        let latest = self.classifier.snapshot();
        let (best_accuracy, best) = match self.best.take() {
            Some(best) => best,
            None => {
                warn!("No epoch reached a positive test accuracy, keeping the final model");
                (0.0, latest.clone())
            }
        };
        let best_classifier = DenseClassifier::from_snapshot(&best);
        let train_class_accuracy = metrics::tally(&best_classifier, &self.train).class_accuracies();
        let test_class_accuracy = metrics::tally(&best_classifier, &self.test).class_accuracies();
        for (class, (train, test)) in train_class_accuracy.iter().zip(&test_class_accuracy).enumerate() {
            info!("Class {}: train accuracy {:.2}%, test accuracy {:.2}%", class, train, test);
        }

        output::write_training_history(&dir, &records)?;
        output::write_class_losses(&dir, &class_losses)?;
        output::write_class_accuracy(&dir, &train_class_accuracy, &test_class_accuracy)?;
        for mi in &self.config.mi {
            output::write_mi_history(&dir, mi.pairing, &checkpoints)?;
        }
        latest.save_npz(dir.join(output::MODEL))?;
        best.save_npz(dir.join(output::BEST_MODEL))?;
        info!("Wrote results to {}", dir.display());

        Ok(TrainSummary {
            records,
            class_losses,
            checkpoints,
            best_accuracy,
            train_class_accuracy,
            test_class_accuracy,
        })
    }
}
