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

//! The MI estimation loop: trains a fresh statistics network against a
//! frozen classifier and records one MI estimate per epoch.

use std::fmt::Display;

use log::{debug, info, warn};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::bound::{EstimatorKind, NonFinitePolicy};
use super::pairing::{Pairing, TargetSource};
use super::scores::ScoreAccumulator;
use super::statnet::{positive_pairs, StatisticsNetwork};
use super::visit::{EpochSummary, EstimationVisitor};
use crate::data::loader::Loader;
use crate::error::{Error, Result};
use crate::model::classifier::{ActivationSlot, Classifier};
use crate::nn::optim::{clip_grad_norm, Adam, Optimizer, PlateauConfig, ReduceLrOnPlateau};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizerKind {
    /// Adam with L2 weight decay added to the gradient
    Adam,
    /// Adam with decoupled weight decay
    AdamW,
}

impl OptimizerKind {
    pub fn build(self, lr: f64, weight_decay: f64) -> Adam {
        match self {
            OptimizerKind::Adam => Adam::new(lr, weight_decay),
            OptimizerKind::AdamW => Adam::adamw(lr, weight_decay),
        }
    }
}

/// Stops the loop once the last `patience` estimates vary by less than `delta`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EarlyStop {
    pub patience: usize,
    pub delta: f64,
}

impl EarlyStop {
    /// True if `history` ends in a plateau of `patience` estimates.
    ///
    /// A window containing a non-finite estimate is never a plateau.
    pub fn should_stop(&self, history: &[f64]) -> bool {
        if self.patience == 0 || history.len() < self.patience {
            return false;
        }
        let window = &history[history.len() - self.patience..];
        if window.iter().any(|v| !v.is_finite()) {
            return false;
        }
        let max = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = window.iter().copied().fold(f64::INFINITY, f64::min);
        max - min < self.delta
    }
}

/// Settings of one MI estimation run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MiConfig {
    pub pairing: Pairing,
    pub estimator: EstimatorKind,
    #[serde(default)]
    pub target: TargetSource,
    pub epochs: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub optimizer: OptimizerKind,
    /// Width of the hidden layers of T
    pub hidden: usize,
    /// Number of hidden layers of T
    pub depth: usize,
    pub clip_norm: f64,
    pub num_negatives: usize,
    pub non_finite: NonFinitePolicy,
    pub early_stop: Option<EarlyStop>,
    pub scheduler: Option<PlateauConfig>,
    pub seed: u64,
}

impl MiConfig {
    /// Sampled InfoNCE with per-sample scores, as used for the class-wise
    /// backdoor analysis.
    pub fn classwise(pairing: Pairing) -> MiConfig {
        let (epochs, delta) = match pairing {
            Pairing::InputsVsOutputs => (350, 1e-2),
            Pairing::OutputsVsY => (200, 1e-3),
        };
        MiConfig {
            pairing,
            estimator: EstimatorKind::InfoNceSampled,
            target: TargetSource::Logits,
            epochs,
            learning_rate: 1e-4,
            weight_decay: 1e-4,
            optimizer: OptimizerKind::AdamW,
            hidden: 256,
            depth: 2,
            clip_norm: 5.0,
            num_negatives: 128,
            non_finite: NonFinitePolicy::SkipBatch,
            early_stop: Some(EarlyStop { patience: 50, delta }),
            scheduler: Some(PlateauConfig {
                factor: 0.5,
                patience: 5,
                ..PlateauConfig::default()
            }),
            seed: 0,
        }
    }

    /// Full-data estimation of the MI curve with a slowly trained `T`.
    pub fn logit_based(pairing: Pairing, estimator: EstimatorKind) -> MiConfig {
        MiConfig {
            pairing,
            estimator,
            target: TargetSource::Logits,
            epochs: 300,
            learning_rate: 1e-6,
            weight_decay: 1e-5,
            optimizer: OptimizerKind::Adam,
            hidden: 512,
            depth: 2,
            clip_norm: 20.0,
            num_negatives: 128,
            non_finite: NonFinitePolicy::RepeatLast,
            early_stop: None,
            scheduler: None,
            seed: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));
        if self.epochs == 0 {
            return invalid("MI estimation needs at least one epoch".to_string());
        }
        if !(self.learning_rate >= 0.0 && self.learning_rate.is_finite()) {
            return invalid(format!("invalid learning rate {}", self.learning_rate));
        }
        if !(self.clip_norm > 0.0) {
            return invalid(format!("gradient clip norm must be positive, got {}", self.clip_norm));
        }
        if self.hidden == 0 || self.depth == 0 {
            return invalid("statistics network needs at least one hidden unit and layer".to_string());
        }
        if self.estimator == EstimatorKind::InfoNceSampled && self.num_negatives == 0 {
            return invalid("sampled InfoNCE needs at least one negative sample".to_string());
        }
        if let Some(stop) = &self.early_stop {
            if stop.patience == 0 || !(stop.delta >= 0.0) {
                return invalid(format!("invalid early stop {:?}", stop));
            }
        }
        Ok(())
    }
}

/// Why the estimation loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// The history plateaued after the zero-based `epoch`
    EarlyStop { epoch: usize },
    EpochsExhausted,
}

impl Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::EarlyStop { epoch } => write!(f, "early stop after epoch {}", epoch + 1),
            Termination::EpochsExhausted => write!(f, "all epochs"),
        }
    }
}

/// Outcome of [`estimate_mi`].
#[derive(Clone, Debug)]
pub struct MiReport {
    /// One MI estimate per completed epoch, `NaN` for epochs without a valid batch
    pub history: Vec<f64>,
    /// Average per-sample score by position in the loader order, `NaN` where
    /// no score was recorded
    pub sample_scores: Array1<f64>,
    pub termination: Termination,
}

impl MiReport {
    /// Last finite estimate of the history.
    pub fn final_estimate(&self) -> Option<f64> {
        self.history.iter().rev().copied().find(|v| v.is_finite())
    }
}

/// Estimates the MI of the configured pairing on the samples of `loader`.
///
/// A tap is registered on `classifier` for the duration of the run to
/// capture its penultimate feature map; the classifier itself is never
/// modified. Fails with [`Error::TapNotFired`] if a forward pass does not
/// report a feature map.
pub fn estimate_mi<C, V>(
    classifier: &mut C,
    loader: &Loader,
    config: &MiConfig,
    label: &str,
    visitor: &mut V,
) -> Result<MiReport>
where
    C: Classifier + ?Sized,
    V: EstimationVisitor + ?Sized,
{
    config.validate()?;
    if loader.is_empty() {
        return Err(Error::InvalidConfig(format!("no samples to estimate {} on", label)));
    }

    let slot = ActivationSlot::new();
    let handle = classifier.register_tap(slot.tap());
    let report = run_epochs(&*classifier, &slot, loader, config, label, visitor);
    classifier.remove_tap(handle);
    report
}

fn run_epochs<C, V>(
    classifier: &C,
    slot: &ActivationSlot,
    loader: &Loader,
    config: &MiConfig,
    label: &str,
    visitor: &mut V,
) -> Result<MiReport>
where
    C: Classifier + ?Sized,
    V: EstimationVisitor + ?Sized,
{
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (y_dim, z_dim) = config.pairing.dims(classifier.dims());
    let mut net = StatisticsNetwork::new(y_dim, z_dim, config.hidden, config.depth, &mut rng)?;
    let mut bound = config.estimator.build(config.num_negatives, config.non_finite)?;
    let mut optimizer = config.optimizer.build(config.learning_rate, config.weight_decay);
    let mut scheduler = config.scheduler.map(ReduceLrOnPlateau::new);
    let mut scores = ScoreAccumulator::new(loader.len(), loader.batch_size());

    debug!(
        "Estimating {} with T of {} parameters on {} samples",
        label,
        net.num_params(),
        loader.num_samples()
    );

    let mut history = Vec::with_capacity(config.epochs);
    let mut termination = Termination::EpochsExhausted;
    visitor.start_estimation(label, config.epochs, loader.len());

    for epoch in 0..config.epochs {
        visitor.start_epoch(epoch);
        bound.begin_epoch();
        let mut losses = Vec::with_capacity(loader.len());
        let mut last_valid = None;
        let mut skipped = 0;

        for batch in loader.iter() {
            let output = classifier.forward(batch.images.view());
            let features = slot.take().ok_or(Error::TapNotFired)?.global_avg_pool();
            let pair = config.pairing.select(
                config.target,
                batch.images.view(),
                features.view(),
                output.logits.view(),
                batch.labels.view(),
            )?;

            let positives = positive_pairs(batch.len());
            let negatives = bound.negative_pairs(batch.len(), &mut rng);
            let pos = net.forward(pair.y.view(), pair.z.view(), &positives)?;
            let neg = net.forward(pair.y.view(), pair.z.view(), &negatives)?;
            let objective = bound.objective(pos.scores.view(), neg.scores.view());

            if let Some(sample_scores) = &objective.sample_scores {
                scores.add_batch(batch.start, sample_scores.view())?;
            }
            visitor.finish_batch(batch.index, objective.loss);

            if !objective.is_finite() {
                warn!(
                    "{}: skipping batch {} of epoch {} due to invalid loss {}",
                    label,
                    batch.index,
                    epoch + 1,
                    objective.loss
                );
                skipped += 1;
                if let (NonFinitePolicy::RepeatLast, Some(loss)) = (config.non_finite, last_valid) {
                    losses.push(loss);
                }
                continue;
            }

            let mut grads = net.backward(&pos, pair.y.view(), pair.z.view(), &positives, objective.d_positive.view());
            let neg_grads = net.backward(&neg, pair.y.view(), pair.z.view(), &negatives, objective.d_negative.view());
            for (grad, other) in grads.iter_mut().zip(&neg_grads) {
                grad.accumulate(other);
            }
            let norm = clip_grad_norm(&mut grads, config.clip_norm);
            optimizer.step(&mut net.layers_mut(), &grads);

            debug!("{}: epoch {} batch {} loss {:.5} grad norm {:.3}", label, epoch + 1, batch.index, objective.loss, norm);
            losses.push(objective.loss);
            last_valid = Some(objective.loss);
        }

        let valid = loader.len() - skipped;
        let mut summary = EpochSummary {
            epoch,
            mean_loss: f64::NAN,
            min_loss: f64::NAN,
            max_loss: f64::NAN,
            estimate: f64::NAN,
            valid_batches: valid,
            skipped_batches: skipped,
            learning_rate: optimizer.learning_rate(),
        };

        if losses.is_empty() {
            warn!("{}: epoch {} had no valid batch", label, epoch + 1);
            history.push(f64::NAN);
            visitor.finish_epoch(&summary);
            continue;
        }

        let mean_loss = losses.iter().sum::<f64>() / losses.len() as f64;
        let estimate = bound.epoch_estimate(mean_loss);
        history.push(estimate);
        summary.mean_loss = mean_loss;
        summary.min_loss = losses.iter().copied().fold(f64::INFINITY, f64::min);
        summary.max_loss = losses.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        summary.estimate = estimate;

        if let Some(scheduler) = scheduler.as_mut() {
            scheduler.step(mean_loss, &mut optimizer);
        }
        info!(
            "{}: epoch {} loss {:.5} (min {:.5}, max {:.5}) mi {:.5}",
            label,
            epoch + 1,
            mean_loss,
            summary.min_loss,
            summary.max_loss,
            estimate
        );
        visitor.finish_epoch(&summary);

        if config.early_stop.map_or(false, |stop| stop.should_stop(&history)) {
            info!("{}: early stopping at epoch {}", label, epoch + 1);
            termination = Termination::EarlyStop { epoch };
            break;
        }
    }

    visitor.finish_estimation(&termination);
    Ok(MiReport {
        history,
        sample_scores: scores.average(),
        termination,
    })
}
