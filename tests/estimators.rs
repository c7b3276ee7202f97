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

//! Convergence of the MI bounds on a classifier whose features reveal the label.
//!
//! The pooled features carry the (balanced, binary) label exactly, so the MI
//! between features and one-hot labels is `ln 2`.

use std::f64::consts::LN_2;

use approx::assert_abs_diff_eq;
use ndarray::{Array, Array1, Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::SeedableRng;

use miprobe::data::dataset::{Dataset, ImageShape};
use miprobe::data::loader::{Loader, OrderOption};
use miprobe::mi::bound::{EstimatorKind, InfoNce, InfoNceSampled, MiBound};
use miprobe::mi::estimate::{estimate_mi, EarlyStop, MiConfig, OptimizerKind, Termination};
use miprobe::mi::pairing::{Pairing, TargetSource};
use miprobe::mi::statnet::positive_pairs;
use miprobe::mi::visit::{EstimationCsv, NoOpVisitor};
use miprobe::model::classifier::{
    Classifier, ClassifierDims, ClassifierOutput, FeatureMap, Tap, TapHandle, TapRegistry,
};
use miprobe::nn::optim::PlateauConfig;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Passes the image through as a one-position feature map.
#[derive(Default)]
struct Passthrough {
    taps: TapRegistry,
}

impl Classifier for Passthrough {
    fn dims(&self) -> ClassifierDims {
        ClassifierDims {
            input: 2,
            feature_channels: 2,
            num_classes: 2,
        }
    }

    fn forward(&self, images: ArrayView2<f64>) -> ClassifierOutput {
        self.taps.fire(&FeatureMap::new(images.to_owned(), 2, 1));
        ClassifierOutput {
            features: images.to_owned(),
            logits: images.to_owned(),
        }
    }

    fn register_tap(&mut self, tap: Tap) -> TapHandle {
        self.taps.register(tap)
    }

    fn remove_tap(&mut self, handle: TapHandle) {
        self.taps.remove(handle)
    }
}

fn binary_loader(n: usize, batch_size: usize) -> Loader {
    let labels = Array::from_shape_fn(n, |i| i % 2);
    let images = Array2::from_shape_fn((n, 2), |(i, j)| {
        let label = (i % 2) as f64;
        let jitter = 0.05 * ((i * 7 + j * 3) as f64).sin();
        if j == 0 {
            label + jitter
        } else {
            1.0 - label + jitter
        }
    });
    let dataset = Dataset::new(images, labels, ImageShape::new(2, 1, 1)).unwrap();
    Loader::new(dataset, batch_size, OrderOption::Random { seed: 11 }).unwrap()
}

fn convergence_config(estimator: EstimatorKind) -> MiConfig {
    MiConfig {
        target: TargetSource::Labels,
        epochs: 400,
        learning_rate: 5e-3,
        weight_decay: 0.0,
        optimizer: OptimizerKind::Adam,
        hidden: 32,
        depth: 1,
        clip_norm: 20.0,
        early_stop: None,
        scheduler: None,
        seed: 5,
        ..MiConfig::logit_based(Pairing::OutputsVsY, estimator)
    }
}

fn tail_mean(history: &[f64], len: usize) -> f64 {
    let tail = &history[history.len() - len..];
    tail.iter().sum::<f64>() / tail.len() as f64
}

#[test]
fn test_infonce_converges_to_ln2() {
    init_logger();
    let loader = binary_loader(1024, 128);
    let config = convergence_config(EstimatorKind::InfoNce);
    let mut clf = Passthrough::default();

    let report = estimate_mi(&mut clf, &loader, &config, "infoNCE", &mut NoOpVisitor {}).unwrap();

    assert_eq!(report.history.len(), 400);
    assert_eq!(report.termination, Termination::EpochsExhausted);
    assert_abs_diff_eq!(tail_mean(&report.history, 20), LN_2, epsilon = 0.05);
    assert_eq!(report.sample_scores.len(), 1024);
    assert!(clf.taps.is_empty());
}

#[test]
fn test_dv_converges_to_ln2() {
    init_logger();
    let loader = binary_loader(1024, 128);
    let config = convergence_config(EstimatorKind::DonskerVaradhan);
    let mut clf = Passthrough::default();
    let dir = tempfile::tempdir().unwrap();
    let mut log = EstimationCsv::new(dir.path().join("dv.csv")).unwrap();

    let report = estimate_mi(&mut clf, &loader, &config, "DV", &mut log).unwrap();

    assert_abs_diff_eq!(tail_mean(&report.history, 20), LN_2, epsilon = 0.07);
    assert!(report.sample_scores.iter().all(|s| s.is_nan()));

    let rows = std::fs::read_to_string(dir.path().join("dv.csv")).unwrap();
    // header plus one row per epoch
    assert_eq!(rows.lines().count(), 401);
}

#[test]
fn test_sampled_infonce_matches_cross_join() {
    let batch = 256;
    let labels = Array::from_shape_fn(batch, |i| i % 2);
    let score = |(i, j): (usize, usize)| if labels[i] == labels[j] { 10.0 } else { 0.0 };
    let mut rng = StdRng::seed_from_u64(17);

    let t: Array1<f64> = positive_pairs(batch).into_iter().map(score).collect();
    let mut full = InfoNce;
    let t2: Array1<f64> = full.negative_pairs(batch, &mut rng).into_iter().map(score).collect();
    let exact = full.objective(t.view(), t2.view());

    let mut sampled = InfoNceSampled::new(256).unwrap();
    let t2: Array1<f64> = sampled.negative_pairs(batch, &mut rng).into_iter().map(score).collect();
    let approx = sampled.objective(t.view(), t2.view());

    assert_abs_diff_eq!(exact.loss, approx.loss, epsilon = 0.02);
    assert_abs_diff_eq!(-exact.loss, LN_2, epsilon = 0.02);
}

#[test]
fn test_frozen_network_stops_early() {
    init_logger();
    let loader = binary_loader(64, 16);
    let config = MiConfig {
        epochs: 12,
        learning_rate: 0.0,
        early_stop: Some(EarlyStop {
            patience: 3,
            delta: 1e-9,
        }),
        scheduler: Some(PlateauConfig {
            patience: 1,
            ..PlateauConfig::default()
        }),
        ..convergence_config(EstimatorKind::InfoNce)
    };
    let mut clf = Passthrough::default();

    let report = estimate_mi(&mut clf, &loader, &config, "infoNCE", &mut NoOpVisitor {}).unwrap();

    // the batches repeat every epoch, so a frozen T repeats its estimate
    assert_eq!(report.history.len(), 3);
    assert_eq!(report.termination, Termination::EarlyStop { epoch: 2 });
    assert_eq!(report.final_estimate(), Some(report.history[0]));
}
