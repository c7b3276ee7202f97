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

/*!
Variational mutual information estimation for image classifiers.

This crate trains an image classifier and, at selected epochs, estimates the
mutual information (MI) between what the classifier sees and what it computes.
Estimates are taken separately for every observed class (or class subset, such
as the backdoored samples of a poisoned class). Comparing these curves over
the course of training exposes classes whose representations behave unlike
the others, which is a symptom of data poisoning.

Two quantities are tracked:
 - `inputs-vs-outputs`: MI between the flattened input images and the pooled penultimate features
 - `outputs-vs-Y`: MI between the pooled penultimate features and the class logits

The estimators are lower bounds on MI, each optimized by a small statistics
network ([`StatisticsNetwork`](crate::mi::statnet::StatisticsNetwork)):
 - Donsker-Varadhan with a moving-average corrected gradient (`DV`)
 - InfoNCE over the full cross join of a batch (`infoNCE`)
 - InfoNCE with a fixed number of sampled negatives (`infoNCE-sampled`)
 - the Jensen-Shannon bound (`JSD`)

# Quick Start
A complete run reads its settings from a [`TrainConfig`](crate::train::trainer::TrainConfig),
usually parsed from TOML, and writes all curves and per-sample scores to the
configured output directory.
```rust,no_run
use miprobe::train::schedule::MiSchedule;
use miprobe::train::trainer::{TrainConfig, Trainer};

let config = TrainConfig {
    train_data: "data/train.npz".into(),
    test_data: "data/test.npz".into(),
    sample_data: "data/observe".into(),
    epochs: 20,
    schedule: MiSchedule::epochs([1, 5, 10, 20]),
    ..TrainConfig::default()
};
let summary = Trainer::new(config)?.run()?;
println!("best test accuracy {:.2}%", summary.best_accuracy);
# Ok::<(), miprobe::error::Error>(())
```

Single estimations run against any [`Classifier`](crate::model::classifier::Classifier)
through [`estimate_mi`](crate::mi::estimate::estimate_mi), which observes the
penultimate layer via a tap and never changes the classifier's outputs.
*/

#![warn(
    missing_debug_implementations,
    rust_2021_compatibility,
)]

pub mod analysis;
pub mod data;
pub mod error;
pub mod mi;
pub mod model;
pub mod nn;
pub mod output;
pub mod train;
