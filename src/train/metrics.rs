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

//! Classifier quality metrics tracked during training

use ndarray::Array1;

use crate::data::loader::Loader;
use crate::model::dense::{BatchStats, DenseClassifier};

/// Mean loss and accuracy (in percent) over a loader.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EvalStats {
    pub loss: f64,
    pub accuracy: f64,
}

/// Per-class counts of samples, correct predictions and summed losses.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassTally {
    total: Vec<usize>,
    correct: Vec<usize>,
    loss_sum: Vec<f64>,
}

impl ClassTally {
    pub fn new(num_classes: usize) -> ClassTally {
        ClassTally {
            total: vec![0; num_classes],
            correct: vec![0; num_classes],
            loss_sum: vec![0.0; num_classes],
        }
    }

    pub fn num_classes(&self) -> usize {
        self.total.len()
    }

    /// Adds a batch; labels outside the tracked classes are ignored.
    pub fn add(&mut self, stats: &BatchStats, labels: &Array1<usize>) {
        for ((&label, &pred), &loss) in labels.iter().zip(&stats.predictions).zip(&stats.losses) {
            if label >= self.total.len() {
                continue;
            }
            self.total[label] += 1;
            self.loss_sum[label] += loss;
            if pred == label {
                self.correct[label] += 1;
            }
        }
    }

    pub fn total(&self) -> usize {
        self.total.iter().sum()
    }

    /// Accuracy in percent over all classes.
    pub fn accuracy(&self) -> f64 {
        percent(self.correct.iter().sum(), self.total())
    }

    /// Per-class accuracy in percent, 0 for classes without samples.
    pub fn class_accuracies(&self) -> Vec<f64> {
        self.correct.iter().zip(&self.total).map(|(&c, &t)| percent(c, t)).collect()
    }

    /// Per-class mean loss, `NaN` for classes without samples.
    pub fn class_losses(&self) -> Array1<f64> {
        self.loss_sum
            .iter()
            .zip(&self.total)
            .map(|(&sum, &t)| if t == 0 { f64::NAN } else { sum / t as f64 })
            .collect()
    }

    pub fn mean_loss(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return f64::NAN;
        }
        self.loss_sum.iter().sum::<f64>() / total as f64
    }
}

fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * count as f64 / total as f64
    }
}

/// Evaluates `classifier` on every batch of `loader`.
pub fn tally(classifier: &DenseClassifier, loader: &Loader) -> ClassTally {
    let mut tally = ClassTally::new(classifier.architecture().num_classes);
    for batch in loader.iter() {
        let stats = classifier.evaluate(batch.images.view(), batch.labels.view());
        tally.add(&stats, &batch.labels);
    }
    tally
}

pub fn evaluate(classifier: &DenseClassifier, loader: &Loader) -> EvalStats {
    let tally = tally(classifier, loader);
    EvalStats {
        loss: tally.mean_loss(),
        accuracy: tally.accuracy(),
    }
}

/// Share (in percent) of samples classified as `target`.
///
/// Evaluated on a set of triggered inputs this is the attack success rate of
/// a backdoor towards `target`.
pub fn attack_success_rate(classifier: &DenseClassifier, loader: &Loader, target: usize) -> f64 {
    let mut hits = 0;
    let mut total = 0;
    for batch in loader.iter() {
        let stats = classifier.evaluate(batch.images.view(), batch.labels.view());
        hits += stats.predictions.iter().filter(|&&p| p == target).count();
        total += batch.len();
    }
    percent(hits, total)
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::arr1;

    use super::*;

    #[test]
    fn test_class_tally() {
        let mut tally = ClassTally::new(3);
        let stats = BatchStats {
            losses: arr1(&[0.5, 1.0, 2.0, 0.25]),
            predictions: arr1(&[0, 1, 0, 0]),
        };
        tally.add(&stats, &arr1(&[0, 0, 1, 0]));

        assert_eq!(tally.total(), 4);
        assert_relative_eq!(tally.accuracy(), 50.0);
        assert_eq!(tally.class_accuracies(), vec![200.0 / 3.0, 0.0, 0.0]);
        let losses = tally.class_losses();
        assert_relative_eq!(losses[0], 1.75 / 3.0);
        assert_relative_eq!(losses[1], 2.0);
        assert!(losses[2].is_nan());
        assert_relative_eq!(tally.mean_loss(), 3.75 / 4.0);
    }
}
