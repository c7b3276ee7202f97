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

//! A dense reference classifier with a channel x spatial penultimate feature map

use std::fmt::Display;

use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::classifier::{
    Classifier, ClassifierDims, ClassifierOutput, FeatureMap, Tap, TapHandle, TapRegistry,
};
use super::snapshot::ClassifierSnapshot;
use crate::data::dataset::ImageShape;
use crate::error::{Error, Result};
use crate::nn::linear::{relu, relu_backward, Linear, LinearGrad};
use crate::nn::numeric::logsumexp;
use crate::nn::optim::Optimizer;

/// Layer sizes of a [`DenseClassifier`].
///
/// The trunk maps the flattened image through `hidden` ReLU layers into a
/// ReLU feature map of `feature_channels x feature_spatial` units, which is
/// average pooled per channel and fed into a linear head.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DenseArchitecture {
    pub input: ImageShape,
    pub hidden: Vec<usize>,
    pub feature_channels: usize,
    pub feature_spatial: usize,
    pub num_classes: usize,
}

impl DenseArchitecture {
    /// `(indim, outdim)` of every layer, trunk first, head last.
    pub fn layer_dims(&self) -> Vec<(usize, usize)> {
        let trunk = std::iter::once(self.input.flat_dim())
            .chain(self.hidden.iter().copied())
            .chain(std::iter::once(self.feature_channels * self.feature_spatial))
            .tuple_windows::<(_, _)>();
        trunk
            .chain(std::iter::once((self.feature_channels, self.num_classes)))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let dims = self.layer_dims();
        if dims.iter().any(|&(i, o)| i == 0 || o == 0) {
            return Err(Error::InvalidConfig(format!(
                "classifier architecture has an empty layer: {}",
                self
            )));
        }
        Ok(())
    }
}

impl Display for DenseArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> ", self.input)?;
        for h in &self.hidden {
            write!(f, "{} -> ", h)?;
        }
        write!(
            f,
            "[{}x{}] -> pool -> {}",
            self.feature_channels, self.feature_spatial, self.num_classes
        )
    }
}

/// Loss and accuracy statistics of one training or evaluation batch.
#[derive(Clone, Debug)]
pub struct BatchStats {
    /// Cross-entropy of every sample
    pub losses: Array1<f64>,
    pub predictions: Array1<usize>,
}

impl BatchStats {
    pub fn mean_loss(&self) -> f64 {
        self.losses.mean().unwrap_or(f64::NAN)
    }

    pub fn correct(&self, labels: ArrayView1<usize>) -> usize {
        self.predictions
            .iter()
            .zip(labels.iter())
            .filter(|(p, l)| p == l)
            .count()
    }
}

struct Activations {
    /// Input followed by the ReLU output of every trunk layer
    trunk: Vec<Array2<f64>>,
    pooled: Array2<f64>,
    logits: Array2<f64>,
}

#[derive(Debug)]
pub struct DenseClassifier {
    arch: DenseArchitecture,
    trunk: Vec<Linear>,
    head: Linear,
    taps: TapRegistry,
}

impl DenseClassifier {
    pub fn new<R: Rng + ?Sized>(arch: DenseArchitecture, rng: &mut R) -> Result<DenseClassifier> {
        arch.validate()?;
        let mut layers = arch
            .layer_dims()
            .into_iter()
            .map(|(i, o)| Linear::init(i, o, rng))
            .collect::<Vec<_>>();
        let head = layers.pop().ok_or_else(|| Error::InvalidConfig("classifier without layers".to_string()))?;
        Ok(DenseClassifier {
            arch,
            trunk: layers,
            head,
            taps: TapRegistry::new(),
        })
    }

    /// Rebuilds an independent classifier from a weight snapshot.
    pub fn from_snapshot(snapshot: &ClassifierSnapshot) -> DenseClassifier {
        DenseClassifier {
            arch: snapshot.architecture().clone(),
            trunk: snapshot.trunk().to_vec(),
            head: snapshot.head().clone(),
            taps: TapRegistry::new(),
        }
    }

    pub fn snapshot(&self) -> ClassifierSnapshot {
        ClassifierSnapshot::from_parts(self.arch.clone(), self.trunk.clone(), self.head.clone())
    }

    pub fn architecture(&self) -> &DenseArchitecture {
        &self.arch
    }

    fn layers_mut(&mut self) -> Vec<&mut Linear> {
        self.trunk.iter_mut().chain(std::iter::once(&mut self.head)).collect()
    }

    fn feature_map(&self, trunk_out: &Array2<f64>) -> FeatureMap {
        FeatureMap::new(trunk_out.clone(), self.arch.feature_channels, self.arch.feature_spatial)
    }

    fn activations(&self, images: ArrayView2<f64>) -> Activations {
        let mut trunk = Vec::with_capacity(self.trunk.len() + 1);
        trunk.push(images.to_owned());
        for layer in &self.trunk {
            let mut out = layer.forward(trunk[trunk.len() - 1].view());
            relu(&mut out);
            trunk.push(out);
        }
        let map = self.feature_map(&trunk[trunk.len() - 1]);
        let pooled = map.global_avg_pool();
        let logits = self.head.forward(pooled.view());
        Activations {
            trunk,
            pooled,
            logits,
        }
    }

    /// Cross-entropy and predictions without updating any weights.
    pub fn evaluate(&self, images: ArrayView2<f64>, labels: ArrayView1<usize>) -> BatchStats {
        let logits = self.forward(images).logits;
        batch_stats(&logits, labels)
    }

    /// Performs one optimizer step on the mean cross-entropy of the batch.
    ///
    /// Statistics are computed from the logits before the update.
    pub fn train_step<O: Optimizer + ?Sized>(
        &mut self,
        images: ArrayView2<f64>,
        labels: ArrayView1<usize>,
        optimizer: &mut O,
    ) -> BatchStats {
        let acts = self.activations(images);
        let stats = batch_stats(&acts.logits, labels);
        let grads = self.backward(&acts, labels);
        optimizer.step(&mut self.layers_mut(), &grads);
        stats
    }

    fn backward(&self, acts: &Activations, labels: ArrayView1<usize>) -> Vec<LinearGrad> {
        let n = labels.len() as f64;
        let mut d_logits = acts.logits.clone();
        for (mut row, &label) in d_logits.outer_iter_mut().zip(labels.iter()) {
            let lse = logsumexp(row.view());
            row.mapv_inplace(|v| (v - lse).exp() / n);
            row[label] -= 1.0 / n;
        }

        let (head_grad, d_pooled) = self.head.backward(acts.pooled.view(), d_logits.view());

        let spatial = self.arch.feature_spatial;
        let mut d_out = Array2::zeros((d_pooled.len_of(Axis(0)), self.arch.feature_channels * spatial));
        for (mut d_row, p_row) in d_out.outer_iter_mut().zip(d_pooled.outer_iter()) {
            for (idx, value) in d_row.iter_mut().enumerate() {
                *value = p_row[idx / spatial] / spatial as f64;
            }
        }

        let mut grads = Vec::with_capacity(self.trunk.len() + 1);
        for (idx, layer) in self.trunk.iter().enumerate().rev() {
            relu_backward(&mut d_out, &acts.trunk[idx + 1]);
            let (grad, d_in) = layer.backward(acts.trunk[idx].view(), d_out.view());
            grads.push(grad);
            d_out = d_in;
        }
        grads.reverse();
        grads.push(head_grad);
        grads
    }
}

fn batch_stats(logits: &Array2<f64>, labels: ArrayView1<usize>) -> BatchStats {
    let mut losses = Array1::zeros(labels.len());
    let mut predictions = Array1::zeros(labels.len());
    for (idx, (row, &label)) in logits.outer_iter().zip(labels.iter()).enumerate() {
        losses[idx] = logsumexp(row.view()) - row[label];
        predictions[idx] = argmax(row.view());
    }
    BatchStats {
        losses,
        predictions,
    }
}

/// Index of the largest entry; the first one wins ties.
pub fn argmax(row: ArrayView1<f64>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |(best, max), (idx, &v)| {
            if v > max {
                (idx, v)
            } else {
                (best, max)
            }
        })
        .0
}

impl Classifier for DenseClassifier {
    fn dims(&self) -> ClassifierDims {
        ClassifierDims {
            input: self.arch.input.flat_dim(),
            feature_channels: self.arch.feature_channels,
            num_classes: self.arch.num_classes,
        }
    }

    fn forward(&self, images: ArrayView2<f64>) -> ClassifierOutput {
        let acts = self.activations(images);
        if !self.taps.is_empty() {
            let map = self.feature_map(&acts.trunk[acts.trunk.len() - 1]);
            self.taps.fire(&map);
        }
        ClassifierOutput {
            features: acts.pooled,
            logits: acts.logits,
        }
    }

    fn register_tap(&mut self, tap: Tap) -> TapHandle {
        self.taps.register(tap)
    }

    fn remove_tap(&mut self, handle: TapHandle) {
        self.taps.remove(handle)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{arr1, Array};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::model::classifier::ActivationSlot;
    use crate::nn::optim::Sgd;

    pub fn small_arch() -> DenseArchitecture {
        DenseArchitecture {
            input: ImageShape::new(1, 2, 2),
            hidden: vec![8],
            feature_channels: 3,
            feature_spatial: 2,
            num_classes: 2,
        }
    }

    #[test]
    fn test_layer_dims() {
        assert_eq!(small_arch().layer_dims(), vec![(4, 8), (8, 6), (3, 2)]);
    }

    #[test]
    fn test_forward_shapes_and_tap() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut clf = DenseClassifier::new(small_arch(), &mut rng).unwrap();
        let slot = ActivationSlot::new();
        let handle = clf.register_tap(slot.tap());

        let out = clf.forward(Array::ones((5, 4)).view());
        assert_eq!(out.features.dim(), (5, 3));
        assert_eq!(out.logits.dim(), (5, 2));

        let map = slot.take().unwrap();
        assert_eq!(map.data.dim(), (5, 6));
        assert_relative_eq!(map.global_avg_pool(), out.features);

        clf.remove_tap(handle);
        clf.forward(Array::ones((1, 4)).view());
        assert!(slot.is_empty());
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let clf = DenseClassifier::new(small_arch(), &mut rng).unwrap();
        let images = Array::from_shape_fn((3, 4), |(i, j)| ((i + 1) * (j + 2)) as f64 * 0.1 - 0.4);
        let labels = arr1(&[0, 1, 1]);

        let acts = clf.activations(images.view());
        let grads = clf.backward(&acts, labels.view());

        let eps = 1e-6;
        for (layer_idx, row, col) in [(0, 2, 1), (1, 4, 7), (2, 1, 2)] {
            let mut plus = DenseClassifier::from_snapshot(&clf.snapshot());
            let mut minus = DenseClassifier::from_snapshot(&clf.snapshot());
            plus.layers_mut()[layer_idx].weight[[row, col]] += eps;
            minus.layers_mut()[layer_idx].weight[[row, col]] -= eps;
            let numeric = (plus.evaluate(images.view(), labels.view()).mean_loss()
                - minus.evaluate(images.view(), labels.view()).mean_loss())
                / (2.0 * eps);

            assert_relative_eq!(grads[layer_idx].weight[[row, col]], numeric, epsilon = 1e-6, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut clf = DenseClassifier::new(small_arch(), &mut rng).unwrap();
        let images = Array::from_shape_fn((8, 4), |(i, j)| if i % 2 == 0 { j as f64 } else { -(j as f64) });
        let labels = Array::from_shape_fn(8, |i| i % 2);
        let mut opt = Sgd::new(0.1, 0.9, 0.0);

        let before = clf.evaluate(images.view(), labels.view()).mean_loss();
        for _ in 0..200 {
            clf.train_step(images.view(), labels.view(), &mut opt);
        }
        let after = clf.evaluate(images.view(), labels.view());

        assert!(after.mean_loss() < before);
        assert_eq!(after.correct(labels.view()), 8);
    }
}
