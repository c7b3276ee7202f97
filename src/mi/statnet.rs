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

//! The statistics network `T(Y, Z)` scoring the compatibility of a
//! representation pair.
//!
//! `T` is an MLP over the concatenation `[y; z]`. Since the first layer is
//! affine, `W [y; z] + b = W_y y + W_z z + b`, the projections of every `y`
//! and every `z` of a batch are computed once and then combined per scored
//! pair. This makes scoring a full `batch x batch` cross join or a list of
//! sampled negatives about as cheap as scoring the positive pairs.

use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::Rng;

use crate::error::{Error, Result};
use crate::nn::linear::{relu, relu_backward, Linear, LinearGrad};

/// A pair `(y_row, z_row)` referring to rows of the `Y` and `Z` batches.
pub type PairIndex = (usize, usize);

#[derive(Clone, Debug)]
pub struct StatisticsNetwork {
    y_dim: usize,
    z_dim: usize,
    /// First layer over `[y; z]`, followed by the hidden layers and the
    /// scalar output layer
    layers: Vec<Linear>,
}

/// Intermediate values of a forward pass, needed for the backward pass.
#[derive(Clone, Debug)]
pub struct Scored {
    /// Post-ReLU activations of every hidden layer, one row per pair
    hidden: Vec<Array2<f64>>,
    pub scores: Array1<f64>,
}

impl StatisticsNetwork {
    /// Creates `T` with `depth` hidden ReLU layers of width `hidden`.
    pub fn new<R: Rng + ?Sized>(
        y_dim: usize,
        z_dim: usize,
        hidden: usize,
        depth: usize,
        rng: &mut R,
    ) -> Result<StatisticsNetwork> {
        if y_dim == 0 || z_dim == 0 || hidden == 0 || depth == 0 {
            return Err(Error::InvalidConfig(format!(
                "statistics network needs positive dimensions, got y: {}, z: {}, hidden: {}, depth: {}",
                y_dim, z_dim, hidden, depth
            )));
        }
        let mut layers = Vec::with_capacity(depth + 1);
        layers.push(Linear::init(y_dim + z_dim, hidden, rng));
        for _ in 1..depth {
            layers.push(Linear::init(hidden, hidden, rng));
        }
        layers.push(Linear::init(hidden, 1, rng));
        Ok(StatisticsNetwork { y_dim, z_dim, layers })
    }

    pub fn y_dim(&self) -> usize {
        self.y_dim
    }

    pub fn z_dim(&self) -> usize {
        self.z_dim
    }

    /// Declared input dimension `dim_Y + dim_Z`.
    pub fn in_dim(&self) -> usize {
        self.y_dim + self.z_dim
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(Linear::num_params).sum()
    }

    pub fn layers_mut(&mut self) -> Vec<&mut Linear> {
        self.layers.iter_mut().collect()
    }

    fn check_dims(&self, y: &ArrayView2<f64>, z: &ArrayView2<f64>) -> Result<()> {
        if y.ncols() != self.y_dim {
            return Err(Error::Shape {
                expected: self.y_dim,
                got: y.ncols(),
            });
        }
        if z.ncols() != self.z_dim {
            return Err(Error::Shape {
                expected: self.z_dim,
                got: z.ncols(),
            });
        }
        Ok(())
    }

    /// Scores the pairs `(y[i], z[j])` for every `(i, j)` in `pairs`.
    pub fn forward(&self, y: ArrayView2<f64>, z: ArrayView2<f64>, pairs: &[PairIndex]) -> Result<Scored> {
        self.check_dims(&y, &z)?;
        for &(i, j) in pairs {
            if i >= y.nrows() {
                return Err(Error::IndexOutOfBounds { index: i, len: y.nrows() });
            }
            if j >= z.nrows() {
                return Err(Error::IndexOutOfBounds { index: j, len: z.nrows() });
            }
        }

        let first = &self.layers[0];
        let w_y = first.weight.slice(s![.., ..self.y_dim]);
        let w_z = first.weight.slice(s![.., self.y_dim..]);
        let proj_y = y.dot(&w_y.t());
        let proj_z = z.dot(&w_z.t()) + &first.bias;

        let mut act = Array2::zeros((pairs.len(), first.outdim()));
        for (mut row, &(i, j)) in act.outer_iter_mut().zip(pairs) {
            row.assign(&proj_y.row(i));
            row += &proj_z.row(j);
        }
        relu(&mut act);

        let mut hidden = Vec::with_capacity(self.layers.len() - 1);
        hidden.push(act);
        let last = self.layers.len() - 1;
        for layer in &self.layers[1..last] {
            let mut out = layer.forward(hidden[hidden.len() - 1].view());
            relu(&mut out);
            hidden.push(out);
        }
        let scores = self.layers[last]
            .forward(hidden[hidden.len() - 1].view())
            .index_axis_move(Axis(1), 0);
        Ok(Scored { hidden, scores })
    }

    /// Convenience for scoring without keeping the activations.
    pub fn score(&self, y: ArrayView2<f64>, z: ArrayView2<f64>, pairs: &[PairIndex]) -> Result<Array1<f64>> {
        Ok(self.forward(y, z, pairs)?.scores)
    }

    /// Backpropagates `d_scores` (gradient of the loss per scored pair) to the
    /// parameters of `T`. `Y` and `Z` are treated as constants.
    pub fn backward(
        &self,
        scored: &Scored,
        y: ArrayView2<f64>,
        z: ArrayView2<f64>,
        pairs: &[PairIndex],
        d_scores: ArrayView1<f64>,
    ) -> Vec<LinearGrad> {
        debug_assert_eq!(d_scores.len(), pairs.len());
        let last = self.layers.len() - 1;
        let mut grads = Vec::with_capacity(self.layers.len());

        let d_out = d_scores.insert_axis(Axis(1));
        let (grad, mut d_act) = self.layers[last].backward(scored.hidden[last - 1].view(), d_out);
        grads.push(grad);

        for idx in (1..last).rev() {
            relu_backward(&mut d_act, &scored.hidden[idx]);
            let (grad, d_in) = self.layers[idx].backward(scored.hidden[idx - 1].view(), d_act.view());
            grads.push(grad);
            d_act = d_in;
        }
        relu_backward(&mut d_act, &scored.hidden[0]);

        // scatter the per-pair gradient back onto the rows of Y and Z
        let width = self.layers[0].outdim();
        let mut d_proj_y = Array2::<f64>::zeros((y.nrows(), width));
        let mut d_proj_z = Array2::<f64>::zeros((z.nrows(), width));
        for (row, &(i, j)) in d_act.outer_iter().zip(pairs) {
            let mut target = d_proj_y.row_mut(i);
            target += &row;
            let mut target = d_proj_z.row_mut(j);
            target += &row;
        }
        let mut first = LinearGrad::zeros_like(&self.layers[0]);
        first.weight.slice_mut(s![.., ..self.y_dim]).assign(&d_proj_y.t().dot(&y));
        first.weight.slice_mut(s![.., self.y_dim..]).assign(&d_proj_z.t().dot(&z));
        first.bias = d_act.sum_axis(Axis(0));
        grads.push(first);

        grads.reverse();
        grads
    }
}

/// The pairs `(i, i)` of a batch of size `n`.
pub fn positive_pairs(n: usize) -> Vec<PairIndex> {
    (0..n).map(|i| (i, i)).collect()
}
