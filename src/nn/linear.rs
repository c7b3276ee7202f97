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

//! Fully connected affine layers with manual backpropagation

use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

/// An affine map `x -> weight @ x + bias` applied row-wise to a batch.
///
/// The weight matrix has shape `outdim x indim`, matching the layout used by
/// common deep learning frameworks so that exported weights can be loaded
/// without transposition.
#[derive(Clone, Debug, PartialEq)]
pub struct Linear {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

/// Gradient of a scalar loss with respect to the parameters of a [`Linear`].
#[derive(Clone, Debug, PartialEq)]
pub struct LinearGrad {
    pub weight: Array2<f64>,
    pub bias: Array1<f64>,
}

impl Linear {
    /// Creates a layer from an explicit weight matrix and bias.
    pub fn from_mats(weight: Array2<f64>, bias: Array1<f64>) -> Linear {
        assert_eq!(
            weight.len_of(Axis(0)),
            bias.len_of(Axis(0)),
            "Dimensions mismatch of weight and bias: {} x {} and {}",
            weight.len_of(Axis(0)),
            weight.len_of(Axis(1)),
            bias.len_of(Axis(0))
        );
        Linear { weight, bias }
    }

    /// Creates a layer with all parameters set to zero.
    pub fn zeros(indim: usize, outdim: usize) -> Linear {
        Linear::from_mats(Array2::zeros((outdim, indim)), Array1::zeros(outdim))
    }

    /// Samples weights and bias uniformly from `[-1/sqrt(indim), 1/sqrt(indim)]`.
    pub fn init<R: Rng + ?Sized>(indim: usize, outdim: usize, rng: &mut R) -> Linear {
        assert!(indim > 0, "Layer input dimension must be positive");
        let bound = 1.0 / (indim as f64).sqrt();
        let dist = Uniform::new_inclusive(-bound, bound);
        Linear::from_mats(
            Array2::random_using((outdim, indim), dist, rng),
            Array1::random_using(outdim, dist, rng),
        )
    }

    #[inline]
    pub fn indim(&self) -> usize {
        self.weight.len_of(Axis(1))
    }

    #[inline]
    pub fn outdim(&self) -> usize {
        self.weight.len_of(Axis(0))
    }

    pub fn num_params(&self) -> usize {
        self.weight.len() + self.bias.len()
    }

    /// Applies the layer to every row of `input`.
    pub fn forward(&self, input: ArrayView2<f64>) -> Array2<f64> {
        input.dot(&self.weight.t()) + &self.bias
    }

    /// Propagates `grad_out` (gradient w.r.t. the outputs) back through the layer.
    ///
    /// Returns the parameter gradient and the gradient w.r.t. `input`.
    pub fn backward(
        &self,
        input: ArrayView2<f64>,
        grad_out: ArrayView2<f64>,
    ) -> (LinearGrad, Array2<f64>) {
        let grad = self.param_grad(input, grad_out);
        let grad_in = grad_out.dot(&self.weight);
        (grad, grad_in)
    }

    /// Same as [`Linear::backward`] without computing the input gradient.
    pub fn param_grad(&self, input: ArrayView2<f64>, grad_out: ArrayView2<f64>) -> LinearGrad {
        LinearGrad {
            weight: grad_out.t().dot(&input),
            bias: grad_out.sum_axis(Axis(0)),
        }
    }
}

impl LinearGrad {
    pub fn zeros_like(layer: &Linear) -> LinearGrad {
        LinearGrad {
            weight: Array2::zeros(layer.weight.raw_dim()),
            bias: Array1::zeros(layer.bias.raw_dim()),
        }
    }

    /// Squared L2 norm over weight and bias.
    pub fn norm_sq(&self) -> f64 {
        self.weight.iter().map(|x| x * x).sum::<f64>() + self.bias.iter().map(|x| x * x).sum::<f64>()
    }

    /// Adds `other` to this gradient.
    pub fn accumulate(&mut self, other: &LinearGrad) {
        self.weight += &other.weight;
        self.bias += &other.bias;
    }

    pub fn scale(&mut self, factor: f64) {
        self.weight *= factor;
        self.bias *= factor;
    }
}

/// Elementwise ReLU.
pub fn relu(x: &mut Array2<f64>) {
    x.mapv_inplace(|v| v.max(0.0));
}

/// Zeroes the entries of `grad` whose ReLU output `activation` was not positive.
pub fn relu_backward(grad: &mut Array2<f64>, activation: &Array2<f64>) {
    ndarray::Zip::from(grad)
        .and(activation)
        .for_each(|g, &a| {
            if a <= 0.0 {
                *g = 0.0;
            }
        });
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn test_forward() {
        let layer = Linear::from_mats(arr2(&[[1., 2.], [0., -1.], [3., 0.]]), arr1(&[0.5, 0., -1.]));
        let out = layer.forward(arr2(&[[1., 1.], [2., -1.]]).view());

        assert_relative_eq!(out, arr2(&[[3.5, -1., 2.], [0.5, 1., 5.]]));
    }

    #[test]
    fn test_backward_shapes() {
        let mut rng = StdRng::seed_from_u64(3);
        let layer = Linear::init(4, 3, &mut rng);
        let input = Array2::ones((5, 4));
        let (grad, grad_in) = layer.backward(input.view(), Array2::ones((5, 3)).view());

        assert_eq!(grad.weight.dim(), (3, 4));
        assert_eq!(grad.bias.len(), 3);
        assert_eq!(grad_in.dim(), (5, 4));
        assert_relative_eq!(grad.bias, arr1(&[5., 5., 5.]));
    }

    #[test]
    fn test_init_bounds() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::init(16, 8, &mut rng);
        let bound = 0.25;

        assert!(layer.weight.iter().all(|w| w.abs() <= bound));
        assert!(layer.bias.iter().all(|b| b.abs() <= bound));
        assert_eq!(layer.num_params(), 16 * 8 + 8);
    }

    #[test]
    fn test_relu_backward() {
        let mut act = arr2(&[[-1., 2.], [0., 3.]]);
        relu(&mut act);
        let mut grad = arr2(&[[1., 1.], [1., 1.]]);
        relu_backward(&mut grad, &act);

        assert_eq!(grad, arr2(&[[0., 1.], [0., 1.]]));
    }
}
