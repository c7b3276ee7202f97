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

//! Numerically stable scalar and reduction helpers

use ndarray::{Array1, ArrayView1};
use num_traits::Float;

/// Computes `log(sum(exp(values)))` without overflow.
///
/// Returns `-inf` for an empty input and `NaN` if any value is `NaN`.
pub fn logsumexp(values: ArrayView1<f64>) -> f64 {
    if values.iter().any(|v| v.is_nan()) {
        return f64::NAN;
    }
    let max = values.fold(f64::NEG_INFINITY, |acc, &v| acc.max(v));
    if max.is_infinite() {
        return max;
    }
    max + values.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Computes `log(mean(exp(values)))`.
pub fn logmeanexp(values: ArrayView1<f64>) -> f64 {
    logsumexp(values) - (values.len() as f64).ln()
}

/// Softmax of a vector, shifted by its maximum.
pub fn softmax(values: ArrayView1<f64>) -> Array1<f64> {
    let lse = logsumexp(values);
    values.mapv(|v| (v - lse).exp())
}

#[inline]
pub fn sigmoid<A: Float>(x: A) -> A {
    if x >= A::zero() {
        A::one() / (A::one() + (-x).exp())
    } else {
        let e = x.exp();
        e / (A::one() + e)
    }
}

/// `log(1 + exp(x))`
#[inline]
pub fn softplus<A: Float>(x: A) -> A {
    x.max(A::zero()) + (-x.abs()).exp().ln_1p()
}

/// `log(sigmoid(x))`
#[inline]
pub fn log_sigmoid<A: Float>(x: A) -> A {
    -softplus(-x)
}

/// Streaming `log(sum(exp(x)))` over values that arrive in chunks.
#[derive(Clone, Debug)]
pub struct RunningLogSumExp {
    max: f64,
    scaled_sum: f64,
    count: usize,
}

impl RunningLogSumExp {
    pub fn new() -> RunningLogSumExp {
        RunningLogSumExp {
            max: f64::NEG_INFINITY,
            scaled_sum: 0.0,
            count: 0,
        }
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if value.is_nan() || self.max.is_nan() {
            self.max = f64::NAN;
            return;
        }
        if value == f64::NEG_INFINITY {
            return;
        }
        if value > self.max {
            self.scaled_sum = self.scaled_sum * (self.max - value).exp() + 1.0;
            self.max = value;
        } else {
            self.scaled_sum += (value - self.max).exp();
        }
    }

    pub fn extend<'a, I: IntoIterator<Item = &'a f64>>(&mut self, values: I) {
        for v in values {
            self.push(*v);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn logsumexp(&self) -> f64 {
        if self.max.is_nan() {
            return f64::NAN;
        }
        if self.max == f64::NEG_INFINITY || self.max == f64::INFINITY {
            return self.max;
        }
        self.max + self.scaled_sum.ln()
    }

    /// `log(mean(exp(x)))` over all pushed values.
    pub fn logmeanexp(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.logsumexp() - (self.count as f64).ln()
    }
}

impl Default for RunningLogSumExp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::arr1;

    use super::*;

    #[test]
    fn test_logsumexp_large_values() {
        let v = arr1(&[1000., 1000.]);
        assert_relative_eq!(logsumexp(v.view()), 1000. + 2f64.ln());
        assert_relative_eq!(logmeanexp(v.view()), 1000., epsilon = 1e-12);
    }

    #[test]
    fn test_logsumexp_nan() {
        assert!(logsumexp(arr1(&[0., f64::NAN]).view()).is_nan());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let s = softmax(arr1(&[1., 2., 3., -700.]).view());
        assert_relative_eq!(s.sum(), 1.0, epsilon = 1e-12);
        assert!(s[2] > s[1]);
    }

    #[test]
    fn test_log_sigmoid() {
        assert_relative_eq!(log_sigmoid(0.0f64), 0.5f64.ln());
        assert_relative_eq!(log_sigmoid(-800.0f64), -800.0);
        assert_relative_eq!(sigmoid(800.0f64), 1.0);
        assert_relative_eq!(softplus(1.0f64), 1f64.exp().ln_1p(), epsilon = 1e-12);
    }

    #[test]
    fn test_running_matches_batch() {
        let values = arr1(&[0.3, -2., 5., 1.5, 700., -50.]);
        let mut running = RunningLogSumExp::new();
        running.extend(values.slice(ndarray::s![..3]));
        running.extend(values.slice(ndarray::s![3..]));

        assert_eq!(running.count(), 6);
        assert_relative_eq!(running.logsumexp(), logsumexp(values.view()), epsilon = 1e-10);
        assert_relative_eq!(running.logmeanexp(), logmeanexp(values.view()), epsilon = 1e-10);
    }
}
