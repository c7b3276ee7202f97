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

//! First-order optimizers, gradient clipping and learning rate scheduling

use log::info;
use ndarray::{Array1, Array2, Zip};
use serde::{Deserialize, Serialize};

use super::linear::{Linear, LinearGrad};

/// Common interface of optimizers that update a sequence of [`Linear`] layers.
///
/// The order of `layers` and `grads` must be identical in every call.
pub trait Optimizer {
    fn step(&mut self, layers: &mut [&mut Linear], grads: &[LinearGrad]);
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

#[derive(Clone, Debug)]
struct Moments {
    first_w: Array2<f64>,
    second_w: Array2<f64>,
    first_b: Array1<f64>,
    second_b: Array1<f64>,
}

impl Moments {
    fn zeros_like(layer: &Linear) -> Moments {
        Moments {
            first_w: Array2::zeros(layer.weight.raw_dim()),
            second_w: Array2::zeros(layer.weight.raw_dim()),
            first_b: Array1::zeros(layer.bias.raw_dim()),
            second_b: Array1::zeros(layer.bias.raw_dim()),
        }
    }
}

/// Adam with either L2-coupled weight decay (`decoupled = false`) or the
/// decoupled decay of AdamW (`decoupled = true`).
#[derive(Clone, Debug)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    decoupled: bool,
    t: i32,
    moments: Vec<Moments>,
}

impl Adam {
    pub fn new(lr: f64, weight_decay: f64) -> Adam {
        Adam {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay,
            decoupled: false,
            t: 0,
            moments: Vec::new(),
        }
    }

    pub fn adamw(lr: f64, weight_decay: f64) -> Adam {
        Adam {
            decoupled: true,
            ..Adam::new(lr, weight_decay)
        }
    }

    pub fn steps(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, layers: &mut [&mut Linear], grads: &[LinearGrad]) {
        debug_assert_eq!(layers.len(), grads.len());
        if self.moments.is_empty() {
            self.moments = layers.iter().map(|l| Moments::zeros_like(l)).collect();
        }

        self.t += 1;
        let (b1, b2, eps, lr, wd) = (self.beta1, self.beta2, self.eps, self.lr, self.weight_decay);
        let correction1 = 1.0 - b1.powi(self.t);
        let correction2 = 1.0 - b2.powi(self.t);
        let decoupled = self.decoupled;

        let update = |p: &mut f64, g: f64, m: &mut f64, v: &mut f64| {
            let g = if decoupled {
                *p *= 1.0 - lr * wd;
                g
            } else {
                g + wd * *p
            };
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= lr * m_hat / (v_hat.sqrt() + eps);
        };

        for ((layer, grad), state) in layers.iter_mut().zip(grads).zip(&mut self.moments) {
            Zip::from(&mut layer.weight)
                .and(&grad.weight)
                .and(&mut state.first_w)
                .and(&mut state.second_w)
                .for_each(|p, &g, m, v| update(p, g, m, v));
            Zip::from(&mut layer.bias)
                .and(&grad.bias)
                .and(&mut state.first_b)
                .and(&mut state.second_b)
                .for_each(|p, &g, m, v| update(p, g, m, v));
        }
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Stochastic gradient descent with heavy-ball momentum and L2 weight decay.
#[derive(Clone, Debug)]
pub struct Sgd {
    lr: f64,
    momentum: f64,
    weight_decay: f64,
    buffers: Vec<(Array2<f64>, Array1<f64>)>,
}

impl Sgd {
    pub fn new(lr: f64, momentum: f64, weight_decay: f64) -> Sgd {
        Sgd {
            lr,
            momentum,
            weight_decay,
            buffers: Vec::new(),
        }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, layers: &mut [&mut Linear], grads: &[LinearGrad]) {
        debug_assert_eq!(layers.len(), grads.len());
        let first = self.buffers.is_empty();
        if first {
            self.buffers = layers
                .iter()
                .map(|l| (Array2::zeros(l.weight.raw_dim()), Array1::zeros(l.bias.raw_dim())))
                .collect();
        }

        let (lr, mu, wd) = (self.lr, self.momentum, self.weight_decay);
        let update = |p: &mut f64, g: f64, buf: &mut f64| {
            let g = g + wd * *p;
            *buf = if first { g } else { mu * *buf + g };
            *p -= lr * *buf;
        };

        for ((layer, grad), (buf_w, buf_b)) in layers.iter_mut().zip(grads).zip(&mut self.buffers) {
            Zip::from(&mut layer.weight)
                .and(&grad.weight)
                .and(buf_w)
                .for_each(|p, &g, b| update(p, g, b));
            Zip::from(&mut layer.bias)
                .and(&grad.bias)
                .and(buf_b)
                .for_each(|p, &g, b| update(p, g, b));
        }
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Rescales `grads` in place so that their joint L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. Non-finite norms are returned unchanged
/// and leave the gradients untouched.
pub fn clip_grad_norm(grads: &mut [LinearGrad], max_norm: f64) -> f64 {
    let total = grads.iter().map(|g| g.norm_sq()).sum::<f64>().sqrt();
    if !total.is_finite() {
        return total;
    }
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for g in grads.iter_mut() {
            g.scale(coef);
        }
    }
    total
}

/// Settings of [`ReduceLrOnPlateau`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlateauConfig {
    pub factor: f64,
    pub patience: usize,
    pub threshold: f64,
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        PlateauConfig {
            factor: 0.5,
            patience: 5,
            threshold: 1e-4,
            min_lr: 0.0,
        }
    }
}

/// Multiplies the learning rate by `factor` once a minimized metric has not
/// improved (relative to `threshold`) for more than `patience` steps.
#[derive(Clone, Debug)]
pub struct ReduceLrOnPlateau {
    config: PlateauConfig,
    best: f64,
    num_bad_epochs: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(config: PlateauConfig) -> ReduceLrOnPlateau {
        ReduceLrOnPlateau {
            config,
            best: f64::INFINITY,
            num_bad_epochs: 0,
        }
    }

    /// Records `metric` and adjusts the learning rate of `optimizer` if necessary.
    ///
    /// Returns true if the learning rate was reduced.
    pub fn step<O: Optimizer + ?Sized>(&mut self, metric: f64, optimizer: &mut O) -> bool {
        if metric < self.best * (1.0 - self.config.threshold) {
            self.best = metric;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.num_bad_epochs > self.config.patience {
            self.num_bad_epochs = 0;
            let old_lr = optimizer.learning_rate();
            let new_lr = (old_lr * self.config.factor).max(self.config.min_lr);
            if old_lr - new_lr > 1e-8 * old_lr.abs().max(f64::MIN_POSITIVE) {
                optimizer.set_learning_rate(new_lr);
                info!("Reducing learning rate from {:.3e} to {:.3e}", old_lr, new_lr);
                return true;
            }
        }
        false
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{arr1, arr2};

    use super::*;

    fn quadratic_grad(layer: &Linear) -> LinearGrad {
        // gradient of 0.5 * ||p||^2
        LinearGrad {
            weight: layer.weight.clone(),
            bias: layer.bias.clone(),
        }
    }

    #[test]
    fn test_adam_first_step_magnitude() {
        let mut layer = Linear::from_mats(arr2(&[[1.0, -2.0]]), arr1(&[0.5]));
        let grad = quadratic_grad(&layer);
        let mut opt = Adam::new(0.1, 0.0);
        opt.step(&mut [&mut layer], &[grad]);

        // the first bias-corrected Adam step moves every parameter by lr
        assert_relative_eq!(layer.weight, arr2(&[[0.9, -1.9]]), epsilon = 1e-6);
        assert_relative_eq!(layer.bias, arr1(&[0.4]), epsilon = 1e-6);
        assert_eq!(opt.steps(), 1);
    }

    #[test]
    fn test_adamw_decays_without_gradient() {
        let mut layer = Linear::from_mats(arr2(&[[2.0]]), arr1(&[0.0]));
        let zero = LinearGrad::zeros_like(&layer);
        let mut opt = Adam::adamw(0.1, 0.5);
        opt.step(&mut [&mut layer], &[zero]);

        assert_relative_eq!(layer.weight[[0, 0]], 2.0 * (1.0 - 0.05), epsilon = 1e-12);
    }

    #[test]
    fn test_sgd_converges_on_quadratic() {
        let mut layer = Linear::from_mats(arr2(&[[3.0, -1.0]]), arr1(&[2.0]));
        let mut opt = Sgd::new(0.1, 0.9, 0.0);
        for _ in 0..300 {
            let grad = quadratic_grad(&layer);
            opt.step(&mut [&mut layer], &[grad]);
        }
        assert!(layer.weight.iter().all(|w| w.abs() < 1e-3));
        assert!(layer.bias[0].abs() < 1e-3);
    }

    #[test]
    fn test_clip_grad_norm() {
        let layer = Linear::from_mats(arr2(&[[3.0]]), arr1(&[4.0]));
        let mut grads = vec![quadratic_grad(&layer)];
        let norm = clip_grad_norm(&mut grads, 1.0);

        assert_relative_eq!(norm, 5.0);
        assert_relative_eq!(grads[0].norm_sq().sqrt(), 1.0, epsilon = 1e-6);

        let mut small = vec![quadratic_grad(&layer)];
        clip_grad_norm(&mut small, 20.0);
        assert_relative_eq!(small[0].weight[[0, 0]], 3.0);
    }

    #[test]
    fn test_plateau_reduces_after_patience() {
        let mut opt = Adam::new(1.0, 0.0);
        let mut sched = ReduceLrOnPlateau::new(PlateauConfig {
            patience: 2,
            ..PlateauConfig::default()
        });

        assert!(!sched.step(1.0, &mut opt));
        assert!(!sched.step(1.0, &mut opt));
        assert!(!sched.step(1.0, &mut opt));
        assert!(sched.step(1.0, &mut opt));
        assert_relative_eq!(opt.learning_rate(), 0.5);

        assert!(!sched.step(0.5, &mut opt));
        assert_relative_eq!(sched.best(), 0.5);
    }
}
