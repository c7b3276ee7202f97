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

//! Variational lower bounds on mutual information.
//!
//! Every bound consumes the scores `t = T(y_i, z_i)` of the positive pairs
//! and the scores `t2` of a set of negative pairs chosen by the bound, and
//! returns a loss to minimize together with its gradient with respect to
//! every score. The gradients are backpropagated through
//! [`StatisticsNetwork`](super::statnet::StatisticsNetwork) by the caller.

use std::fmt::Display;
use std::str::FromStr;

use log::trace;
use ndarray::{s, Array1, ArrayView1};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use super::statnet::PairIndex;
use crate::error::{Error, Result};
use crate::nn::numeric::{log_sigmoid, logmeanexp, logsumexp, sigmoid, softmax, RunningLogSumExp};

/// Decay rate of the moving average of `mean(exp(t2))` used by [`DonskerVaradhan`].
pub const EMA_RATE: f64 = 0.01;

/// What to record for a batch whose loss is NaN or infinite.
///
/// The optimizer step is skipped in both cases. With `RepeatLast` the epoch
/// statistics receive the contribution of the previous valid batch again, so
/// that every batch is represented; with `SkipBatch` the batch is dropped
/// and the epoch statistics are taken over the valid batches only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NonFinitePolicy {
    RepeatLast,
    SkipBatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EstimatorKind {
    #[serde(rename = "DV")]
    DonskerVaradhan,
    #[serde(rename = "infoNCE")]
    InfoNce,
    #[serde(rename = "infoNCE-sampled")]
    InfoNceSampled,
    #[serde(rename = "JSD")]
    JensenShannon,
}

impl EstimatorKind {
    /// Creates a fresh bound with its own (empty) state.
    pub fn build(self, num_negatives: usize, policy: NonFinitePolicy) -> Result<Box<dyn MiBound>> {
        Ok(match self {
            EstimatorKind::DonskerVaradhan => Box::new(DonskerVaradhan::new(policy)),
            EstimatorKind::InfoNce => Box::new(InfoNce),
            EstimatorKind::InfoNceSampled => Box::new(InfoNceSampled::new(num_negatives)?),
            EstimatorKind::JensenShannon => Box::new(JensenShannon),
        })
    }
}

impl Display for EstimatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EstimatorKind::DonskerVaradhan => "DV",
            EstimatorKind::InfoNce => "infoNCE",
            EstimatorKind::InfoNceSampled => "infoNCE-sampled",
            EstimatorKind::JensenShannon => "JSD",
        };
        f.write_str(name)
    }
}

impl FromStr for EstimatorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dv" => Ok(EstimatorKind::DonskerVaradhan),
            "infonce" => Ok(EstimatorKind::InfoNce),
            "infonce-sampled" => Ok(EstimatorKind::InfoNceSampled),
            "jsd" => Ok(EstimatorKind::JensenShannon),
            _ => Err(Error::UnsupportedEstimator(s.to_string())),
        }
    }
}

/// Loss of one batch and its gradient with respect to every score.
#[derive(Clone, Debug)]
pub struct Objective {
    pub loss: f64,
    /// Gradient with respect to the positive scores `t`
    pub d_positive: Array1<f64>,
    /// Gradient with respect to the negative scores `t2`
    pub d_negative: Array1<f64>,
    /// Per-sample log-ratio diffs, for bounds that define one
    pub sample_scores: Option<Array1<f64>>,
}

impl Objective {
    pub fn is_finite(&self) -> bool {
        self.loss.is_finite()
    }
}

/// A variational MI lower bound.
///
/// A bound may carry state across batches (the moving average of DV); a new
/// bound is built for every estimation run.
pub trait MiBound: Send {
    fn kind(&self) -> EstimatorKind;

    /// Negative pairs for a batch of `n` samples, in the order expected by
    /// [`MiBound::objective`].
    fn negative_pairs(&self, n: usize, rng: &mut dyn RngCore) -> Vec<PairIndex>;

    fn objective(&mut self, t: ArrayView1<f64>, t2: ArrayView1<f64>) -> Objective;

    /// Resets per-epoch statistics.
    fn begin_epoch(&mut self) {}

    /// MI point estimate of the finished epoch given its mean loss.
    fn epoch_estimate(&self, mean_loss: f64) -> f64 {
        -mean_loss
    }
}

fn shuffled_pairs(n: usize, rng: &mut dyn RngCore) -> Vec<PairIndex> {
    let mut perm = (0..n).collect::<Vec<_>>();
    perm.shuffle(rng);
    perm.into_iter().enumerate().collect()
}

/// The Donsker-Varadhan bound `mean(t) - log(mean(exp(t2)))` with shuffled
/// negatives.
///
/// After the first batch the gradient of the log term is replaced by a
/// control variate: `mean(t2 * exp(t2)) / ema` with the weights
/// `exp(t2)` held constant, where `ema` is a moving average of
/// `mean(exp(t2))`. The moving average lives as long as the bound.
#[derive(Clone, Debug)]
pub struct DonskerVaradhan {
    policy: NonFinitePolicy,
    ema: Option<f64>,
    sum_t: f64,
    count_t: usize,
    lse_t2: RunningLogSumExp,
    last: Option<(Array1<f64>, Array1<f64>)>,
}

impl DonskerVaradhan {
    pub fn new(policy: NonFinitePolicy) -> DonskerVaradhan {
        DonskerVaradhan {
            policy,
            ema: None,
            sum_t: 0.0,
            count_t: 0,
            lse_t2: RunningLogSumExp::new(),
            last: None,
        }
    }

    pub fn ema(&self) -> Option<f64> {
        self.ema
    }

    fn record(&mut self, t: &Array1<f64>, t2: &Array1<f64>) {
        self.sum_t += t.sum();
        self.count_t += t.len();
        self.lse_t2.extend(t2.iter());
    }
}

impl MiBound for DonskerVaradhan {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::DonskerVaradhan
    }

    fn negative_pairs(&self, n: usize, rng: &mut dyn RngCore) -> Vec<PairIndex> {
        shuffled_pairs(n, rng)
    }

    fn objective(&mut self, t: ArrayView1<f64>, t2: ArrayView1<f64>) -> Objective {
        let n = t.len() as f64;
        let m = t2.len() as f64;
        let mean_t = t.mean().unwrap_or(f64::NAN);
        let exp_t2 = t2.mapv(f64::exp);
        let mean_exp = exp_t2.mean().unwrap_or(f64::NAN);

        let (loss, d_negative, ema) = match self.ema {
            None => {
                let loss = -(mean_t - logmeanexp(t2));
                (loss, softmax(t2), mean_exp)
            }
            Some(ema) => {
                let ema = (1.0 - EMA_RATE) * ema + EMA_RATE * mean_exp;
                let weighted = t2.iter().zip(&exp_t2).map(|(a, b)| a * b).sum::<f64>() / m;
                let loss = -(mean_t - weighted / ema);
                (loss, &exp_t2 / (m * ema), ema)
            }
        };

        let objective = Objective {
            loss,
            d_positive: Array1::from_elem(t.len(), -1.0 / n),
            d_negative,
            sample_scores: None,
        };

        if objective.is_finite() && ema.is_finite() {
            self.ema = Some(ema);
            let batch = (t.to_owned(), t2.to_owned());
            self.record(&batch.0, &batch.1);
            self.last = Some(batch);
        } else if self.policy == NonFinitePolicy::RepeatLast {
            if let Some((t, t2)) = self.last.take() {
                trace!("Repeating the previous DV batch in place of a non-finite one");
                self.record(&t, &t2);
                self.last = Some((t, t2));
            }
        }
        objective
    }

    fn begin_epoch(&mut self) {
        self.sum_t = 0.0;
        self.count_t = 0;
        self.lse_t2 = RunningLogSumExp::new();
    }

    /// `mean(all t) - log(mean(all exp(t2)))` over the recorded batches.
    fn epoch_estimate(&self, _mean_loss: f64) -> f64 {
        if self.count_t == 0 {
            return f64::NAN;
        }
        self.sum_t / self.count_t as f64 - self.lse_t2.logmeanexp()
    }
}

/// InfoNCE over the full `batch x batch` cross join of the batch.
#[derive(Clone, Copy, Debug, Default)]
pub struct InfoNce;

impl MiBound for InfoNce {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::InfoNce
    }

    /// All pairs `(i, j)`, row-major in `i`.
    fn negative_pairs(&self, n: usize, _rng: &mut dyn RngCore) -> Vec<PairIndex> {
        (0..n).flat_map(|i| (0..n).map(move |j| (i, j))).collect()
    }

    fn objective(&mut self, t: ArrayView1<f64>, t2: ArrayView1<f64>) -> Objective {
        let n = t.len();
        debug_assert_eq!(t2.len(), n * n);
        let nf = n as f64;

        let mut d_negative = Array1::zeros(t2.len());
        let mut diffs = Array1::zeros(n);
        for (i, row) in t2.exact_chunks(n).into_iter().enumerate() {
            let marginal = logmeanexp(row);
            diffs[i] = t[i] - marginal;
            let weights = softmax(row) / nf;
            d_negative.slice_mut(s![i * n..(i + 1) * n]).assign(&weights);
        }

        Objective {
            loss: -diffs.mean().unwrap_or(f64::NAN),
            d_positive: Array1::from_elem(n, -1.0 / nf),
            d_negative,
            sample_scores: Some(diffs),
        }
    }
}

/// InfoNCE with `num_negatives` negatives per anchor, drawn with replacement
/// from the batch.
///
/// The per-sample diff `t_i - logsumexp([t_i, t2_i1, ..]) + log(K + 1)` is
/// the per-sample anomaly score.
#[derive(Clone, Copy, Debug)]
pub struct InfoNceSampled {
    num_negatives: usize,
}

impl InfoNceSampled {
    pub fn new(num_negatives: usize) -> Result<InfoNceSampled> {
        if num_negatives == 0 {
            return Err(Error::InvalidConfig(
                "sampled InfoNCE needs at least one negative sample".to_string(),
            ));
        }
        Ok(InfoNceSampled { num_negatives })
    }

    pub fn num_negatives(&self) -> usize {
        self.num_negatives
    }
}

impl MiBound for InfoNceSampled {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::InfoNceSampled
    }

    fn negative_pairs(&self, n: usize, rng: &mut dyn RngCore) -> Vec<PairIndex> {
        let mut pairs = Vec::with_capacity(n * self.num_negatives);
        for i in 0..n {
            for _ in 0..self.num_negatives {
                pairs.push((i, rng.gen_range(0..n)));
            }
        }
        pairs
    }

    fn objective(&mut self, t: ArrayView1<f64>, t2: ArrayView1<f64>) -> Objective {
        let n = t.len();
        let k = self.num_negatives;
        debug_assert_eq!(t2.len(), n * k);
        let nf = n as f64;
        let offset = ((k + 1) as f64).ln();

        let mut d_positive = Array1::zeros(n);
        let mut d_negative = Array1::zeros(t2.len());
        let mut diffs = Array1::zeros(n);
        let mut logits = Array1::zeros(k + 1);
        for (i, row) in t2.exact_chunks(k).into_iter().enumerate() {
            logits[0] = t[i];
            logits.slice_mut(s![1..]).assign(&row);
            let lse = logsumexp(logits.view());
            diffs[i] = t[i] - lse + offset;

            let weights = logits.mapv(|v| (v - lse).exp());
            d_positive[i] = -(1.0 - weights[0]) / nf;
            d_negative
                .slice_mut(s![i * k..(i + 1) * k])
                .assign(&(weights.slice(s![1..]).to_owned() / nf));
        }

        Objective {
            loss: -diffs.mean().unwrap_or(f64::NAN),
            d_positive,
            d_negative,
            sample_scores: Some(diffs),
        }
    }
}

/// The Jensen-Shannon bound with shuffled negatives.
#[derive(Clone, Copy, Debug, Default)]
pub struct JensenShannon;

impl MiBound for JensenShannon {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::JensenShannon
    }

    fn negative_pairs(&self, n: usize, rng: &mut dyn RngCore) -> Vec<PairIndex> {
        shuffled_pairs(n, rng)
    }

    fn objective(&mut self, t: ArrayView1<f64>, t2: ArrayView1<f64>) -> Objective {
        let n = t.len() as f64;
        let m = t2.len() as f64;
        // log(1 - sigmoid(x)) = log_sigmoid(-x)
        let positive = t.mapv(log_sigmoid).mean().unwrap_or(f64::NAN);
        let negative = t2.mapv(|v| log_sigmoid(-v)).mean().unwrap_or(f64::NAN);

        Objective {
            loss: -(positive + negative),
            d_positive: t.mapv(|v| -(1.0 - sigmoid(v)) / n),
            d_negative: t2.mapv(|v| sigmoid(v) / m),
            sample_scores: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::{arr1, Array};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    /// Checks `objective` gradients against central differences of the loss.
    fn check_gradients<B: MiBound + Clone>(bound: &B, t: &Array1<f64>, t2: &Array1<f64>) {
        let eps = 1e-6;
        let objective = bound.clone().objective(t.view(), t2.view());
        for i in 0..t.len() {
            let (mut plus, mut minus) = (t.clone(), t.clone());
            plus[i] += eps;
            minus[i] -= eps;
            let numeric = (bound.clone().objective(plus.view(), t2.view()).loss
                - bound.clone().objective(minus.view(), t2.view()).loss)
                / (2.0 * eps);
            assert_relative_eq!(objective.d_positive[i], numeric, epsilon = 1e-7, max_relative = 1e-5);
        }
        for j in 0..t2.len() {
            let (mut plus, mut minus) = (t2.clone(), t2.clone());
            plus[j] += eps;
            minus[j] -= eps;
            let numeric = (bound.clone().objective(t.view(), plus.view()).loss
                - bound.clone().objective(t.view(), minus.view()).loss)
                / (2.0 * eps);
            assert_relative_eq!(objective.d_negative[j], numeric, epsilon = 1e-7, max_relative = 1e-5);
        }
    }

    #[test]
    fn test_estimator_names() {
        for kind in [
            EstimatorKind::DonskerVaradhan,
            EstimatorKind::InfoNce,
            EstimatorKind::InfoNceSampled,
            EstimatorKind::JensenShannon,
        ] {
            assert_eq!(kind.to_string().parse::<EstimatorKind>().unwrap(), kind);
        }
        assert!(matches!("MINE".parse::<EstimatorKind>(), Err(Error::UnsupportedEstimator(_))));
        assert!(EstimatorKind::InfoNceSampled.build(0, NonFinitePolicy::SkipBatch).is_err());
    }

    #[test]
    fn test_infonce_gradients() {
        let t = arr1(&[0.3, -1.2, 2.0]);
        let t2 = Array::from_shape_fn(9, |i| (i as f64 * 0.7).cos());
        check_gradients(&InfoNce, &t, &t2);
    }

    #[test]
    fn test_sampled_infonce_gradients() {
        let t = arr1(&[0.3, -1.2, 2.0]);
        let t2 = Array::from_shape_fn(12, |i| (i as f64 * 0.4).sin() * 2.0);
        check_gradients(&InfoNceSampled::new(4).unwrap(), &t, &t2);
    }

    #[test]
    fn test_jsd_gradients() {
        let t = arr1(&[0.3, -1.2, 2.0, 0.1]);
        let t2 = arr1(&[-0.5, 1.5, 0.0, -2.5]);
        check_gradients(&JensenShannon, &t, &t2);
    }

    #[test]
    fn test_dv_gradients_first_batch_and_with_ema() {
        let t = arr1(&[0.3, -1.2, 2.0, 0.1]);
        let t2 = arr1(&[-0.5, 1.5, 0.0, -2.5]);
        let fresh = DonskerVaradhan::new(NonFinitePolicy::SkipBatch);
        check_gradients(&fresh, &t, &t2);

        let mut warm = DonskerVaradhan::new(NonFinitePolicy::SkipBatch);
        warm.objective(t.view(), t2.view());
        let ema = warm.ema().unwrap();
        assert_relative_eq!(ema, t2.mapv(f64::exp).mean().unwrap());

        // the control variate holds exp(t2) constant, so compare against it directly
        let objective = warm.clone().objective(t.view(), t2.view());
        let next_ema = (1.0 - EMA_RATE) * ema + EMA_RATE * t2.mapv(f64::exp).mean().unwrap();
        for j in 0..t2.len() {
            assert_relative_eq!(objective.d_negative[j], t2[j].exp() / (4.0 * next_ema), epsilon = 1e-12);
        }
    }

    #[test]
    fn test_dv_epoch_estimate() {
        let mut dv = DonskerVaradhan::new(NonFinitePolicy::SkipBatch);
        dv.begin_epoch();
        dv.objective(arr1(&[1.0, 2.0]).view(), arr1(&[0.0, 0.0]).view());
        dv.objective(arr1(&[3.0, 4.0]).view(), arr1(&[f64::ln(3.0), f64::ln(3.0)]).view());
        // mean(t) = 2.5, mean(exp(t2)) = 2
        assert_relative_eq!(dv.epoch_estimate(0.0), 2.5 - 2f64.ln(), epsilon = 1e-12);

        dv.begin_epoch();
        assert!(dv.epoch_estimate(0.0).is_nan());
    }

    #[test]
    fn test_dv_non_finite_policy() {
        let t = arr1(&[1.0, 1.0]);
        let good = arr1(&[0.0, 0.0]);
        let bad = arr1(&[f64::NAN, 0.0]);

        let mut repeat = DonskerVaradhan::new(NonFinitePolicy::RepeatLast);
        repeat.objective(t.view(), good.view());
        assert!(!repeat.objective(arr1(&[5.0, 5.0]).view(), bad.view()).is_finite());
        assert_eq!(repeat.count_t, 4);
        assert_relative_eq!(repeat.epoch_estimate(0.0), 1.0, epsilon = 1e-12);

        let mut skip = DonskerVaradhan::new(NonFinitePolicy::SkipBatch);
        skip.objective(t.view(), good.view());
        skip.objective(t.view(), bad.view());
        assert_eq!(skip.count_t, 2);
        assert_eq!(skip.ema(), Some(1.0));
    }

    #[test]
    fn test_negative_pair_layouts() {
        let mut rng = StdRng::seed_from_u64(1);
        let cross = InfoNce.negative_pairs(3, &mut rng);
        assert_eq!(cross.len(), 9);
        assert_eq!(cross[5], (1, 2));

        let sampled = InfoNceSampled::new(5).unwrap().negative_pairs(4, &mut rng);
        assert_eq!(sampled.len(), 20);
        assert!(sampled.iter().enumerate().all(|(idx, &(i, j))| i == idx / 5 && j < 4));

        let mut shuffled = JensenShannon.negative_pairs(6, &mut rng);
        assert!(shuffled.iter().enumerate().all(|(idx, &(i, _))| i == idx));
        shuffled.sort_unstable_by_key(|&(_, j)| j);
        assert_eq!(shuffled.iter().map(|&(_, j)| j).collect::<Vec<_>>(), (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn test_infonce_independent_scores_give_zero() {
        // T ignoring its arguments makes every ratio 1
        let t = Array1::from_elem(4, 0.7);
        let t2 = Array1::from_elem(16, 0.7);
        let objective = InfoNce.objective(t.view(), t2.view());
        assert_relative_eq!(objective.loss, 0.0, epsilon = 1e-12);
        assert!(objective.sample_scores.unwrap().iter().all(|d| d.abs() < 1e-12));
    }
}
