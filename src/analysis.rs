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

//! Detection of samples whose MI scores deviate from the pooled class norm

use average::{Max, Min, Variance};
use float_ord::FloatOrd;
use log::info;

use crate::data::dataset::ClassKey;
use crate::train::worker::ClassResult;

/// A sample scoring above the suspicion threshold.
#[derive(Clone, Debug, PartialEq)]
pub struct SuspiciousSample {
    pub class: ClassKey,
    /// Position in the score array of the class
    pub position: usize,
    /// Index of the sample within its class shard
    pub sample_index: usize,
    pub score: f64,
}

/// Score statistics of one observed class.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassScoreSummary {
    pub class: ClassKey,
    /// Number of finite scores
    pub scored: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub suspicious: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SuspiciousReport {
    pub mean: f64,
    pub std: f64,
    pub threshold: f64,
    /// Suspicious samples, highest score first
    pub samples: Vec<SuspiciousSample>,
    pub per_class: Vec<ClassScoreSummary>,
}

/// Pools the finite scores of all classes and flags every sample scoring
/// above `mean + k * std` of the pool.
///
/// Returns `None` if no class has a finite score.
pub fn find_suspicious(results: &[ClassResult], k: f64) -> Option<SuspiciousReport> {
    let finite = |r: &ClassResult| {
        r.report
            .sample_scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, s)| s.is_finite())
            .collect::<Vec<_>>()
    };

    let pooled: Variance = results.iter().flat_map(|r| finite(r).into_iter().map(|(_, s)| s)).collect();
    if pooled.len() == 0 {
        return None;
    }
    let mean = pooled.mean();
    let std = pooled.sample_variance().sqrt();
    let threshold = mean + k * std;

    let mut samples = Vec::new();
    let mut per_class = Vec::with_capacity(results.len());
    for result in results {
        let scores = finite(result);
        let before = samples.len();
        for &(position, score) in &scores {
            if score > threshold {
                samples.push(SuspiciousSample {
                    class: result.class,
                    position,
                    sample_index: result.sample_indices.get(position).copied().unwrap_or(position),
                    score,
                });
            }
        }

        let stats: Variance = scores.iter().map(|&(_, s)| s).collect();
        let min: Min = scores.iter().map(|&(_, s)| s).collect();
        let max: Max = scores.iter().map(|&(_, s)| s).collect();
        let summary = ClassScoreSummary {
            class: result.class,
            scored: scores.len(),
            mean: if scores.is_empty() { f64::NAN } else { stats.mean() },
            std: if scores.is_empty() { f64::NAN } else { stats.sample_variance().sqrt() },
            min: if scores.is_empty() { f64::NAN } else { min.min() },
            max: if scores.is_empty() { f64::NAN } else { max.max() },
            suspicious: samples.len() - before,
        };
        info!(
            "{} - {} suspicious of {} scored samples (mean {:.4}, std {:.4})",
            summary.class.display_name(),
            summary.suspicious,
            summary.scored,
            summary.mean,
            summary.std
        );
        per_class.push(summary);
    }
    samples.sort_by_key(|s| FloatOrd(-s.score));

    info!(
        "Overall - mean score {:.4}, std {:.4}, {} suspicious samples above {:.4}",
        mean,
        std,
        samples.len(),
        threshold
    );
    Some(SuspiciousReport {
        mean,
        std,
        threshold,
        samples,
        per_class,
    })
}
