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

//! Running per-sample score averages

use ndarray::{s, Array1, ArrayView1};

use crate::error::{Error, Result};

/// Accumulates per-sample scores by position in the (fixed) iteration order
/// of a loader.
///
/// Non-finite scores are not accumulated. Positions that never received a
/// score average to `NaN`.
#[derive(Clone, Debug, PartialEq)]
pub struct ScoreAccumulator {
    sum: Array1<f64>,
    count: Array1<u32>,
}

impl ScoreAccumulator {
    /// Creates an accumulator for `num_batches` batches of at most `batch_size` samples.
    pub fn new(num_batches: usize, batch_size: usize) -> ScoreAccumulator {
        let len = num_batches * batch_size;
        ScoreAccumulator {
            sum: Array1::zeros(len),
            count: Array1::zeros(len),
        }
    }

    pub fn len(&self) -> usize {
        self.sum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sum.is_empty()
    }

    /// Adds the scores of a batch whose first sample sits at position `start`.
    pub fn add_batch(&mut self, start: usize, scores: ArrayView1<f64>) -> Result<()> {
        let end = start + scores.len();
        if end > self.len() {
            return Err(Error::IndexOutOfBounds {
                index: end - 1,
                len: self.len(),
            });
        }
        for ((sum, count), &score) in self
            .sum
            .slice_mut(s![start..end])
            .iter_mut()
            .zip(self.count.slice_mut(s![start..end]).iter_mut())
            .zip(scores.iter())
        {
            if score.is_finite() {
                *sum += score;
                *count += 1;
            }
        }
        Ok(())
    }

    pub fn counts(&self) -> ArrayView1<'_, u32> {
        self.count.view()
    }

    /// Elementwise `sum / count`, `NaN` where nothing was accumulated.
    pub fn average(&self) -> Array1<f64> {
        self.sum
            .iter()
            .zip(self.count.iter())
            .map(|(&sum, &count)| if count == 0 { f64::NAN } else { sum / f64::from(count) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use ndarray::arr1;

    use super::*;

    #[test]
    fn test_single_pass_is_exact() {
        let scores = [arr1(&[0.5, -1.0, 2.0]), arr1(&[3.0, 0.125, -0.25]), arr1(&[7.0])];
        let mut acc = ScoreAccumulator::new(3, 3);
        for (idx, batch) in scores.iter().enumerate() {
            acc.add_batch(idx * 3, batch.view()).unwrap();
        }

        let average = acc.average();
        assert_eq!(acc.counts().slice(s![..7]), Array1::<u32>::ones(7));
        let flat = scores.iter().flat_map(|b| b.iter().copied()).collect::<Array1<f64>>();
        assert_eq!(average.slice(s![..7]), flat);
        // the tail of the partial last batch is never visited
        assert!(average[7].is_nan() && average[8].is_nan());
    }

    #[test]
    fn test_multiple_epochs_average() {
        let mut acc = ScoreAccumulator::new(1, 2);
        acc.add_batch(0, arr1(&[1.0, 2.0]).view()).unwrap();
        acc.add_batch(0, arr1(&[3.0, f64::NAN]).view()).unwrap();
        let average = acc.average();
        assert_relative_eq!(average[0], 2.0);
        assert_relative_eq!(average[1], 2.0);
        assert_eq!(acc.counts(), arr1(&[2u32, 1]));
    }

    #[test]
    fn test_out_of_bounds() {
        let mut acc = ScoreAccumulator::new(2, 2);
        assert!(matches!(
            acc.add_batch(3, arr1(&[1.0, 2.0]).view()),
            Err(Error::IndexOutOfBounds { index: 4, len: 4 })
        ));
        assert!(acc.add_batch(2, Array1::<f64>::zeros(0).view()).is_ok());
    }
}
