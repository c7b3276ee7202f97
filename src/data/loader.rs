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

//! Minibatch iteration over a [`Dataset`]

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::dataset::{Dataset, ImageShape};
use crate::error::{Error, Result};

/// Order in which samples are visited.
///
/// A random order is drawn once when the loader is built and then reused for
/// every epoch, so the position of a sample within an epoch is stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderOption {
    Sequential,
    Random { seed: u64 },
}

/// One minibatch together with its location in the iteration order.
#[derive(Clone, Debug)]
pub struct Batch {
    /// Index of the batch within the epoch
    pub index: usize,
    /// Position of the first sample of this batch within the epoch
    pub start: usize,
    pub images: Array2<f64>,
    pub labels: Array1<usize>,
    /// Dataset indices of the samples in this batch
    pub sample_indices: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Loader {
    dataset: Dataset,
    batch_size: usize,
    order: Vec<usize>,
}

impl Loader {
    pub fn new(dataset: Dataset, batch_size: usize, order: OrderOption) -> Result<Loader> {
        if batch_size == 0 {
            return Err(Error::InvalidConfig("batch size must be positive".to_string()));
        }
        let mut indices = (0..dataset.len()).collect::<Vec<_>>();
        if let OrderOption::Random { seed } = order {
            indices.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Ok(Loader {
            dataset,
            batch_size,
            order: indices,
        })
    }

    /// Keeps only the first `fraction` of the iteration order (at least one sample).
    pub fn truncate(mut self, fraction: f64) -> Result<Loader> {
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "subset fraction must be in (0, 1], got {}",
                fraction
            )));
        }
        let keep = ((self.order.len() as f64 * fraction).floor() as usize).max(1);
        self.order.truncate(keep);
        Ok(self)
    }

    /// Draws a new random order over the samples currently kept.
    pub fn reshuffle(&mut self, seed: u64) {
        self.order.shuffle(&mut StdRng::seed_from_u64(seed));
    }

    /// Number of batches per epoch.
    pub fn len(&self) -> usize {
        self.order.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of samples visited per epoch.
    pub fn num_samples(&self) -> usize {
        self.order.len()
    }

    pub fn image_shape(&self) -> ImageShape {
        self.dataset.shape()
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Dataset index of the sample at `position` in the iteration order.
    pub fn sample_index(&self, position: usize) -> Option<usize> {
        self.order.get(position).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = Batch> + '_ {
        self.order
            .chunks(self.batch_size)
            .enumerate()
            .map(move |(index, chunk)| Batch {
                index,
                start: index * self.batch_size,
                images: self.dataset.images().select(Axis(0), chunk),
                labels: self.dataset.labels().select(Axis(0), chunk),
                sample_indices: chunk.to_vec(),
            })
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;

    use super::*;

    fn dataset(n: usize) -> Dataset {
        let images = Array::from_shape_fn((n, 2), |(i, j)| (i * 2 + j) as f64);
        let labels = Array::from_shape_fn(n, |i| i % 3);
        Dataset::new(images, labels, ImageShape::new(2, 1, 1)).unwrap()
    }

    #[test]
    fn test_partial_last_batch() {
        let loader = Loader::new(dataset(10), 4, OrderOption::Sequential).unwrap();
        let sizes = loader.iter().map(|b| b.len()).collect::<Vec<_>>();

        assert_eq!(loader.len(), 3);
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(loader.iter().last().unwrap().start, 8);
    }

    #[test]
    fn test_random_order_is_fixed() {
        let loader = Loader::new(dataset(50), 8, OrderOption::Random { seed: 7 }).unwrap();
        let first = loader.iter().flat_map(|b| b.sample_indices).collect::<Vec<_>>();
        let second = loader.iter().flat_map(|b| b.sample_indices).collect::<Vec<_>>();

        assert_eq!(first, second);
        assert_ne!(first, (0..50).collect::<Vec<_>>());
        let mut sorted = first.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_batch_rows_match_indices() {
        let loader = Loader::new(dataset(9), 4, OrderOption::Random { seed: 1 }).unwrap();
        for batch in loader.iter() {
            for (row, &idx) in batch.images.outer_iter().zip(&batch.sample_indices) {
                assert_eq!(row[0], (idx * 2) as f64);
                assert_eq!(batch.labels[batch.sample_indices.iter().position(|&i| i == idx).unwrap()], idx % 3);
            }
        }
    }

    #[test]
    fn test_truncate() {
        let loader = Loader::new(dataset(10), 3, OrderOption::Sequential)
            .unwrap()
            .truncate(0.25)
            .unwrap();
        assert_eq!(loader.num_samples(), 2);
        assert_eq!(loader.len(), 1);
        assert!(Loader::new(dataset(3), 0, OrderOption::Sequential).is_err());
    }

    #[test]
    fn test_reshuffle_keeps_samples() {
        let mut loader = Loader::new(dataset(12), 5, OrderOption::Sequential)
            .unwrap()
            .truncate(0.5)
            .unwrap();
        loader.reshuffle(9);
        let mut seen = loader.iter().flat_map(|b| b.sample_indices).collect::<Vec<_>>();
        seen.sort_unstable();
        assert_eq!(seen, (0..6).collect::<Vec<_>>());
    }
}
