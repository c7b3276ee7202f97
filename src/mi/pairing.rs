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

//! Which pair of representations `(Y, Z)` the statistics network observes

use std::fmt::Display;
use std::str::FromStr;

use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::classifier::ClassifierDims;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Pairing {
    /// `Y` = pooled penultimate features, `Z` = flattened input image
    #[serde(rename = "inputs-vs-outputs")]
    InputsVsOutputs,
    /// `Y` = logits (or one-hot labels), `Z` = pooled penultimate features
    #[serde(rename = "outputs-vs-Y", alias = "Y-vs-outputs")]
    OutputsVsY,
}

/// Source of `Y` in the [`Pairing::OutputsVsY`] mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSource {
    #[default]
    Logits,
    Labels,
}

/// The observed pair of one batch.
#[derive(Clone, Debug)]
pub struct PairedBatch {
    pub y: Array2<f64>,
    pub z: Array2<f64>,
}

impl Pairing {
    pub const ALL: [Pairing; 2] = [Pairing::InputsVsOutputs, Pairing::OutputsVsY];

    /// `(dim_Y, dim_Z)` for a classifier with the given dimensions.
    pub fn dims(&self, dims: ClassifierDims) -> (usize, usize) {
        match self {
            Pairing::InputsVsOutputs => (dims.feature_channels, dims.input),
            Pairing::OutputsVsY => (dims.num_classes, dims.feature_channels),
        }
    }

    /// Selects `(Y, Z)` from one classifier pass over `images`.
    pub fn select(
        &self,
        target: TargetSource,
        images: ArrayView2<f64>,
        features: ArrayView2<f64>,
        logits: ArrayView2<f64>,
        labels: ArrayView1<usize>,
    ) -> Result<PairedBatch> {
        let n = images.nrows();
        for rows in [features.nrows(), logits.nrows(), labels.len()] {
            if rows != n {
                return Err(Error::Shape { expected: n, got: rows });
            }
        }
        let (y, z) = match self {
            Pairing::InputsVsOutputs => (features.to_owned(), images.to_owned()),
            Pairing::OutputsVsY => {
                let y = match target {
                    TargetSource::Logits => logits.to_owned(),
                    TargetSource::Labels => one_hot(labels, logits.ncols())?,
                };
                (y, features.to_owned())
            }
        };
        Ok(PairedBatch { y, z })
    }
}

/// One-hot encoding of `labels` with `num_classes` columns.
pub fn one_hot(labels: ArrayView1<usize>, num_classes: usize) -> Result<Array2<f64>> {
    let mut encoded = Array2::zeros((labels.len(), num_classes));
    for (mut row, &label) in encoded.outer_iter_mut().zip(labels.iter()) {
        if label >= num_classes {
            return Err(Error::IndexOutOfBounds {
                index: label,
                len: num_classes,
            });
        }
        row[label] = 1.0;
    }
    Ok(encoded)
}

impl Display for Pairing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pairing::InputsVsOutputs => f.write_str("inputs-vs-outputs"),
            Pairing::OutputsVsY => f.write_str("outputs-vs-Y"),
        }
    }
}

impl FromStr for Pairing {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inputs-vs-outputs" => Ok(Pairing::InputsVsOutputs),
            "outputs-vs-Y" | "Y-vs-outputs" => Ok(Pairing::OutputsVsY),
            _ => Err(Error::UnsupportedPairing(s.to_string())),
        }
    }
}
