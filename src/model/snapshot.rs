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

//! Immutable classifier weights that can be shared with workers and persisted

use std::fs::File;
use std::path::Path;

use log::debug;
use ndarray::{arr1, Array1, Array2};
use ndarray_npy::{NpzReader, NpzWriter};
use regex::Regex;

use super::dense::DenseArchitecture;
use crate::data::dataset::ImageShape;
use crate::error::{Error, Result};
use crate::nn::linear::Linear;

const LAYOUT: &str = "layout.npy";

/// A point-in-time copy of the weights of a [`DenseClassifier`].
///
/// Snapshots are never mutated; share them between threads behind an `Arc`.
///
/// [`DenseClassifier`]: super::dense::DenseClassifier
#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierSnapshot {
    arch: DenseArchitecture,
    trunk: Vec<Linear>,
    head: Linear,
}

impl ClassifierSnapshot {
    /// Builds a snapshot from layers ordered trunk first, head last.
    pub fn new(arch: DenseArchitecture, mut layers: Vec<Linear>) -> Result<ClassifierSnapshot> {
        arch.validate()?;
        let dims = arch.layer_dims();
        if layers.len() != dims.len() {
            return Err(Error::Shape {
                expected: dims.len(),
                got: layers.len(),
            });
        }
        for (layer, &(indim, outdim)) in layers.iter().zip(&dims) {
            if layer.indim() != indim {
                return Err(Error::Shape {
                    expected: indim,
                    got: layer.indim(),
                });
            }
            if layer.outdim() != outdim {
                return Err(Error::Shape {
                    expected: outdim,
                    got: layer.outdim(),
                });
            }
        }
        let head = layers
            .pop()
            .ok_or_else(|| Error::InvalidConfig("snapshot without layers".to_string()))?;
        Ok(ClassifierSnapshot {
            arch,
            trunk: layers,
            head,
        })
    }

    pub(crate) fn from_parts(arch: DenseArchitecture, trunk: Vec<Linear>, head: Linear) -> ClassifierSnapshot {
        ClassifierSnapshot { arch, trunk, head }
    }

    pub fn architecture(&self) -> &DenseArchitecture {
        &self.arch
    }

    pub fn trunk(&self) -> &[Linear] {
        &self.trunk
    }

    pub fn head(&self) -> &Linear {
        &self.head
    }

    pub fn layers(&self) -> impl Iterator<Item = &Linear> + '_ {
        self.trunk.iter().chain(std::iter::once(&self.head))
    }

    pub fn num_params(&self) -> usize {
        self.layers().map(Linear::num_params).sum()
    }

    /// Writes all layers as `{i}.linear.weights.npy` / `{i}.linear.bias.npy`
    /// together with a `layout.npy` header.
    pub fn save_npz<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut npz = NpzWriter::new(file);

        let layout = arr1(&[
            self.arch.input.channels as i64,
            self.arch.input.height as i64,
            self.arch.input.width as i64,
            self.arch.feature_channels as i64,
            self.arch.feature_spatial as i64,
            self.arch.num_classes as i64,
        ]);
        npz.add_array(LAYOUT, &layout)?;
        for (idx, layer) in self.layers().enumerate() {
            npz.add_array(format!("{}.linear.weights.npy", idx), &layer.weight)?;
            npz.add_array(format!("{}.linear.bias.npy", idx), &layer.bias)?;
        }
        npz.finish()?;
        Ok(())
    }

    /// Reads a snapshot written by [`ClassifierSnapshot::save_npz`].
    ///
    /// Hidden widths are recovered from the stored layer shapes.
    pub fn load_npz<P: AsRef<Path>>(path: P) -> Result<ClassifierSnapshot> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut npz = NpzReader::new(file)?;

        let names = npz.names()?;
        if !names.iter().any(|n| n == LAYOUT) {
            return Err(Error::MissingArray {
                path: path.to_path_buf(),
                name: LAYOUT.to_string(),
            });
        }

        let pattern = Regex::new(r"^(\d+)\.linear\.weights\.npy$").expect("layer pattern is a valid regex");
        let mut indices = names
            .iter()
            .filter_map(|name| pattern.captures(name))
            .filter_map(|caps| caps.get(1).and_then(|m| m.as_str().parse::<usize>().ok()))
            .collect::<Vec<_>>();
        // names sort lexicographically, "10" would precede "2"
        indices.sort_unstable();

        let mut layers = Vec::with_capacity(indices.len());
        for idx in indices {
            let weight: Array2<f64> = npz.by_name(&format!("{}.linear.weights.npy", idx))?;
            let bias: Array1<f64> = npz.by_name(&format!("{}.linear.bias.npy", idx))?;
            if weight.nrows() != bias.len() {
                return Err(Error::Shape {
                    expected: weight.nrows(),
                    got: bias.len(),
                });
            }
            layers.push(Linear::from_mats(weight, bias));
        }

        let layout: Array1<i64> = npz.by_name(LAYOUT)?;
        if layout.len() != 6 {
            return Err(Error::Shape {
                expected: 6,
                got: layout.len(),
            });
        }
        let dims = layout
            .iter()
            .map(|&v| usize::try_from(v).map_err(|_| Error::InvalidConfig(format!("negative layout entry {} in {}", v, path.display()))))
            .collect::<Result<Vec<_>>>()?;

        let hidden = if layers.len() > 2 {
            layers[..layers.len() - 2].iter().map(Linear::outdim).collect()
        } else {
            Vec::new()
        };
        let arch = DenseArchitecture {
            input: ImageShape::new(dims[0], dims[1], dims[2]),
            hidden,
            feature_channels: dims[3],
            feature_spatial: dims[4],
            num_classes: dims[5],
        };
        debug!("Loaded classifier {} from {}", arch, path.display());
        ClassifierSnapshot::new(arch, layers)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::Array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;
    use crate::model::classifier::Classifier;
    use crate::model::dense::DenseClassifier;

    fn arch(hidden: Vec<usize>) -> DenseArchitecture {
        DenseArchitecture {
            input: ImageShape::new(2, 2, 2),
            hidden,
            feature_channels: 4,
            feature_spatial: 3,
            num_classes: 3,
        }
    }

    #[test]
    fn test_roundtrip_gives_identical_logits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.npz");
        let mut rng = StdRng::seed_from_u64(42);
        // more than ten layers to exercise numeric ordering of the names
        let clf = DenseClassifier::new(arch(vec![5; 11]), &mut rng).unwrap();
        clf.snapshot().save_npz(&path).unwrap();

        let loaded = ClassifierSnapshot::load_npz(&path).unwrap();
        assert_eq!(loaded, clf.snapshot());

        let restored = DenseClassifier::from_snapshot(&loaded);
        let images = Array::from_shape_fn((4, 8), |(i, j)| (i as f64 - j as f64) * 0.3);
        assert_eq!(restored.forward(images.view()).logits, clf.forward(images.view()).logits);
    }

    #[test]
    fn test_new_checks_layer_shapes() {
        let a = arch(vec![]);
        let layers = vec![Linear::zeros(8, 12), Linear::zeros(4, 3)];
        assert!(ClassifierSnapshot::new(a.clone(), layers).is_ok());

        let wrong = vec![Linear::zeros(8, 10), Linear::zeros(4, 3)];
        assert!(matches!(
            ClassifierSnapshot::new(a.clone(), wrong),
            Err(Error::Shape { expected: 12, got: 10 })
        ));
        assert!(ClassifierSnapshot::new(a, vec![]).is_err());
    }
}
