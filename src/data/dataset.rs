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

//! Labelled image datasets stored as numpy archives, and their per-class shards

use std::fmt::Display;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};
use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn, OwnedRepr};
use ndarray_npy::{NpzReader, NpzWriter};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const IMAGES: &str = "arr_0.npy";
const LABELS: &str = "arr_1.npy";
const POISON: &str = "arr_2.npy";

/// Channel, height and width of a single image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageShape {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageShape {
    pub fn new(channels: usize, height: usize, width: usize) -> ImageShape {
        ImageShape {
            channels,
            height,
            width,
        }
    }

    /// Number of components of a flattened image.
    pub fn flat_dim(&self) -> usize {
        self.channels * self.height * self.width
    }
}

impl Display for ImageShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}x{}x{}]", self.channels, self.height, self.width)
    }
}

/// Named subsets of a single class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subset {
    /// Poisoned samples carrying the backdoor trigger
    Backdoor,
    /// Samples of the class that are not poisoned
    Clean,
    /// A random subsample of the class
    Sample,
}

impl Subset {
    fn as_str(&self) -> &'static str {
        match self {
            Subset::Backdoor => "backdoor",
            Subset::Clean => "clean",
            Subset::Sample => "sample",
        }
    }
}

/// Identifies the slice of training data one MI worker observes.
///
/// Plain classes print as their index (`3`), subsets as `{class}_{subset}`
/// (`0_backdoor`). The same text is used as suffix of shard files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ClassKey {
    Class(usize),
    Subset(usize, Subset),
}

impl ClassKey {
    /// The label all samples of this key share.
    pub fn label(&self) -> usize {
        match self {
            ClassKey::Class(label) | ClassKey::Subset(label, _) => *label,
        }
    }

    /// Human readable name, e.g. `Class 0 Backdoor`.
    pub fn display_name(&self) -> String {
        match self {
            ClassKey::Class(label) => format!("Class {}", label),
            ClassKey::Subset(label, subset) => {
                let name = subset.as_str();
                format!("Class {} {}{}", label, name[..1].to_uppercase(), &name[1..])
            }
        }
    }

    /// Location of the shard for this key relative to `base`.
    pub fn shard_path<P: AsRef<Path>>(&self, base: P) -> PathBuf {
        PathBuf::from(format!("{}_class_{}.npz", base.as_ref().display(), self))
    }
}

impl Display for ClassKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassKey::Class(label) => write!(f, "{}", label),
            ClassKey::Subset(label, subset) => write!(f, "{}_{}", label, subset.as_str()),
        }
    }
}

impl FromStr for ClassKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("invalid class key {:?}", s));
        let s = s.trim();
        match s.split_once('_') {
            None => s.parse().map(ClassKey::Class).map_err(|_| invalid()),
            Some((label, subset)) => {
                let label = label.parse().map_err(|_| invalid())?;
                let subset = match subset {
                    "backdoor" => Subset::Backdoor,
                    "clean" => Subset::Clean,
                    "sample" => Subset::Sample,
                    _ => return Err(invalid()),
                };
                Ok(ClassKey::Subset(label, subset))
            }
        }
    }
}

impl TryFrom<String> for ClassKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ClassKey> for String {
    fn from(value: ClassKey) -> Self {
        value.to_string()
    }
}

/// Images (flattened in channel, height, width order) with integer labels
/// and an optional poison mask.
#[derive(Clone, Debug)]
pub struct Dataset {
    images: Array2<f64>,
    labels: Array1<usize>,
    poisoned: Option<Array1<bool>>,
    shape: ImageShape,
}

impl Dataset {
    pub fn new(images: Array2<f64>, labels: Array1<usize>, shape: ImageShape) -> Result<Dataset> {
        if images.len_of(Axis(1)) != shape.flat_dim() {
            return Err(Error::Shape {
                expected: shape.flat_dim(),
                got: images.len_of(Axis(1)),
            });
        }
        if images.len_of(Axis(0)) != labels.len() {
            return Err(Error::Shape {
                expected: images.len_of(Axis(0)),
                got: labels.len(),
            });
        }
        Ok(Dataset {
            images,
            labels,
            poisoned: None,
            shape,
        })
    }

    /// Attaches a mask marking poisoned samples.
    pub fn with_poison_mask(mut self, poisoned: Array1<bool>) -> Result<Dataset> {
        if poisoned.len() != self.len() {
            return Err(Error::Shape {
                expected: self.len(),
                got: poisoned.len(),
            });
        }
        self.poisoned = Some(poisoned);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn images(&self) -> &Array2<f64> {
        &self.images
    }

    pub fn labels(&self) -> &Array1<usize> {
        &self.labels
    }

    pub fn poisoned(&self) -> Option<&Array1<bool>> {
        self.poisoned.as_ref()
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    /// Returns the samples at `indices` in the given order.
    pub fn select(&self, indices: &[usize]) -> Dataset {
        Dataset {
            images: self.images.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
            poisoned: self.poisoned.as_ref().map(|p| p.select(Axis(0), indices)),
            shape: self.shape,
        }
    }

    /// Positions of all samples belonging to `key`.
    ///
    /// `Subset::Sample` yields the whole class; sampling happens in [`Dataset::shard`].
    pub fn indices_of(&self, key: ClassKey) -> Vec<usize> {
        let label = key.label();
        let poisoned = |idx: usize| self.poisoned.as_ref().map_or(false, |p| p[idx]);
        (0..self.len())
            .filter(|&idx| self.labels[idx] == label)
            .filter(|&idx| match key {
                ClassKey::Subset(_, Subset::Backdoor) => poisoned(idx),
                ClassKey::Subset(_, Subset::Clean) => !poisoned(idx),
                _ => true,
            })
            .collect()
    }

    /// Sorted list of distinct labels.
    pub fn classes(&self) -> Vec<usize> {
        let mut classes = self.labels.to_vec();
        classes.sort_unstable();
        classes.dedup();
        classes
    }

    /// Reads a dataset from a numpy archive.
    ///
    /// The archive stores images as `arr_0` with shape `N x H x W x C`
    /// (f32 or f64), labels as `arr_1` (i64 or i32) and optionally a poison
    /// mask as `arr_2` (i64 or bool).
    pub fn load_npz<P: AsRef<Path>>(path: P) -> Result<Dataset> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut npz = NpzReader::new(file)?;
        let names = npz.names()?;
        let missing = |name: &str| Error::MissingArray {
            path: path.to_path_buf(),
            name: name.to_string(),
        };

        if !names.iter().any(|n| n == IMAGES) {
            return Err(missing(IMAGES));
        }
        if !names.iter().any(|n| n == LABELS) {
            return Err(missing(LABELS));
        }

        let raw: ArrayD<f64> = match npz.by_name::<OwnedRepr<f32>, IxDyn>(IMAGES) {
            Ok(arr) => arr.mapv(f64::from),
            Err(_) => npz.by_name::<OwnedRepr<f64>, IxDyn>(IMAGES)?,
        };
        if raw.ndim() != 4 {
            return Err(Error::Shape {
                expected: 4,
                got: raw.ndim(),
            });
        }
        let (n, height, width, channels) = (raw.shape()[0], raw.shape()[1], raw.shape()[2], raw.shape()[3]);
        let shape = ImageShape::new(channels, height, width);
        let images = raw
            .permuted_axes(IxDyn(&[0, 3, 1, 2]))
            .as_standard_layout()
            .into_owned()
            .into_shape((n, shape.flat_dim()))?;

        let labels: Array1<i64> = match npz.by_name::<OwnedRepr<i64>, _>(LABELS) {
            Ok(arr) => arr,
            Err(_) => npz.by_name::<OwnedRepr<i32>, _>(LABELS)?.mapv(i64::from),
        };
        let labels = labels
            .iter()
            .map(|&l| usize::try_from(l).map_err(|_| Error::InvalidConfig(format!("negative label {} in {}", l, path.display()))))
            .collect::<Result<Array1<usize>>>()?;

        let mut dataset = Dataset::new(images, labels, shape)?;

        if names.iter().any(|n| n == POISON) {
            let mask: Array1<bool> = match npz.by_name::<OwnedRepr<i64>, _>(POISON) {
                Ok(arr) => arr.mapv(|v| v != 0),
                Err(_) => npz.by_name::<OwnedRepr<bool>, _>(POISON)?,
            };
            dataset = dataset.with_poison_mask(mask)?;
        }

        debug!("Loaded {} samples of shape {} from {}", n, shape, path.display());
        Ok(dataset)
    }

    /// Writes the dataset in the format read by [`Dataset::load_npz`].
    pub fn save_npz<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut npz = NpzWriter::new(file);

        let nhwc = self
            .images
            .view()
            .into_shape((self.len(), self.shape.channels, self.shape.height, self.shape.width))?
            .permuted_axes([0, 2, 3, 1]);
        npz.add_array(IMAGES, &nhwc.as_standard_layout())?;
        npz.add_array(LABELS, &self.labels.mapv(|l| l as i64))?;
        if let Some(mask) = &self.poisoned {
            npz.add_array(POISON, &mask.mapv(i64::from))?;
        }
        npz.finish()?;
        Ok(())
    }

    /// Splits the dataset into per-class shards next to `base`.
    ///
    /// Every label gets `{base}_class_{label}.npz`. For `target` the
    /// `backdoor` and `clean` subsets are written if a poison mask is present,
    /// and `sample` holds `sample_size` randomly drawn samples of the class.
    pub fn shard<P: AsRef<Path>>(
        &self,
        base: P,
        target: usize,
        sample_size: usize,
        seed: u64,
    ) -> Result<Vec<(ClassKey, PathBuf)>> {
        let base = base.as_ref();
        let mut keys = self.classes().into_iter().map(ClassKey::Class).collect::<Vec<_>>();
        if self.poisoned.is_some() {
            keys.push(ClassKey::Subset(target, Subset::Backdoor));
            keys.push(ClassKey::Subset(target, Subset::Clean));
        }
        keys.push(ClassKey::Subset(target, Subset::Sample));

        let mut rng = StdRng::seed_from_u64(seed);
        let mut written = Vec::with_capacity(keys.len());
        for key in keys {
            let mut indices = self.indices_of(key);
            if let ClassKey::Subset(_, Subset::Sample) = key {
                let amount = sample_size.min(indices.len());
                let mut chosen = rand::seq::index::sample(&mut rng, indices.len(), amount).into_vec();
                chosen.sort_unstable();
                indices = chosen.into_iter().map(|i| indices[i]).collect();
            }
            if indices.is_empty() {
                debug!("Skipping empty shard {}", key);
                continue;
            }
            let path = key.shard_path(base);
            self.select(&indices).save_npz(&path)?;
            info!("Wrote {} samples of {} to {}", indices.len(), key.display_name(), path.display());
            written.push((key, path));
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr1, Array};

    use super::*;

    fn toy() -> Dataset {
        let shape = ImageShape::new(2, 1, 2);
        let images = Array::from_shape_fn((6, 4), |(i, j)| (i * 4 + j) as f64);
        Dataset::new(images, arr1(&[0, 1, 0, 2, 0, 1]), shape)
            .unwrap()
            .with_poison_mask(arr1(&[true, false, false, false, true, false]))
            .unwrap()
    }

    #[test]
    fn test_class_key_roundtrip() {
        for text in ["0", "7", "0_backdoor", "0_clean", "3_sample"] {
            let key: ClassKey = text.parse().unwrap();
            assert_eq!(key.to_string(), text);
        }
        assert!("0_poison".parse::<ClassKey>().is_err());
        assert!("x".parse::<ClassKey>().is_err());
        assert_eq!(ClassKey::Subset(0, Subset::Backdoor).display_name(), "Class 0 Backdoor");
    }

    #[test]
    fn test_shard_path() {
        let key = ClassKey::Subset(0, Subset::Clean);
        assert_eq!(key.shard_path("data/train"), PathBuf::from("data/train_class_0_clean.npz"));
        assert_eq!(ClassKey::Class(4).shard_path("d"), PathBuf::from("d_class_4.npz"));
    }

    #[test]
    fn test_indices_of() {
        let ds = toy();
        assert_eq!(ds.indices_of(ClassKey::Class(0)), vec![0, 2, 4]);
        assert_eq!(ds.indices_of(ClassKey::Subset(0, Subset::Backdoor)), vec![0, 4]);
        assert_eq!(ds.indices_of(ClassKey::Subset(0, Subset::Clean)), vec![2]);
        assert_eq!(ds.classes(), vec![0, 1, 2]);
    }

    #[test]
    fn test_shape_mismatch() {
        let res = Dataset::new(Array2::zeros((3, 5)), arr1(&[0, 0, 0]), ImageShape::new(1, 2, 2));
        assert!(matches!(res, Err(Error::Shape { expected: 4, got: 5 })));
    }

    #[test]
    fn test_npz_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toy.npz");
        let ds = toy();
        ds.save_npz(&path).unwrap();

        let loaded = Dataset::load_npz(&path).unwrap();
        assert_eq!(loaded.shape(), ds.shape());
        assert_eq!(loaded.images(), ds.images());
        assert_eq!(loaded.labels(), ds.labels());
        assert_eq!(loaded.poisoned(), ds.poisoned());
    }

    #[test]
    fn test_shard() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("train");
        let written = toy().shard(&base, 0, 2, 0).unwrap();
        let keys = written.iter().map(|(k, _)| k.to_string()).collect::<Vec<_>>();

        assert_eq!(keys, vec!["0", "1", "2", "0_backdoor", "0_clean", "0_sample"]);
        let sample = Dataset::load_npz(ClassKey::Subset(0, Subset::Sample).shard_path(&base)).unwrap();
        assert_eq!(sample.len(), 2);
        assert!(sample.labels().iter().all(|&l| l == 0));
    }
}
