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

//! Crate-wide error type

use std::path::PathBuf;

use ndarray_npy::{ReadNpyError, ReadNpzError, WriteNpyError, WriteNpzError};
use thiserror::Error;

use crate::data::dataset::ClassKey;
use crate::mi::pairing::Pairing;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unsupported pairing mode: {0:?} (expected inputs-vs-outputs, outputs-vs-Y or Y-vs-outputs)")]
    UnsupportedPairing(String),
    #[error("Unsupported estimator: {0:?} (expected DV, infoNCE, infoNCE-sampled or JSD)")]
    UnsupportedEstimator(String),
    #[error("Activation tap did not fire; the penultimate feature map was never captured")]
    TapNotFired,
    #[error("Shape mismatch: expected {expected}, got {got}")]
    Shape { expected: usize, got: usize },
    #[error("Index {index} is out of bounds (length: {len})")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("Dataset {0} contains no samples")]
    EmptyDataset(PathBuf),
    #[error("Array {name} is missing in {path}")]
    MissingArray { path: PathBuf, name: String },
    #[error("Failed to read npz archive")]
    ReadNpz(#[from] ReadNpzError),
    #[error("Failed to write npz archive")]
    WriteNpz(#[from] WriteNpzError),
    #[error("Failed to read npy file")]
    ReadNpy(#[from] ReadNpyError),
    #[error("Failed to write npy file")]
    WriteNpy(#[from] WriteNpyError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error("Failed to parse configuration")]
    TomlDe(#[from] toml::de::Error),
    #[error("Failed to serialize configuration")]
    TomlSer(#[from] toml::ser::Error),
    #[error("MI worker for class {class} ({pairing}) failed")]
    Worker {
        class: ClassKey,
        pairing: Pairing,
        #[source]
        source: Box<Error>,
    },
    #[error("MI worker for class {class} ({pairing}) panicked")]
    WorkerPanicked { class: ClassKey, pairing: Pairing },
}

impl From<ndarray::ShapeError> for Error {
    fn from(err: ndarray::ShapeError) -> Self {
        Error::InvalidConfig(format!("array shape error: {}", err))
    }
}
