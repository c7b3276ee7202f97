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

//! The classifier contract observed by the MI estimators

use std::sync::{Arc, Mutex, MutexGuard};

use ndarray::{Array2, ArrayView2, Axis};

/// Penultimate activations of a classifier, laid out as `channels x spatial`
/// positions per sample (channel-major).
#[derive(Clone, Debug, PartialEq)]
pub struct FeatureMap {
    pub data: Array2<f64>,
    pub channels: usize,
    pub spatial: usize,
}

impl FeatureMap {
    pub fn new(data: Array2<f64>, channels: usize, spatial: usize) -> FeatureMap {
        assert_eq!(
            data.len_of(Axis(1)),
            channels * spatial,
            "Feature map width {} does not match {} channels x {} positions",
            data.len_of(Axis(1)),
            channels,
            spatial
        );
        FeatureMap {
            data,
            channels,
            spatial,
        }
    }

    /// Averages every channel over its spatial positions (`batch x channels`).
    pub fn global_avg_pool(&self) -> Array2<f64> {
        let batch = self.data.len_of(Axis(0));
        let mut pooled = Array2::zeros((batch, self.channels));
        for (mut out, row) in pooled.outer_iter_mut().zip(self.data.outer_iter()) {
            for (c, value) in out.iter_mut().enumerate() {
                let start = c * self.spatial;
                *value = row.slice(ndarray::s![start..start + self.spatial]).sum() / self.spatial as f64;
            }
        }
        pooled
    }
}

/// Result of a classifier forward pass.
#[derive(Clone, Debug)]
pub struct ClassifierOutput {
    /// Globally pooled penultimate features (`batch x channels`)
    pub features: Array2<f64>,
    /// Unnormalized class scores (`batch x classes`)
    pub logits: Array2<f64>,
}

/// Dimensions a classifier exposes to observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClassifierDims {
    pub input: usize,
    pub feature_channels: usize,
    pub num_classes: usize,
}

/// Callback invoked with the penultimate feature map on every forward pass.
pub type Tap = Box<dyn Fn(&FeatureMap) + Send + Sync>;

/// Identifies a registered tap so it can be removed again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TapHandle(pub usize);

/// An image classifier as seen by the MI estimators.
///
/// Observers must not change the outputs; a tap only reads the penultimate
/// feature map.
pub trait Classifier {
    fn dims(&self) -> ClassifierDims;

    /// Runs the classifier on a batch of flattened images.
    fn forward(&self, images: ArrayView2<f64>) -> ClassifierOutput;

    fn register_tap(&mut self, tap: Tap) -> TapHandle;

    /// Removes a tap; unknown handles are ignored.
    fn remove_tap(&mut self, handle: TapHandle);
}

/// A list of taps owned by a classifier implementation.
#[derive(Default)]
pub struct TapRegistry {
    next: usize,
    taps: Vec<(TapHandle, Tap)>,
}

impl TapRegistry {
    pub fn new() -> TapRegistry {
        TapRegistry::default()
    }

    pub fn register(&mut self, tap: Tap) -> TapHandle {
        let handle = TapHandle(self.next);
        self.next += 1;
        self.taps.push((handle, tap));
        handle
    }

    pub fn remove(&mut self, handle: TapHandle) {
        self.taps.retain(|(h, _)| *h != handle);
    }

    pub fn len(&self) -> usize {
        self.taps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taps.is_empty()
    }

    pub fn fire(&self, map: &FeatureMap) {
        for (_, tap) in &self.taps {
            tap(map);
        }
    }
}

impl std::fmt::Debug for TapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapRegistry")
            .field("next", &self.next)
            .field("taps", &self.taps.len())
            .finish()
    }
}

/// A single-slot mailbox receiving the feature map captured by a [`Tap`].
///
/// The slot is owned by whoever reads it; [`ActivationSlot::tap`] hands a
/// writer into the classifier.
#[derive(Clone, Debug, Default)]
pub struct ActivationSlot {
    slot: Arc<Mutex<Option<FeatureMap>>>,
}

impl ActivationSlot {
    pub fn new() -> ActivationSlot {
        ActivationSlot::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<FeatureMap>> {
        // the slot only holds plain data, a panicked writer cannot leave it inconsistent
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a tap that stores every observed feature map in this slot.
    pub fn tap(&self) -> Tap {
        let slot = Arc::clone(&self.slot);
        Box::new(move |map: &FeatureMap| {
            let mut guard = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            *guard = Some(map.clone());
        })
    }

    /// Removes and returns the captured feature map.
    pub fn take(&self) -> Option<FeatureMap> {
        self.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }
}
