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

//! When to pause classifier training for MI estimation

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A predicate over one-based training epochs.
#[derive(Clone)]
pub struct EpochPredicate(Arc<dyn Fn(usize) -> bool + Send + Sync>);

impl Debug for EpochPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EpochPredicate(..)")
    }
}

/// Schedule of the training epochs (one-based) after which MI is estimated.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiSchedule {
    /// An explicit allow-list of epochs
    Epochs(BTreeSet<usize>),
    /// Every `n`-th epoch
    Every(usize),
    /// Built with [`MiSchedule::from_fn`]; persisted through [`MiSchedule::resolve`]
    #[serde(skip)]
    Predicate(EpochPredicate),
}

impl MiSchedule {
    pub fn epochs<I: IntoIterator<Item = usize>>(epochs: I) -> MiSchedule {
        MiSchedule::Epochs(epochs.into_iter().collect())
    }

    pub fn from_fn<F: Fn(usize) -> bool + Send + Sync + 'static>(predicate: F) -> MiSchedule {
        MiSchedule::Predicate(EpochPredicate(Arc::new(predicate)))
    }

    pub fn contains(&self, epoch: usize) -> bool {
        match self {
            MiSchedule::Epochs(epochs) => epochs.contains(&epoch),
            MiSchedule::Every(n) => *n > 0 && epoch % n == 0,
            MiSchedule::Predicate(predicate) => (predicate.0)(epoch),
        }
    }

    /// Scheduled epochs in `1..=last`.
    pub fn scheduled(&self, last: usize) -> Vec<usize> {
        (1..=last).filter(|&epoch| self.contains(epoch)).collect()
    }

    /// Serializable equivalent over `1..=last`. Predicates become the allow-list they select.
    pub fn resolve(&self, last: usize) -> MiSchedule {
        match self {
            MiSchedule::Predicate(_) => MiSchedule::epochs(self.scheduled(last)),
            other => other.clone(),
        }
    }
}

impl Default for MiSchedule {
    fn default() -> Self {
        MiSchedule::epochs([1, 5, 10, 20, 40, 60, 100])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_allow_list() {
        assert_eq!(MiSchedule::default().scheduled(50), vec![1, 5, 10, 20, 40]);
        assert!(!MiSchedule::default().contains(2));
    }

    #[test]
    fn test_every_and_predicate() {
        assert_eq!(MiSchedule::Every(3).scheduled(10), vec![3, 6, 9]);
        assert!(MiSchedule::Every(0).scheduled(10).is_empty());
        let squares = MiSchedule::from_fn(|e| (e as f64).sqrt().fract() == 0.0);
        assert_eq!(squares.scheduled(20), vec![1, 4, 9, 16]);
    }

    #[test]
    fn test_toml() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            schedule: MiSchedule,
        }
        let parsed: Wrapper = toml::from_str("schedule = { epochs = [2, 4] }").unwrap();
        assert_eq!(parsed.schedule.scheduled(5), vec![2, 4]);
        let text = toml::to_string(&Wrapper {
            schedule: MiSchedule::Every(7),
        })
        .unwrap();
        assert!(text.contains("every = 7"));
    }

    #[test]
    fn test_predicate_resolves_to_allow_list() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            schedule: MiSchedule,
        }
        let odd = MiSchedule::from_fn(|e| e % 2 == 1);
        assert!(toml::to_string(&Wrapper { schedule: odd.clone() }).is_err());

        let text = toml::to_string(&Wrapper {
            schedule: odd.resolve(6),
        })
        .unwrap();
        let parsed: Wrapper = toml::from_str(&text).unwrap();
        assert_eq!(parsed.schedule.scheduled(6), vec![1, 3, 5]);
        assert_eq!(MiSchedule::Every(2).resolve(6).scheduled(10), vec![2, 4, 6, 8, 10]);
    }
}
