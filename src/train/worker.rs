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

//! Per-class MI estimation workers.
//!
//! Every worker owns its loader, classifier, statistics network and
//! optimizer. Workers receive a shared immutable [`ClassifierSnapshot`] and
//! report back with a single [`WorkerMessage`].

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Sender};
use indicatif::MultiProgress;
use log::{debug, error, info};

use crate::data::dataset::{ClassKey, Dataset};
use crate::data::loader::{Loader, OrderOption};
use crate::error::{Error, Result};
use crate::mi::estimate::{estimate_mi, MiConfig, MiReport};
use crate::mi::pairing::Pairing;
use crate::mi::visit::{EstimationConsole, EstimationVisitor, NoOpVisitor};
use crate::model::dense::DenseClassifier;
use crate::model::snapshot::ClassifierSnapshot;

/// Everything a worker needs besides the classifier weights.
#[derive(Clone, Debug)]
pub struct WorkerTask {
    pub class: ClassKey,
    pub shard: PathBuf,
    pub config: MiConfig,
    pub batch_size: usize,
    /// Leading fraction of the shuffled shard to estimate on
    pub subset_fraction: f64,
    pub order_seed: u64,
}

impl WorkerTask {
    pub fn pairing(&self) -> Pairing {
        self.config.pairing
    }

    pub fn label(&self) -> String {
        format!("{} {}", self.config.pairing, self.class.display_name())
    }

    pub fn loader(&self) -> Result<Loader> {
        let dataset = Dataset::load_npz(&self.shard)?;
        if dataset.is_empty() {
            return Err(Error::EmptyDataset(self.shard.clone()));
        }
        Loader::new(dataset, self.batch_size, OrderOption::Random { seed: self.order_seed })?
            .truncate(self.subset_fraction)
    }
}

/// MI estimate of one observed class.
#[derive(Clone, Debug)]
pub struct ClassResult {
    pub class: ClassKey,
    pub report: MiReport,
    /// Shard index of the sample at every position of the score array
    pub sample_indices: Vec<usize>,
}

/// Result of one worker, sent back to the orchestrator.
#[derive(Debug)]
pub struct WorkerMessage {
    pub class: ClassKey,
    pub pairing: Pairing,
    pub result: Result<ClassResult>,
}

/// Rebuilds the classifier from `snapshot` and runs the estimation loop on
/// the shard of `task`.
pub fn run_worker<V: EstimationVisitor + ?Sized>(
    task: &WorkerTask,
    snapshot: &ClassifierSnapshot,
    visitor: &mut V,
) -> Result<ClassResult> {
    let loader = task.loader()?;
    debug!(
        "{}: {} samples in {} batches from {}",
        task.label(),
        loader.num_samples(),
        loader.len(),
        task.shard.display()
    );
    let mut classifier = DenseClassifier::from_snapshot(snapshot);
    let report = estimate_mi(&mut classifier, &loader, &task.config, &task.label(), visitor)?;
    let sample_indices = (0..loader.num_samples()).filter_map(|p| loader.sample_index(p)).collect();
    Ok(ClassResult {
        class: task.class,
        report,
        sample_indices,
    })
}

fn worker_body(task: WorkerTask, snapshot: Arc<ClassifierSnapshot>, progress: Option<MultiProgress>, tx: Sender<WorkerMessage>) {
    let result = match progress {
        Some(multi) => run_worker(&task, &snapshot, &mut EstimationConsole::with_multi(multi)),
        None => run_worker(&task, &snapshot, &mut NoOpVisitor {}),
    };
    let message = WorkerMessage {
        class: task.class,
        pairing: task.pairing(),
        result,
    };
    if let Err(err) = tx.send(message) {
        error!("Failed to report result of {}: {}", task.label(), err);
    }
}

/// Runs one worker thread per task and blocks until all of them finished.
///
/// Results are returned in the order of `tasks`. The first failing worker
/// fails the whole pool.
pub fn run_pool(
    snapshot: Arc<ClassifierSnapshot>,
    tasks: Vec<WorkerTask>,
    progress: Option<MultiProgress>,
) -> Result<Vec<ClassResult>> {
    let (tx, rx) = unbounded::<WorkerMessage>();
    let mut handles = Vec::with_capacity(tasks.len());
    let order = tasks.iter().map(|t| (t.class, t.pairing())).collect::<Vec<_>>();

    for task in tasks {
        let key = (task.class, task.pairing());
        let name = format!("mi-{}-{}", task.pairing(), task.class);
        let snapshot = Arc::clone(&snapshot);
        let progress = progress.clone();
        let tx = tx.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || worker_body(task, snapshot, progress, tx))?;
        handles.push((key, handle));
    }
    drop(tx);

    let mut messages = rx.iter().collect::<Vec<_>>();

    let mut panicked = None;
    for ((class, pairing), handle) in handles {
        if handle.join().is_err() && panicked.is_none() {
            panicked = Some(Error::WorkerPanicked { class, pairing });
        }
    }
    if let Some(err) = panicked {
        return Err(err);
    }

    let mut results = Vec::with_capacity(order.len());
    for (class, pairing) in order {
        let pos = messages
            .iter()
            .position(|m| m.class == class && m.pairing == pairing)
            .ok_or(Error::WorkerPanicked { class, pairing })?;
        let message = messages.swap_remove(pos);
        match message.result {
            Ok(result) => {
                info!(
                    "MI worker {} {} finished after {} epochs ({})",
                    pairing,
                    class.display_name(),
                    result.report.history.len(),
                    result.report.termination
                );
                results.push(result);
            }
            Err(source) => {
                return Err(Error::Worker {
                    class,
                    pairing,
                    source: Box::new(source),
                })
            }
        }
    }
    Ok(results)
}
