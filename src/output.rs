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

//! Persistence of MI curves, scores and training statistics

use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use ndarray::{Array1, Array2};
use ndarray_npy::write_npy;
use serde::Serialize;

use crate::analysis::SuspiciousReport;
use crate::error::Result;
use crate::mi::pairing::Pairing;
use crate::train::trainer::{Checkpoint, EpochRecord, TrainConfig};
use crate::train::worker::ClassResult;

pub const RUN_CONFIG: &str = "run_config.toml";
pub const TRAINING_HISTORY: &str = "training_history.csv";
pub const CLASS_LOSSES: &str = "train_loss_by_class.npy";
pub const CLASS_ACCURACY: &str = "class_accuracy.csv";
pub const MODEL: &str = "model.npz";
pub const BEST_MODEL: &str = "best_model.npz";

pub fn mi_curve_path(dir: &Path, pairing: Pairing, epoch: usize) -> PathBuf {
    dir.join(format!("mi_{}_epoch_{}.csv", pairing, epoch))
}

pub fn suspicious_path(dir: &Path, pairing: Pairing, epoch: usize, extension: &str) -> PathBuf {
    dir.join(format!("suspicious_samples_by_{}_epoch_{}.{}", pairing, epoch, extension))
}

pub fn suspicious_summary_path(dir: &Path, pairing: Pairing, epoch: usize) -> PathBuf {
    dir.join(format!("suspicious_summary_by_{}_epoch_{}.csv", pairing, epoch))
}

pub fn mi_history_path(dir: &Path, pairing: Pairing) -> PathBuf {
    dir.join(format!("mi_history_{}.csv", pairing))
}

#[derive(Serialize)]
struct CurveRow {
    class: String,
    mi_epoch: usize,
    mi: f64,
}

#[derive(Serialize)]
struct HistoryRow {
    train_epoch: usize,
    class: String,
    mi_epoch: usize,
    mi: f64,
}

#[derive(Serialize)]
struct SuspiciousRow<'a> {
    class: String,
    class_name: &'a str,
    position: usize,
    sample_index: usize,
    score: f64,
}

#[derive(Serialize)]
struct SummaryRow<'a> {
    class: String,
    class_name: &'a str,
    scored: usize,
    mean: f64,
    std: f64,
    min: f64,
    max: f64,
    suspicious: usize,
}

#[derive(Serialize)]
struct ClassAccuracyRow {
    class: usize,
    train_accuracy: f64,
    test_accuracy: f64,
}

/// Writes the run configuration, with a predicate schedule replaced by the epochs it selects.
pub fn write_config(dir: &Path, config: &TrainConfig) -> Result<()> {
    let persisted = TrainConfig {
        schedule: config.schedule.resolve(config.epochs),
        ..config.clone()
    };
    fs::write(dir.join(RUN_CONFIG), toml::to_string_pretty(&persisted)?)?;
    Ok(())
}

/// Writes the MI curves of one checkpoint as a long CSV table and, per
/// class, the curve and the average sample scores as `.npy` arrays.
pub fn write_checkpoint(dir: &Path, pairing: Pairing, epoch: usize, results: &[ClassResult]) -> Result<()> {
    let path = mi_curve_path(dir, pairing, epoch);
    let mut writer = csv::Writer::from_path(&path)?;
    for result in results {
        for (mi_epoch, &mi) in result.report.history.iter().enumerate() {
            writer.serialize(CurveRow {
                class: result.class.to_string(),
                mi_epoch: mi_epoch + 1,
                mi,
            })?;
        }
        let prefix = format!("{}_epoch_{}_class_{}", pairing, epoch, result.class);
        write_npy(
            dir.join(format!("mi_{}.npy", prefix)),
            &Array1::from_vec(result.report.history.clone()),
        )?;
        write_npy(dir.join(format!("scores_{}.npy", prefix)), &result.report.sample_scores)?;
    }
    writer.flush()?;
    debug!("Wrote MI curves of {} classes to {}", results.len(), path.display());
    Ok(())
}

/// Writes the suspicious samples as CSV and as an `n x 3` array of
/// `(class label, sample index, score)`, plus the per-class score summary.
pub fn write_suspicious(dir: &Path, pairing: Pairing, epoch: usize, report: &SuspiciousReport) -> Result<()> {
    let mut writer = csv::Writer::from_path(suspicious_path(dir, pairing, epoch, "csv"))?;
    let mut table = Array2::<f64>::zeros((report.samples.len(), 3));
    for (sample, mut row) in report.samples.iter().zip(table.outer_iter_mut()) {
        writer.serialize(SuspiciousRow {
            class: sample.class.to_string(),
            class_name: &sample.class.display_name(),
            position: sample.position,
            sample_index: sample.sample_index,
            score: sample.score,
        })?;
        row[0] = sample.class.label() as f64;
        row[1] = sample.sample_index as f64;
        row[2] = sample.score;
    }
    writer.flush()?;
    write_npy(suspicious_path(dir, pairing, epoch, "npy"), &table)?;

    let mut writer = csv::Writer::from_path(suspicious_summary_path(dir, pairing, epoch))?;
    for summary in &report.per_class {
        writer.serialize(SummaryRow {
            class: summary.class.to_string(),
            class_name: &summary.class.display_name(),
            scored: summary.scored,
            mean: summary.mean,
            std: summary.std,
            min: summary.min,
            max: summary.max,
            suspicious: summary.suspicious,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes all MI curves of one pairing across checkpoints.
pub fn write_mi_history(dir: &Path, pairing: Pairing, checkpoints: &[Checkpoint]) -> Result<()> {
    let mut writer = csv::Writer::from_path(mi_history_path(dir, pairing))?;
    for checkpoint in checkpoints.iter().filter(|c| c.pairing == pairing) {
        for result in &checkpoint.results {
            for (mi_epoch, &mi) in result.report.history.iter().enumerate() {
                writer.serialize(HistoryRow {
                    train_epoch: checkpoint.epoch,
                    class: result.class.to_string(),
                    mi_epoch: mi_epoch + 1,
                    mi,
                })?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn write_training_history(dir: &Path, records: &[EpochRecord]) -> Result<()> {
    let mut writer = csv::Writer::from_path(dir.join(TRAINING_HISTORY))?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes the per-class training losses as an `epochs x classes` array.
pub fn write_class_losses(dir: &Path, losses: &[Array1<f64>]) -> Result<()> {
    let classes = losses.first().map_or(0, |l| l.len());
    let mut table = Array2::<f64>::from_elem((losses.len(), classes), f64::NAN);
    for (mut row, epoch) in table.outer_iter_mut().zip(losses) {
        row.assign(epoch);
    }
    write_npy(dir.join(CLASS_LOSSES), &table)?;
    Ok(())
}

pub fn write_class_accuracy(dir: &Path, train: &[f64], test: &[f64]) -> Result<()> {
    let mut writer = csv::Writer::from_path(dir.join(CLASS_ACCURACY))?;
    for (class, (&train_accuracy, &test_accuracy)) in train.iter().zip(test).enumerate() {
        writer.serialize(ClassAccuracyRow {
            class,
            train_accuracy,
            test_accuracy,
        })?;
    }
    writer.flush()?;
    Ok(())
}
