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

//! Observers of the MI estimation loop

use std::fs::File;
use std::path::Path;
use std::time::{Duration, Instant};

use console::style;
use indicatif::{HumanDuration, MultiProgress, ProgressBar, ProgressStyle};
use log::warn;

use super::estimate::Termination;
use crate::error::Result;

/// Statistics of one finished epoch of the estimation loop.
#[derive(Clone, Debug, PartialEq)]
pub struct EpochSummary {
    /// Zero-based epoch index
    pub epoch: usize,
    /// Mean loss over the valid batches, `NaN` if there were none
    pub mean_loss: f64,
    pub min_loss: f64,
    pub max_loss: f64,
    /// MI estimate appended to the history
    pub estimate: f64,
    pub valid_batches: usize,
    pub skipped_batches: usize,
    pub learning_rate: f64,
}

pub trait EstimationVisitor {
    fn start_estimation(&mut self, label: &str, epochs: usize, batches: usize);
    fn start_epoch(&mut self, epoch: usize);
    fn finish_batch(&mut self, batch: usize, loss: f64);
    fn finish_epoch(&mut self, summary: &EpochSummary);
    fn finish_estimation(&mut self, termination: &Termination);
}

fn epoch_bar(label: &str, epochs: usize) -> ProgressBar {
    let pb = ProgressBar::new(epochs as u64);
    let template = format!(
        "{: >12} {} {}",
        style("Estimating").cyan().bold(),
        label,
        "[{bar:25}] {pos:>3}/{len:3} ({elapsed}) {msg}"
    );
    match ProgressStyle::default_bar().template(&template) {
        Ok(sty) => pb.set_style(sty.progress_chars("=> ")),
        Err(err) => warn!("Invalid progress template: {}", err),
    }
    pb
}

/// Renders one progress bar per estimation run, optionally as part of a
/// shared [`MultiProgress`] so that parallel workers render together.
#[derive(Clone, Debug)]
pub struct EstimationConsole {
    pb: ProgressBar,
    multi: Option<MultiProgress>,
    label: String,
    timer: Instant,
}

impl EstimationConsole {
    pub fn new() -> EstimationConsole {
        EstimationConsole {
            pb: ProgressBar::hidden(),
            multi: None,
            label: String::new(),
            timer: Instant::now(),
        }
    }

    pub fn with_multi(multi: MultiProgress) -> EstimationConsole {
        EstimationConsole {
            multi: Some(multi),
            ..EstimationConsole::new()
        }
    }
}

impl Default for EstimationConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl EstimationVisitor for EstimationConsole {
    fn start_estimation(&mut self, label: &str, epochs: usize, _batches: usize) {
        let pb = epoch_bar(label, epochs);
        self.pb = match &self.multi {
            Some(multi) => multi.add(pb),
            None => pb,
        };
        self.pb.enable_steady_tick(Duration::from_secs(5));
        self.label = label.to_string();
        self.timer = Instant::now();
    }

    fn start_epoch(&mut self, _epoch: usize) {}

    fn finish_batch(&mut self, _batch: usize, _loss: f64) {}

    fn finish_epoch(&mut self, summary: &EpochSummary) {
        self.pb.set_message(format!("mi {:.4} loss {:.4}", summary.estimate, summary.mean_loss));
        self.pb.inc(1);
    }

    fn finish_estimation(&mut self, termination: &Termination) {
        self.pb.finish_and_clear();
        let line = format!(
            "{: >12} {} in {:#} ({})",
            style("Finished").green().bold(),
            self.label,
            HumanDuration(self.timer.elapsed()),
            termination
        );
        match &self.multi {
            Some(multi) => {
                if let Err(err) = multi.println(line) {
                    warn!("Failed to print progress: {}", err);
                }
            }
            None => println!("{}", line),
        }
    }
}

#[derive(serde::Serialize)]
struct CsvRow<'a> {
    label: &'a str,
    epoch: usize,
    mean_loss: f64,
    min_loss: f64,
    max_loss: f64,
    estimate: f64,
    valid_batches: usize,
    skipped_batches: usize,
    learning_rate: f64,
    time_ms: u128,
}

/// Writes one CSV row per epoch.
#[derive(Debug)]
pub struct EstimationCsv {
    writer: csv::Writer<File>,
    label: String,
    timer: Instant,
}

impl EstimationCsv {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<EstimationCsv> {
        Ok(EstimationCsv {
            writer: csv::Writer::from_path(path)?,
            label: String::new(),
            timer: Instant::now(),
        })
    }
}

impl EstimationVisitor for EstimationCsv {
    fn start_estimation(&mut self, label: &str, _epochs: usize, _batches: usize) {
        self.label = label.to_string();
    }

    fn start_epoch(&mut self, _epoch: usize) {
        self.timer = Instant::now();
    }

    fn finish_batch(&mut self, _batch: usize, _loss: f64) {}

    fn finish_epoch(&mut self, summary: &EpochSummary) {
        let row = CsvRow {
            label: &self.label,
            epoch: summary.epoch,
            mean_loss: summary.mean_loss,
            min_loss: summary.min_loss,
            max_loss: summary.max_loss,
            estimate: summary.estimate,
            valid_batches: summary.valid_batches,
            skipped_batches: summary.skipped_batches,
            learning_rate: summary.learning_rate,
            time_ms: self.timer.elapsed().as_millis(),
        };
        if let Err(err) = self.writer.serialize(row).and_then(|_| self.writer.flush().map_err(csv::Error::from)) {
            warn!("Failed to write estimation log row: {}", err);
        }
    }

    fn finish_estimation(&mut self, _termination: &Termination) {
        if let Err(err) = self.writer.flush() {
            warn!("Failed to flush estimation log: {}", err);
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct NoOpVisitor {}

impl EstimationVisitor for NoOpVisitor {
    fn start_estimation(&mut self, _: &str, _: usize, _: usize) {}
    fn start_epoch(&mut self, _: usize) {}
    fn finish_batch(&mut self, _: usize, _: f64) {}
    fn finish_epoch(&mut self, _: &EpochSummary) {}
    fn finish_estimation(&mut self, _: &Termination) {}
}
