// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Test-window telemetry aggregation. A window opens on the first sample
//! with any active core or traffic and closes after five idle samples; the
//! key metrics of each window are written to `faas_<n>.log`.

use std::fmt::Write as _;
use std::fs;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use faas_config::params::SCHEDULE_INTERVAL;

use crate::faas::FaasController;

/// Idle samples that close a measurement window.
const WINDOW_IDLE_SAMPLES: usize = 5;

#[derive(Debug, Clone, Copy)]
struct Sample {
    cores: u64,
    kpps: f64,
}

pub struct FaasLogger {
    controller: Arc<FaasController>,
}

impl FaasLogger {
    pub fn new(controller: Arc<FaasController>) -> Self {
        FaasLogger { controller }
    }

    /// Sample the cluster every scheduler tick until `stop` closes.
    pub async fn run(self, mut stop: mpsc::Receiver<()>) {
        let mut tick = interval(SCHEDULE_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut window: Vec<Sample> = Vec::new();
        let mut logging = false;
        let mut idle = 0usize;
        let mut index = 0usize;

        loop {
            tokio::select! {
                _ = stop.recv() => break,
                _ = tick.tick() => {}
            }

            let (cores, kpps) = self.controller.load_summary().await;
            let sample = Sample { cores, kpps };

            if !logging && (cores > 0 || kpps > 0.0) {
                info!("logging test window {index} to faas_{index}.log");
                logging = true;
                window.clear();
                idle = 0;
            }
            if !logging {
                continue;
            }

            window.push(sample);
            if cores == 0 && kpps == 0.0 {
                idle += 1;
            } else {
                idle = 0;
            }
            if idle >= WINDOW_IDLE_SAMPLES {
                window.truncate(window.len().saturating_sub(WINDOW_IDLE_SAMPLES));
                self.write_window(index, &window);
                info!("test window {index} closed after {} samples", window.len());
                index += 1;
                logging = false;
            }
        }
    }

    fn write_window(&self, index: usize, samples: &[Sample]) {
        if samples.is_empty() {
            return;
        }
        let duration_ms = samples.len() as u64 * SCHEDULE_INTERVAL.as_millis() as u64;
        let max_cores = samples.iter().map(|s| s.cores).max().unwrap_or(0);
        let avg_cores =
            samples.iter().map(|s| s.cores).sum::<u64>() as f64 / samples.len() as f64;
        let avg_kpps = samples.iter().map(|s| s.kpps).sum::<f64>() / samples.len() as f64;

        let mut out = String::new();
        let _ = writeln!(out, "duration_ms {duration_ms}");
        let _ = writeln!(out, "samples {}", samples.len());
        let _ = writeln!(out, "avg_cores {avg_cores:.2}");
        let _ = writeln!(out, "max_cores {max_cores}");
        let _ = writeln!(out, "avg_kpps {avg_kpps:.2}");
        for (i, s) in samples.iter().enumerate() {
            let _ = writeln!(out, "{i} {} {:.2}", s.cores, s.kpps);
        }

        let path = format!("faas_{index}.log");
        if let Err(e) = fs::write(&path, out) {
            error!("failed to write {path}: {e}");
        }
    }
}
