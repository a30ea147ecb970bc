// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The periodic packing pass. Best-Fit Decreasing over group packet loads
//! with an 80% per-core ceiling; groups that went idle are parked on the
//! startup core and detached.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use faas_config::params::PKT_LOAD_CEILING;

use crate::sgroup::{SGroup, SgSnapshot};
use crate::worker::Worker;

impl Worker {
    /// Park a ready-but-idle group: re-home it to the startup core first so
    /// the detach never races an execution on a shared core, then detach.
    /// Groups already cold on the startup core are left untouched.
    async fn park_idle(&self, sg: &Arc<SGroup>, snap: &SgSnapshot) {
        if !snap.sched || snap.core_id == Some(self.startup_core()) {
            return;
        }
        if let Err(e) = sg.attach(self.startup_core()).await {
            warn!("worker '{}': parking sgroup {} failed: {e}", self.name(), snap.id);
            return;
        }
        if let Err(e) = sg.detach().await {
            warn!("worker '{}': detaching sgroup {} failed: {e}", self.name(), snap.id);
        }
    }

    /// One Best-Fit-Decreasing pass. The worker's group pools stay locked
    /// for the whole pass, so it operates on a frozen worker.
    pub(crate) async fn schedule_once(&self) {
        let sets = self.sgs().lock().await;
        let mut loaded = Vec::with_capacity(sets.sgroups.len());
        for sg in &sets.sgroups {
            loaded.push((sg.clone(), sg.snapshot().await));
        }
        loaded.sort_by(|a, b| {
            b.1.pkt_load
                .partial_cmp(&a.1.pkt_load)
                .unwrap_or(Ordering::Equal)
        });

        let last_core = self.core_offset() + self.core_count() as u32 - 1;
        let mut core = self.core_offset();
        // Start saturated so the first group advances past the startup core.
        let mut load = PKT_LOAD_CEILING;

        for (sg, snap) in loaded {
            if !snap.ready {
                continue;
            }
            if !snap.active {
                self.park_idle(&sg, &snap).await;
                continue;
            }

            let sg_load = snap.pkt_load;
            if load + sg_load < PKT_LOAD_CEILING {
                load += sg_load;
            } else if core < last_core {
                core += 1;
                load = sg_load;
            } else {
                warn!("worker '{}': out of cores", self.name());
                break;
            }
            debug!(
                "worker '{}': sgroup {} (load {sg_load:.1}) -> core {core}",
                self.name(),
                snap.id
            );
            if let Err(e) = sg.attach(core).await {
                warn!("worker '{}': attach of sgroup {} failed: {e}", self.name(), snap.id);
            }
        }
        drop(sets);
    }

    /// Drop-in alternative policy: every active group gets an idle core of
    /// its own; no co-location.
    pub(crate) async fn schedule_once_no_packing(&self) {
        let sets = self.sgs().lock().await;
        let mut loaded = Vec::with_capacity(sets.sgroups.len());
        for sg in &sets.sgroups {
            loaded.push((sg.clone(), sg.snapshot().await));
        }

        for (sg, snap) in loaded {
            if !snap.ready {
                continue;
            }
            if !snap.active {
                self.park_idle(&sg, &snap).await;
                continue;
            }
            // Already alone on a serving core: leave it be.
            if let Some(core) = snap.core_id {
                if snap.sched
                    && core != self.startup_core()
                    && self.core_members(core) == vec![snap.id]
                {
                    continue;
                }
            }
            let Some(core) = self.pick_idle_core() else {
                warn!("worker '{}': out of cores", self.name());
                break;
            };
            if let Err(e) = sg.attach(core).await {
                warn!("worker '{}': attach of sgroup {} failed: {e}", self.name(), snap.id);
            }
        }
        drop(sets);
    }
}
