// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Internally synchronized resource pools.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::sgroup::SGroup;

/// A pool of integer indices handed out lowest-first.
pub struct IndexPool {
    name: String,
    heap: Mutex<BinaryHeap<Reverse<u32>>>,
}

impl IndexPool {
    /// A pool over `[base, base + count)`.
    pub fn new(name: impl Into<String>, base: u32, count: u32) -> Self {
        let heap = (base..base + count).map(Reverse).collect();
        IndexPool {
            name: name.into(),
            heap: Mutex::new(heap),
        }
    }

    /// The lowest index still available.
    pub fn take(&self) -> Option<u32> {
        let mut heap = self.heap.lock().expect("pool lock poisoned");
        heap.pop().map(|Reverse(idx)| idx)
    }

    /// Return an index to the pool. Double frees are dropped.
    pub fn free(&self, idx: u32) {
        let mut heap = self.heap.lock().expect("pool lock poisoned");
        if heap.iter().any(|Reverse(i)| *i == idx) {
            warn!("pool '{}': index {idx} freed twice", self.name);
            return;
        }
        heap.push(Reverse(idx));
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Instances whose containers are up but whose thread ids have not been
/// reported yet, keyed by instance host port. Resolves a tid callback to
/// the owning scheduling group.
#[derive(Default)]
pub struct StartupPool {
    pool: Mutex<HashMap<u16, Arc<SGroup>>>,
}

impl StartupPool {
    pub fn new() -> Self {
        StartupPool::default()
    }

    pub fn add(&self, port: u16, sg: Arc<SGroup>) {
        let mut pool = self.pool.lock().expect("startup pool lock poisoned");
        if pool.insert(port, sg).is_some() {
            warn!("instance {port} was already waiting for its tid");
        }
    }

    pub fn get(&self, port: u16) -> Option<Arc<SGroup>> {
        self.pool
            .lock()
            .expect("startup pool lock poisoned")
            .get(&port)
            .cloned()
    }

    pub fn remove(&self, port: u16) {
        self.pool.lock().expect("startup pool lock poisoned").remove(&port);
    }

    pub fn len(&self) -> usize {
        self.pool.lock().expect("startup pool lock poisoned").len()
    }

    /// Number of distinct groups still waiting on at least one tid.
    pub fn pending_groups(&self) -> usize {
        let pool = self.pool.lock().expect("startup pool lock poisoned");
        let mut ids: Vec<usize> = pool.values().map(|sg| sg.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_come_out_lowest_first() {
        let pool = IndexPool::new("test", 50052, 3);
        assert_eq!(pool.take(), Some(50052));
        assert_eq!(pool.take(), Some(50053));
        pool.free(50052);
        assert_eq!(pool.take(), Some(50052));
        assert_eq!(pool.take(), Some(50054));
        assert_eq!(pool.take(), None);
    }

    #[test]
    fn double_free_is_dropped() {
        let pool = IndexPool::new("test", 0, 2);
        assert_eq!(pool.take(), Some(0));
        pool.free(0);
        pool.free(0);
        assert_eq!(pool.len(), 2);
    }
}
