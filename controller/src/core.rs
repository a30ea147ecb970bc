// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Logical CPU core record: the set of scheduling groups assigned to it.

use std::collections::HashSet;
use std::fmt;

#[derive(Debug, Clone)]
pub struct Core {
    pub id: u32,
    sgroups: HashSet<usize>,
}

impl Core {
    pub fn new(id: u32) -> Self {
        Core {
            id,
            sgroups: HashSet::new(),
        }
    }

    pub fn add(&mut self, sg: usize) {
        self.sgroups.insert(sg);
    }

    pub fn remove(&mut self, sg: usize) {
        self.sgroups.remove(&sg);
    }

    pub fn contains(&self, sg: usize) -> bool {
        self.sgroups.contains(&sg)
    }

    pub fn is_empty(&self) -> bool {
        self.sgroups.is_empty()
    }

    pub fn sgroups(&self) -> Vec<usize> {
        let mut ids: Vec<usize> = self.sgroups.iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl fmt::Display for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "core {}: sgroups {:?}", self.id, self.sgroups())
    }
}
