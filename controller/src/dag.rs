// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! User-specified NF DAGs. A DAG may be edited freely before activation;
//! activation derives the linear chain of function types and freezes it.

use std::fmt;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::info;

use crate::flowlet::{FiveTuple, Flowlet};
use crate::sgroup::SGroup;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DagError {
    #[error("invalid NF id {0}")]
    InvalidNfId(usize),

    #[error("the graph needs exactly one ingress NF")]
    InvalidIngress,

    #[error("NF {0} has multiple successors; branching graphs are not supported")]
    BranchingNotSupported(usize),
}

/// One logical NF. Immutable once the owning DAG is activated.
#[derive(Debug, Clone)]
pub struct Nf {
    pub id: usize,
    pub func_type: String,
    pub prev: Vec<usize>,
    pub next: Vec<usize>,
}

#[derive(Default)]
struct Graph {
    nfs: Vec<Nf>,
    flowlets: Vec<Flowlet>,
    chain: Vec<String>,
    active: bool,
}

/// A user's deployment: the NF graph, its match rules, the activated chain
/// and the scheduling groups currently serving it.
pub struct Dag {
    user: String,
    graph: Mutex<Graph>,
    sgroups: Mutex<Vec<Arc<SGroup>>>,
}

impl Dag {
    pub fn new(user: impl Into<String>) -> Self {
        Dag {
            user: user.into(),
            graph: Mutex::new(Graph::default()),
            sgroups: Mutex::new(Vec::new()),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Add a logical NF; returns its handle.
    pub fn add_nf(&self, func_type: impl Into<String>) -> usize {
        let mut graph = self.graph.lock().expect("dag lock poisoned");
        let id = graph.nfs.len();
        graph.nfs.push(Nf {
            id,
            func_type: func_type.into(),
            prev: Vec::new(),
            next: Vec::new(),
        });
        id
    }

    /// Connect NF `up` to NF `down`.
    pub fn connect_nfs(&self, up: usize, down: usize) -> Result<(), DagError> {
        let mut graph = self.graph.lock().expect("dag lock poisoned");
        let count = graph.nfs.len();
        if up >= count {
            return Err(DagError::InvalidNfId(up));
        }
        if down >= count {
            return Err(DagError::InvalidNfId(down));
        }
        graph.nfs[up].next.push(down);
        graph.nfs[down].prev.push(up);
        Ok(())
    }

    pub fn add_flowlet(&self, flowlet: Flowlet) {
        let mut graph = self.graph.lock().expect("dag lock poisoned");
        graph.flowlets.push(flowlet);
    }

    /// Whether any of the DAG's flowlets selects `flow`.
    pub fn matches(&self, flow: &FiveTuple) -> bool {
        let graph = self.graph.lock().expect("dag lock poisoned");
        graph.flowlets.iter().any(|f| f.matches(flow))
    }

    /// Derive the linear chain and mark the DAG active. The graph must have
    /// exactly one source NF and no branches on the source-to-sink walk.
    /// Idempotent while the graph is unchanged.
    pub fn activate(&self) -> Result<Vec<String>, DagError> {
        let mut graph = self.graph.lock().expect("dag lock poisoned");

        let mut sources = graph.nfs.iter().filter(|nf| nf.prev.is_empty());
        let ingress = sources.next().ok_or(DagError::InvalidIngress)?;
        if sources.next().is_some() {
            return Err(DagError::InvalidIngress);
        }

        let mut chain = Vec::new();
        let mut curr = ingress;
        loop {
            chain.push(curr.func_type.clone());
            match curr.next.as_slice() {
                [] => break,
                [next] => curr = &graph.nfs[*next],
                _ => return Err(DagError::BranchingNotSupported(curr.id)),
            }
        }

        info!("user '{}': activated chain {:?}", self.user, chain);
        graph.chain = chain.clone();
        graph.active = true;
        Ok(chain)
    }

    pub fn is_active(&self) -> bool {
        self.graph.lock().expect("dag lock poisoned").active
    }

    pub fn chain(&self) -> Vec<String> {
        self.graph.lock().expect("dag lock poisoned").chain.clone()
    }

    pub fn add_sgroup(&self, sg: Arc<SGroup>) {
        let mut sgroups = self.sgroups.lock().expect("dag lock poisoned");
        if !sgroups.iter().any(|s| s.id() == sg.id()) {
            sgroups.push(sg);
        }
    }

    pub fn remove_sgroup(&self, id: usize) {
        let mut sgroups = self.sgroups.lock().expect("dag lock poisoned");
        sgroups.retain(|s| s.id() != id);
    }

    pub fn sgroups(&self) -> Vec<Arc<SGroup>> {
        self.sgroups.lock().expect("dag lock poisoned").clone()
    }
}

impl fmt::Display for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let graph = self.graph.lock().expect("dag lock poisoned");
        writeln!(
            f,
            "user '{}': {} ({} NFs, {} flowlets)",
            self.user,
            if graph.active { "active" } else { "inactive" },
            graph.nfs.len(),
            graph.flowlets.len()
        )?;
        for nf in &graph.nfs {
            writeln!(f, "  [{}] {} -> {:?}", nf.id, nf.func_type, nf.next)?;
        }
        for rule in &graph.flowlets {
            writeln!(f, "  flowlet {rule}")?;
        }
        if graph.active {
            writeln!(f, "  chain {:?}", graph.chain)?;
        }
        let sgroups = self.sgroups.lock().expect("dag lock poisoned");
        write!(f, "  serving sgroups: {:?}", sgroups.iter().map(|s| s.id()).collect::<Vec<_>>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_dag() -> Dag {
        let dag = Dag::new("u");
        assert_eq!(dag.add_nf("vlanpush"), 0);
        assert_eq!(dag.add_nf("acl"), 1);
        dag.connect_nfs(0, 1).expect("connect");
        dag
    }

    #[test]
    fn activation_walks_the_chain() {
        let dag = linear_dag();
        let chain = dag.activate().expect("activate");
        assert_eq!(chain, vec!["vlanpush".to_string(), "acl".to_string()]);
        assert!(dag.is_active());

        // Idempotent while the graph is unchanged.
        let again = dag.activate().expect("activate twice");
        assert_eq!(again, chain);
        assert_eq!(dag.chain(), chain);
    }

    #[test]
    fn activation_requires_one_source() {
        let dag = Dag::new("u");
        dag.add_nf("a");
        dag.add_nf("b");
        // Two NFs without edges: two sources.
        assert_eq!(dag.activate(), Err(DagError::InvalidIngress));

        let empty = Dag::new("v");
        assert_eq!(empty.activate(), Err(DagError::InvalidIngress));
    }

    #[test]
    fn branching_is_rejected() {
        let dag = Dag::new("u");
        dag.add_nf("a");
        dag.add_nf("b");
        dag.add_nf("c");
        dag.connect_nfs(0, 1).expect("connect");
        dag.connect_nfs(0, 2).expect("connect");
        assert_eq!(dag.activate(), Err(DagError::BranchingNotSupported(0)));
        assert!(!dag.is_active());
    }

    #[test]
    fn connect_validates_ids() {
        let dag = linear_dag();
        assert_eq!(dag.connect_nfs(0, 7), Err(DagError::InvalidNfId(7)));
        assert_eq!(dag.connect_nfs(9, 1), Err(DagError::InvalidNfId(9)));
    }

    #[test]
    fn flow_matching_uses_any_rule() {
        let dag = linear_dag();
        dag.add_flowlet(Flowlet {
            src_ip: String::new(),
            dst_ip: String::new(),
            src_port: 0,
            dst_port: 8080,
            proto: 0,
        });
        let hit = FiveTuple {
            src_ip: "1.1.1.1".into(),
            dst_ip: "2.2.2.2".into(),
            src_port: 1000,
            dst_port: 8080,
            proto: 6,
        };
        assert!(dag.matches(&hit));
        let miss = FiveTuple {
            dst_port: 22,
            ..hit
        };
        assert!(!dag.matches(&miss));
    }
}
