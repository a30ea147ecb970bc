// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Command parsing and execution against the controller.

use std::str::FromStr;
use std::sync::Arc;

use faas_controller::{FaasController, FiveTuple};

/// First words recognized by the shell, for completion.
pub(crate) const COMMANDS: &[&str] = &[
    "pods", "deps", "nodes", "workers", "add", "rm", "attach", "detach", "kubectl", "flow",
    "deploy", "connect", "show", "activate", "cycle", "batch", "quit",
];

const USAGE: &str = "\
commands:
  pods | deps | nodes | workers [name]
  add <node> <nf>...         deploy a chain on a node
  rm <node> <gid>            destroy a chain
  attach <node> <gid> <core> | detach <node> <gid>
  kubectl rm <deployment>
  flow <sip> <sport> <dip> <dport> <proto>
  deploy <user> <nf> | connect <user> <up> <down>
  show <user|all> | activate <user>
  cycle <node> <port> <cpp> | batch <node> <port> <size> <num>
  quit";

pub struct Executor {
    controller: Arc<FaasController>,
    rt: tokio::runtime::Handle,
}

impl Executor {
    pub fn new(controller: Arc<FaasController>, rt: tokio::runtime::Handle) -> Self {
        Executor { controller, rt }
    }

    /// Run one input line. Returns false once the operator quits.
    pub fn execute(&self, line: &str) -> bool {
        let words: Vec<&str> = line.split_whitespace().collect();
        let c = &self.controller;
        match words.as_slice() {
            [] => {}

            ["quit"] => {
                if let Err(e) = self.rt.block_on(c.close()) {
                    println!("shutdown finished with errors: {e}");
                }
                return false;
            }

            ["pods"] => match self.rt.block_on(c.orchestrator().pods()) {
                Ok(pods) => {
                    println!("| {:<45}| {:<10}| {:<14}|", "Pod", "Node", "Status");
                    for pod in pods {
                        println!("| {:<45}| {:<10}| {:<14}|", pod.name, pod.node, pod.status);
                    }
                }
                Err(e) => println!("failed to list pods: {e}"),
            },

            ["deps"] => match self.rt.block_on(c.orchestrator().deployments()) {
                Ok(deps) => deps.iter().for_each(|d| println!("{d}")),
                Err(e) => println!("failed to list deployments: {e}"),
            },

            ["nodes"] => match self.rt.block_on(c.orchestrator().nodes()) {
                Ok(nodes) => nodes.iter().for_each(|n| println!("{n}")),
                Err(e) => println!("failed to list nodes: {e}"),
            },

            ["workers"] => print!("{}", self.rt.block_on(c.describe_workers())),

            ["workers", name] => match self.rt.block_on(c.describe_worker(name)) {
                Ok(info) => print!("{info}"),
                Err(e) => println!("{e}"),
            },

            ["add", node, nfs @ ..] if !nfs.is_empty() => {
                let chain: Vec<String> = nfs.iter().map(|s| s.to_string()).collect();
                match self.rt.block_on(c.create_sgroup(node, &chain)) {
                    Ok(id) => println!("deployed sgroup {id} on {node}"),
                    Err(e) => println!("failed to deploy on {node}: {e}"),
                }
            }

            ["rm", node, gid] => {
                let Some(gid) = parse::<usize>(gid, "sgroup id") else {
                    return true;
                };
                if let Err(e) = self.rt.block_on(c.destroy_sgroup(node, gid)) {
                    println!("failed to destroy sgroup {gid}: {e}");
                }
            }

            ["attach", node, gid, core] => {
                let (Some(gid), Some(core)) =
                    (parse::<usize>(gid, "sgroup id"), parse::<u32>(core, "core"))
                else {
                    return true;
                };
                if let Err(e) = self.rt.block_on(c.attach_sgroup(node, gid, core)) {
                    println!("failed to attach sgroup {gid}: {e}");
                }
            }

            ["detach", node, gid] => {
                let Some(gid) = parse::<usize>(gid, "sgroup id") else {
                    return true;
                };
                if let Err(e) = self.rt.block_on(c.detach_sgroup(node, gid)) {
                    println!("failed to detach sgroup {gid}: {e}");
                }
            }

            ["kubectl", "rm", deployment] => {
                match self.rt.block_on(c.orchestrator().delete(deployment)) {
                    Ok(()) => println!("removed deployment {deployment}"),
                    Err(e) => println!("failed to remove {deployment}: {e}"),
                }
            }

            ["flow", sip, sport, dip, dport, proto] => {
                let (Some(src_port), Some(dst_port), Some(proto)) = (
                    parse::<u32>(sport, "src port"),
                    parse::<u32>(dport, "dst port"),
                    parse::<u32>(proto, "protocol"),
                ) else {
                    return true;
                };
                let flow = FiveTuple {
                    src_ip: sip.to_string(),
                    dst_ip: dip.to_string(),
                    src_port,
                    dst_port,
                    proto,
                };
                match self.rt.block_on(c.update_flow(&flow)) {
                    Ok(entry) => {
                        println!("-> switch port {}, dmac {}", entry.switch_port, entry.dmac)
                    }
                    Err(e) => println!("flow not served: {e}"),
                }
            }

            ["deploy", user, nf] => {
                println!("NF {} added as id {}", nf, c.add_nf(user, nf));
            }

            ["connect", user, up, down] => {
                let (Some(up), Some(down)) =
                    (parse::<usize>(up, "NF id"), parse::<usize>(down, "NF id"))
                else {
                    return true;
                };
                if let Err(e) = c.connect_nfs(user, up, down) {
                    println!("failed to connect: {e}");
                }
            }

            ["show", "all"] => print!("{}", c.describe_dags(None)),

            ["show", user] => println!("{}", c.describe_dags(Some(*user))),

            ["activate", user] => match self.rt.block_on(c.activate_dag(user)) {
                Ok(chain) => println!("activated chain {chain:?}"),
                Err(e) => println!("failed to activate '{user}': {e}"),
            },

            ["cycle", node, port, cpp] => {
                let (Some(port), Some(cpp)) =
                    (parse::<u16>(port, "port"), parse::<u32>(cpp, "cycles"))
                else {
                    return true;
                };
                if let Err(e) = self.rt.block_on(c.set_cycles(node, port, cpp)) {
                    println!("failed to set cycles: {e}");
                }
            }

            ["batch", node, port, size, num] => {
                let (Some(port), Some(size), Some(num)) = (
                    parse::<u16>(port, "port"),
                    parse::<u32>(size, "batch size"),
                    parse::<u32>(num, "batch count"),
                ) else {
                    return true;
                };
                if let Err(e) = self.rt.block_on(c.set_batch(node, port, size, num)) {
                    println!("failed to set batch: {e}");
                }
            }

            _ => println!("{USAGE}"),
        }
        true
    }
}

fn parse<T: FromStr>(raw: &str, what: &str) -> Option<T> {
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            println!("invalid {what}: '{raw}'");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse;

    #[test]
    fn numbers_parse_or_complain() {
        assert_eq!(parse::<u32>("8080", "port"), Some(8080));
        assert_eq!(parse::<u32>("eighty", "port"), None);
        assert_eq!(parse::<u16>("70000", "port"), None);
    }
}
