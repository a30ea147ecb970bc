// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::net::SocketAddr;
use std::path::PathBuf;

pub use clap::Parser;

use faas_config::params::{
    ControllerMode, DEFAULT_CLUSTER_PATH, LoadBalanceMode, PackingPolicy, Tunables,
};

#[derive(Parser, Debug)]
#[command(name = "faasd", about = "FaaS-NFV cluster controller")]
pub struct CmdArgs {
    /// Cluster topology file.
    #[arg(long, default_value = DEFAULT_CLUSTER_PATH)]
    pub cluster: PathBuf,

    /// Controller mode (faas or metron).
    #[arg(long, default_value_t = ControllerMode::Faas)]
    pub mode: ControllerMode,

    /// Flow dispatch policy.
    #[arg(long, default_value_t = LoadBalanceMode::HighLoadFirst)]
    pub policy: LoadBalanceMode,

    /// Core packing policy.
    #[arg(long, default_value_t = PackingPolicy::BestFit)]
    pub packing: PackingPolicy,

    /// Control server listen address.
    #[arg(long, default_value = "0.0.0.0:10515")]
    pub listen: SocketAddr,

    /// Kubernetes namespace for NF pods.
    #[arg(long, default_value = "default")]
    pub namespace: String,

    /// Log filter, in tracing EnvFilter syntax.
    #[arg(long, default_value = "info")]
    pub log: String,
}

impl CmdArgs {
    pub fn tunables(&self) -> Tunables {
        Tunables {
            mode: self.mode,
            load_balance: self.policy,
            packing: self.packing,
            warm_free_sgroups: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_overrides() {
        let args = CmdArgs::parse_from(["faasd"]);
        assert_eq!(args.mode, ControllerMode::Faas);
        assert_eq!(args.policy, LoadBalanceMode::HighLoadFirst);
        assert_eq!(args.listen.port(), 10515);

        let args = CmdArgs::parse_from([
            "faasd",
            "--mode",
            "metron",
            "--policy",
            "low-load-first",
            "--listen",
            "127.0.0.1:9999",
        ]);
        assert_eq!(args.mode, ControllerMode::Metron);
        assert_eq!(args.policy, LoadBalanceMode::LowLoadFirst);
        assert_eq!(args.listen.port(), 9999);
    }
}
