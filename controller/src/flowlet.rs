// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow match rules. A flowlet is immutable once added to a DAG; zero
//! valued fields act as wildcards.

use std::fmt;

use faas_rpc::FlowInfo;

/// The five-tuple of a live flow as reported by the ingress switch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FiveTuple {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u32,
    pub dst_port: u32,
    pub proto: u32,
}

impl From<&FlowInfo> for FiveTuple {
    fn from(info: &FlowInfo) -> Self {
        FiveTuple {
            src_ip: info.ipv4_src.clone(),
            dst_ip: info.ipv4_dst.clone(),
            src_port: info.tcp_sport,
            dst_port: info.tcp_dport,
            proto: info.ipv4_protocol,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.proto
        )
    }
}

/// One match rule of a DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct Flowlet {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u32,
    pub dst_port: u32,
    pub proto: u32,
}

impl Flowlet {
    /// Whether `flow` is selected by this rule. An empty source address,
    /// an empty or `"0"` destination address, and zero ports / protocol
    /// match anything.
    pub fn matches(&self, flow: &FiveTuple) -> bool {
        (self.src_ip.is_empty() || self.src_ip == flow.src_ip)
            && (self.dst_ip.is_empty() || self.dst_ip == "0" || self.dst_ip == flow.dst_ip)
            && (self.src_port == 0 || self.src_port == flow.src_port)
            && (self.dst_port == 0 || self.dst_port == flow.dst_port)
            && (self.proto == 0 || self.proto == flow.proto)
    }
}

impl fmt::Display for Flowlet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port, self.proto
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(dst_port: u32, proto: u32) -> FiveTuple {
        FiveTuple {
            src_ip: "1.1.1.1".into(),
            dst_ip: "2.2.2.2".into(),
            src_port: 1000,
            dst_port,
            proto,
        }
    }

    #[test]
    fn wildcards_match_anything() {
        let rule = Flowlet {
            src_ip: String::new(),
            dst_ip: String::new(),
            src_port: 0,
            dst_port: 8080,
            proto: 0,
        };
        assert!(rule.matches(&flow(8080, 6)));
        assert!(rule.matches(&flow(8080, 17)));
        assert!(!rule.matches(&flow(22, 6)));
    }

    #[test]
    fn explicit_fields_must_agree() {
        let rule = Flowlet {
            src_ip: "1.1.1.1".into(),
            dst_ip: "0".into(),
            src_port: 1000,
            dst_port: 0,
            proto: 6,
        };
        assert!(rule.matches(&flow(443, 6)));
        assert!(!rule.matches(&flow(443, 17)));

        let other_src = FiveTuple {
            src_ip: "9.9.9.9".into(),
            ..flow(443, 6)
        };
        assert!(!rule.matches(&other_src));
    }
}
