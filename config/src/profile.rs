// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Profiled per-packet cycle costs of the NF types shipped with the
//! runtime. Unknown types fall back to the cost of an empty queue module.

/// Cycle cost of an NF that only moves packets between queues.
pub const DEFAULT_CYCLE_COST: u32 = 50;

/// Profiled cycles per packet for a function type.
pub fn cycle_cost(func_type: &str) -> u32 {
    match func_type {
        "acl" => 985,
        "aesenc" => 44_000,
        "aesdec" => 63_000,
        "evpaescbc" => 9_100,
        "evpaescbcde" => 2_800,
        "bypass" => DEFAULT_CYCLE_COST,
        "chacha" => 6_800,
        "fc" => 100,
        "filter" => 50,
        "hashlb" => 560,
        "nat" => 1_500,
        "ratelimiter" => 50,
        "updatettl" => 60,
        "urlfilter" => 6_900,
        "vlanpush" => 290,
        "vlanpop" => 230,
        "none" => DEFAULT_CYCLE_COST,
        _ => DEFAULT_CYCLE_COST,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_types() {
        assert_eq!(cycle_cost("acl"), 985);
        assert_eq!(cycle_cost("vlanpush"), 290);
        assert_eq!(cycle_cost("made-up"), DEFAULT_CYCLE_COST);
    }
}
