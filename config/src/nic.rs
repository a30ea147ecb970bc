// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fixed PCIe-VF / destination-MAC tables. A scheduling group's id is its
//! index into both tables; the switching fabric is configured with the same
//! mapping out of band.

/// Default VF addresses used when a worker entry does not list its own.
pub const DEFAULT_PCIE: [&str; 15] = [
    "5e:02.0", "5e:02.1", "5e:02.2", "5e:02.3", "5e:02.4", "5e:02.5", "5e:02.6", "5e:02.7",
    "5e:03.0", "5e:03.1", "5e:03.2", "5e:03.3", "5e:03.4", "5e:03.5", "5e:03.6",
];

/// Synthetic destination MACs paired with [`DEFAULT_PCIE`] by index.
pub const DST_MACS: [&str; 15] = [
    "00:00:00:00:00:01",
    "00:00:00:00:00:02",
    "00:00:00:00:00:03",
    "00:00:00:00:00:04",
    "00:00:00:00:00:05",
    "00:00:00:00:00:06",
    "00:00:00:00:00:07",
    "00:00:00:00:00:08",
    "00:00:00:00:00:09",
    "00:00:00:00:00:0a",
    "00:00:00:00:00:0b",
    "00:00:00:00:00:0c",
    "00:00:00:00:00:0d",
    "00:00:00:00:00:0e",
    "00:00:00:00:00:0f",
];

/// Destination MAC for the NIC queue with PCIe index `idx`.
pub fn dst_mac(idx: usize) -> Option<&'static str> {
    DST_MACS.get(idx).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macs_pair_with_vfs() {
        assert_eq!(DEFAULT_PCIE.len(), DST_MACS.len());
        assert_eq!(dst_mac(0), Some("00:00:00:00:00:01"));
        assert_eq!(dst_mac(14), Some("00:00:00:00:00:0f"));
        assert_eq!(dst_mac(15), None);
    }
}
