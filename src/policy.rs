// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Placement of a single admitted buffer.

use log::debug;

use crate::config::EngineConfig;
use crate::entry::{Location, MappingEntry};
use crate::flags;

/// Decide the target residency for one buffer and rewrite its flag word.
///
/// Data-environment opens carry no compute, so the decision is deferred;
/// otherwise the arrival density of device accesses picks unified managed
/// memory for sparsely touched buffers and a soft device mapping for the
/// rest. Returns the device bytes still needed to realize the decision.
pub(crate) fn place_buffer(
    config: &EngineConfig,
    idx: usize,
    base: u64,
    size: u64,
    trip_count: u64,
    data_region: bool,
    entry: Option<&mut MappingEntry>,
    word: &mut u64,
) -> u64 {
    if data_region {
        debug!("arg {} ({:#x}) mapping is not decided", idx, base);
        *word = Location::Undecided.write_flags(*word);
    } else {
        let local = flags::local_reuse(*word) as f64 / 8.0;
        let density = local * trip_count as f64 / size as f64;
        let target = if density < 0.5 && config.demand_paging {
            debug!(
                "arg {} ({:#x}) is intended for unified memory ({:.4})",
                idx, base, density
            );
            Location::Um
        } else {
            debug!(
                "arg {} ({:#x}) is intended for device ({:.4})",
                idx, base, density
            );
            Location::SoftDev
        };
        *word = target.write_flags(*word);
    }

    let mut needed = size;
    if let Some(e) = entry {
        // A partial entry already holds its prefix on device.
        if e.location() == Location::Part {
            needed = size - e.dev_size();
        }
        if (e.map_flags() ^ *word) & flags::MAP_TYPE_RESIDENCY != 0 {
            e.set_dirty(true);
        }
    }
    needed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::HostRange;

    fn word(local_reuse: u64) -> u64 {
        flags::managed_word(3, local_reuse, 100)
    }

    #[test]
    fn test_dense_buffer_goes_to_soft_device() {
        let config = EngineConfig::default();
        // density = (8/8) * 65536 / 65536 = 1.0
        let mut w = word(8);
        place_buffer(&config, 0, 0x10000, 65536, 65536, false, None, &mut w);
        assert_eq!(Location::of_flags(w), Location::SoftDev);
    }

    #[test]
    fn test_sparse_buffer_goes_to_unified_memory() {
        let config = EngineConfig::default();
        // density = (1/8) * 16 / 262144
        let mut w = word(1);
        place_buffer(&config, 0, 0x10000, 262144, 16, false, None, &mut w);
        assert_eq!(Location::of_flags(w), Location::Um);
    }

    #[test]
    fn test_sparse_buffer_without_demand_paging() {
        let config = EngineConfig {
            demand_paging: false,
            ..Default::default()
        };
        let mut w = word(1);
        place_buffer(&config, 0, 0x10000, 262144, 16, false, None, &mut w);
        assert_eq!(Location::of_flags(w), Location::SoftDev);
    }

    #[test]
    fn test_data_region_defers_decision() {
        let config = EngineConfig::default();
        let mut w = word(8);
        place_buffer(&config, 0, 0x10000, 65536, 0, true, None, &mut w);
        assert_eq!(Location::of_flags(w), Location::Undecided);
    }

    #[test]
    fn test_partial_entry_needs_only_the_suffix() {
        let config = EngineConfig::default();
        let mut e = MappingEntry::new(0x10000, HostRange::new(0x10000, 0x8000), 0, 0);
        e.set_location(Location::Part);
        e.set_dev_size(0x2000);
        let mut w = word(8);
        let needed = place_buffer(
            &config,
            0,
            0x10000,
            0x8000,
            1 << 20,
            false,
            Some(&mut e),
            &mut w,
        );
        assert_eq!(needed, 0x6000);
        assert!(e.is_dirty());
    }
}
