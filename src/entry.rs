// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-buffer mapping state.

use crate::cluster::ClusterId;
use crate::flags;
use crate::range::HostRange;

/// Physical residency of a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Dedicated device allocation; the host copy is stale until retrieved.
    Dev,
    /// Host memory page-locked and prefetched to the device.
    SoftDev,
    /// Unified managed memory, migrated on demand.
    Um,
    /// Page-locked on the host.
    Host,
    /// Prefix on device, suffix on host.
    Part,
    /// The first compute access will choose a state.
    Undecided,
}

impl Location {
    /// Decode the residency bits of a flag word.
    pub fn of_flags(word: u64) -> Location {
        let uvm = word & flags::MAP_TYPE_UVM != 0;
        let host = word & flags::MAP_TYPE_HOST != 0;
        let sdev = word & flags::MAP_TYPE_SDEV != 0;
        let part = word & flags::MAP_TYPE_PART != 0;
        if part {
            Location::Part
        } else if uvm && host {
            Location::Undecided
        } else if uvm {
            Location::Um
        } else if host {
            Location::Host
        } else if sdev {
            Location::SoftDev
        } else {
            Location::Dev
        }
    }

    /// Rewrite the residency bits of a flag word for this location.
    pub fn write_flags(self, word: u64) -> u64 {
        let word = word & !flags::MAP_TYPE_RESIDENCY;
        match self {
            Location::Dev => word,
            Location::SoftDev => word | flags::MAP_TYPE_SDEV,
            Location::Um => word | flags::MAP_TYPE_UVM,
            Location::Host => word | flags::MAP_TYPE_HOST,
            Location::Part => word | flags::MAP_TYPE_PART,
            Location::Undecided => word | flags::MAP_TYPE_UVM | flags::MAP_TYPE_HOST,
        }
    }
}

/// One mapping entry per distinct host address range.
#[derive(Debug)]
pub struct MappingEntry {
    base: u64,
    range: HostRange,
    device_ptr: u64,
    dev_size: u64,
    map_flags: u64,
    valid: bool,
    deleted: bool,
    decided: bool,
    dirty: bool,
    ref_count: u64,
    reuse: u64,
    reuse_dist: u64,
    timestamp: u64,
    pinned_in_cluster: bool,
    clusters: Vec<ClusterId>,
}

impl MappingEntry {
    pub fn new(base: u64, range: HostRange, timestamp: u64, map_flags: u64) -> Self {
        MappingEntry {
            base,
            range,
            device_ptr: range.begin(),
            dev_size: 0,
            map_flags,
            valid: true,
            deleted: false,
            decided: true,
            dirty: false,
            ref_count: 1,
            reuse: flags::reuse_rank(map_flags),
            reuse_dist: flags::reuse_distance(map_flags),
            timestamp,
            pinned_in_cluster: false,
            clusters: Vec::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn range(&self) -> HostRange {
        self.range
    }

    pub fn len(&self) -> u64 {
        self.range.len()
    }

    pub fn device_ptr(&self) -> u64 {
        self.device_ptr
    }

    pub fn set_device_ptr(&mut self, ptr: u64) {
        self.device_ptr = ptr;
    }

    /// True when the entry holds a dedicated device allocation.
    pub fn is_dev_backed(&self) -> bool {
        self.device_ptr != self.range.begin()
    }

    pub fn dev_size(&self) -> u64 {
        self.dev_size
    }

    pub fn set_dev_size(&mut self, bytes: u64) {
        self.dev_size = bytes;
    }

    pub fn map_flags(&self) -> u64 {
        self.map_flags
    }

    pub fn set_map_flags(&mut self, word: u64) {
        self.map_flags = word;
    }

    pub fn location(&self) -> Location {
        Location::of_flags(self.map_flags)
    }

    pub fn set_location(&mut self, location: Location) {
        self.map_flags = location.write_flags(self.map_flags);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn set_valid(&mut self, valid: bool) {
        self.valid = valid;
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    pub fn is_decided(&self) -> bool {
        self.decided
    }

    pub fn set_decided(&mut self, decided: bool) {
        self.decided = decided;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn ref_count(&self) -> u64 {
        self.ref_count
    }

    pub fn retain(&mut self) {
        self.ref_count += 1;
    }

    /// Drop one reference, returning the remaining count.
    pub fn release(&mut self) -> u64 {
        self.ref_count = self.ref_count.saturating_sub(1);
        self.ref_count
    }

    pub fn reuse(&self) -> u64 {
        self.reuse
    }

    pub fn reuse_dist(&self) -> u64 {
        self.reuse_dist
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Record an access: the locality score is anchored at the current tick.
    pub fn touch(&mut self, clock: u64, reuse_dist: u64) {
        self.timestamp = clock;
        self.reuse_dist = reuse_dist;
    }

    /// Predicted tick of the next use; larger means colder.
    pub fn score(&self) -> u64 {
        self.timestamp + self.reuse_dist
    }

    pub fn is_pinned_in_cluster(&self) -> bool {
        self.pinned_in_cluster
    }

    pub fn set_pinned_in_cluster(&mut self, pinned: bool) {
        self.pinned_in_cluster = pinned;
    }

    pub fn clusters(&self) -> &[ClusterId] {
        &self.clusters
    }

    pub fn add_cluster(&mut self, id: ClusterId) {
        self.clusters.push(id);
    }

    /// Bytes freed on the device side if this entry is evicted.
    pub fn reclaimable(&self) -> u64 {
        if self.location() == Location::Part {
            self.dev_size
        } else {
            self.len()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{MAP_TYPE_HOST, MAP_TYPE_PART, MAP_TYPE_SDEV, MAP_TYPE_UVM};

    #[test]
    fn test_location_decoding() {
        assert_eq!(Location::of_flags(0), Location::Dev);
        assert_eq!(Location::of_flags(MAP_TYPE_UVM), Location::Um);
        assert_eq!(Location::of_flags(MAP_TYPE_HOST), Location::Host);
        assert_eq!(Location::of_flags(MAP_TYPE_SDEV), Location::SoftDev);
        assert_eq!(Location::of_flags(MAP_TYPE_PART), Location::Part);
        assert_eq!(
            Location::of_flags(MAP_TYPE_UVM | MAP_TYPE_HOST),
            Location::Undecided
        );
        // The partial bit wins over any stale residency bit.
        assert_eq!(
            Location::of_flags(MAP_TYPE_PART | MAP_TYPE_SDEV),
            Location::Part
        );
    }

    #[test]
    fn test_location_rewrite_preserves_other_bits() {
        let word = 0x123 | MAP_TYPE_UVM;
        let word = Location::Host.write_flags(word);
        assert_eq!(Location::of_flags(word), Location::Host);
        assert_eq!(word & 0x3ff, 0x123);
    }

    #[test]
    fn test_score_and_reclaimable() {
        let mut e = MappingEntry::new(0x1000, HostRange::new(0x1000, 0x4000), 7, 0);
        e.touch(9, 100);
        assert_eq!(e.score(), 109);
        assert_eq!(e.reclaimable(), 0x4000);
        e.set_location(Location::Part);
        e.set_dev_size(0x1000);
        assert_eq!(e.reclaimable(), 0x1000);
    }
}
