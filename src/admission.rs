// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Whole-cluster admission: device mapping when the budget allows it,
//! eviction when colder buffers can make room, mixed mapping otherwise.

use driver_api::DeviceDriver;
use log::debug;

use crate::cluster::{ClusterId, ClusterType};
use crate::config::EngineConfig;
use crate::engine::{EngineInner, PlanArg, RegionPlan};
use crate::entry::Location;
use crate::eviction::{self, MIN_EVICTABLE_BYTES};
use crate::index::EntryId;
use crate::policy;
use crate::Result;

impl EngineInner {
    /// Decide the placement of every argument of a cluster-forming region.
    ///
    /// `need` is the aggregate size of the arguments that are not already
    /// resident on the device side.
    pub(crate) fn admit_cluster(
        &mut self,
        driver: &dyn DeviceDriver,
        config: &EngineConfig,
        cid: ClusterId,
        args: &[PlanArg],
        need: u64,
        plan: &mut RegionPlan,
        trip_count: u64,
    ) -> Result<()> {
        let base_key = self.clusters.get(cid).base_key();

        let avail = self.budget.available();
        if avail >= need {
            debug!("cluster {:#x} uses device mapping", base_key);
            self.clusters.get_mut(cid).set_cluster_type(ClusterType::Dev);
            self.place_args(config, args, plan, trip_count);
            return Ok(());
        }

        let candidates = self.eviction_candidates(Some(cid), None);
        if let Some(victims) = eviction::select_victims(candidates, need.saturating_sub(avail)) {
            debug!("cluster {:#x} uses device mapping", base_key);
            self.clusters.get_mut(cid).set_cluster_type(ClusterType::Dev);
            self.evict(driver, &victims)?;
            self.place_args(config, args, plan, trip_count);
            return Ok(());
        }

        debug!("cluster {:#x} uses mixed mapping", base_key);
        self.clusters.get_mut(cid).set_cluster_type(ClusterType::Mix);
        let mut used_dev = 0u64;
        let mut partial_candidate: Option<usize> = None;
        for (pos, a) in args.iter().enumerate() {
            if self.arg_pinned(a) {
                continue;
            }
            let size = plan.sizes[a.idx];
            let avail = self.budget.available().saturating_sub(used_dev);
            if size <= avail {
                used_dev += self.place_arg(config, a, plan, trip_count);
                continue;
            }
            let candidates = self.eviction_candidates(Some(cid), Some(a.rank));
            match eviction::select_victims(candidates, size - avail) {
                Some(victims) => {
                    self.evict(driver, &victims)?;
                    used_dev += self.place_arg(config, a, plan, trip_count);
                }
                None => {
                    if partial_candidate.is_none() {
                        partial_candidate = Some(pos);
                    }
                    let word = &mut plan.flags[a.idx];
                    if Location::of_flags(*word) != Location::Host {
                        debug!("arg {} ({:#x}) is mapped to host", a.idx, a.base);
                        *word = Location::Host.write_flags(*word);
                        if let Some(id) = a.entry {
                            self.index.get_mut(id).set_dirty(true);
                        }
                    }
                }
            }
        }
        if config.partial_map {
            if let Some(pos) = partial_candidate {
                self.place_partial(driver, &args[pos], plan, used_dev)?;
            }
        }
        Ok(())
    }

    fn arg_pinned(&self, a: &PlanArg) -> bool {
        a.entry
            .map_or(false, |id| self.index.get(id).is_pinned_in_cluster())
    }

    fn place_args(
        &mut self,
        config: &EngineConfig,
        args: &[PlanArg],
        plan: &mut RegionPlan,
        trip_count: u64,
    ) {
        for a in args {
            if self.arg_pinned(a) {
                continue;
            }
            self.place_arg(config, a, plan, trip_count);
        }
    }

    fn place_arg(
        &mut self,
        config: &EngineConfig,
        a: &PlanArg,
        plan: &mut RegionPlan,
        trip_count: u64,
    ) -> u64 {
        let entry = match a.entry {
            Some(id) => Some(self.index.get_mut(id)),
            None => None,
        };
        policy::place_buffer(
            config,
            a.idx,
            a.base,
            plan.sizes[a.idx],
            trip_count,
            false,
            entry,
            &mut plan.flags[a.idx],
        )
    }

    /// Admit the suffix of a buffer to the host and its prefix to the
    /// device, claiming leftover device space plus the prefixes of
    /// partial entries predicted to be reused later than the subject.
    fn place_partial(
        &mut self,
        driver: &dyn DeviceDriver,
        a: &PlanArg,
        plan: &mut RegionPlan,
        used_dev: u64,
    ) -> Result<()> {
        let size = plan.sizes[a.idx];
        let (subject_score, subject_dev) = match a.entry {
            Some(id) => {
                let e = self.index.get(id);
                let dev = if e.location() == Location::Part {
                    e.dev_size()
                } else {
                    0
                };
                (e.score(), dev)
            }
            None => (self.clock + a.reuse_dist, 0),
        };

        let mut peers: Vec<EntryId> = Vec::new();
        let mut peer_bytes = 0u64;
        for (id, e) in self.index.iter() {
            if Some(id) == a.entry
                || e.location() != Location::Part
                || e.is_deleted()
                || e.is_pinned_in_cluster()
            {
                continue;
            }
            if e.score() > subject_score {
                peers.push(id);
                peer_bytes += e.dev_size();
            }
        }

        let avail = self.budget.available().saturating_sub(used_dev);
        let claimable = (peer_bytes + avail).min(size - 1);
        if claimable < MIN_EVICTABLE_BYTES {
            debug!("arg {} ({:#x}) stays on host", a.idx, a.base);
            return Ok(());
        }
        if subject_dev > 0 && claimable.saturating_sub(subject_dev) < MIN_EVICTABLE_BYTES {
            return Ok(());
        }

        self.evict(driver, &peers)?;
        self.part_dev_size = claimable;
        plan.flags[a.idx] = Location::Part.write_flags(plan.flags[a.idx]);
        if let Some(id) = a.entry {
            self.index.get_mut(id).set_dirty(true);
        }
        debug!(
            "arg {} ({:#x}) is partially mapped, prefix={}",
            a.idx, a.base, claimable
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::MappingEntry;
    use crate::flags;
    use crate::range::HostRange;
    use crate::testing::MockDriver;

    fn inner(capacity: u64) -> EngineInner {
        EngineInner::new(&EngineConfig {
            total_dev_size: capacity,
            ..Default::default()
        })
    }

    fn plan_arg(idx: usize, base: u64, rank: u64, reuse_dist: u64) -> PlanArg {
        PlanArg {
            idx,
            rank,
            reuse_dist,
            base,
            entry: None,
        }
    }

    #[test]
    fn test_partial_placement_claims_leftover_space() {
        let driver = MockDriver::new();
        let mut inner = inner(1 << 20);
        let mut plan = RegionPlan {
            flags: vec![flags::managed_word(1, 8, 20)],
            sizes: vec![512 * 1024],
        };
        inner.clock = 1;
        let a = plan_arg(0, 0x10_0000, 1, 20);

        // 256 KiB of the budget is free; the rest is spoken for.
        inner.budget.charge_device(768 * 1024);
        inner.place_partial(&driver, &a, &mut plan, 0).unwrap();

        assert_eq!(inner.part_dev_size, 256 * 1024);
        assert_eq!(Location::of_flags(plan.flags[0]), Location::Part);
    }

    #[test]
    fn test_partial_placement_releases_colder_partial_entries() {
        let driver = MockDriver::new();
        let mut inner = inner(1 << 20);
        inner.clock = 10;

        // A partial peer predicted to be reused far in the future.
        let mut peer = MappingEntry::new(0x50_0000, HostRange::new(0x50_0000, 0x8000), 0, 0);
        peer.set_location(Location::Part);
        peer.set_dev_size(0x4000);
        peer.touch(10, 1000);
        let peer_id = inner.index.insert(peer);
        inner.budget.charge_device(0x4000);
        // No free space besides the peer prefix.
        inner.budget.charge_device((1 << 20) - 0x4000);

        let mut plan = RegionPlan {
            flags: vec![flags::managed_word(1, 8, 5)],
            sizes: vec![0x10000],
        };
        let a = plan_arg(0, 0x10_0000, 1, 5);
        inner.place_partial(&driver, &a, &mut plan, 0).unwrap();

        assert_eq!(inner.part_dev_size, 0x4000);
        assert_eq!(inner.index.get(peer_id).location(), Location::Host);
        assert_eq!(inner.index.get(peer_id).dev_size(), 0);
        assert_eq!(Location::of_flags(plan.flags[0]), Location::Part);
    }

    #[test]
    fn test_partial_placement_below_threshold_stays_host() {
        let driver = MockDriver::new();
        let mut inner = inner(1 << 20);
        let mut plan = RegionPlan {
            flags: vec![Location::Host.write_flags(flags::managed_word(1, 8, 20))],
            sizes: vec![512 * 1024],
        };
        let a = plan_arg(0, 0x10_0000, 1, 20);

        inner.budget.charge_device((1 << 20) - 1024);
        inner.place_partial(&driver, &a, &mut plan, 0).unwrap();

        assert_eq!(inner.part_dev_size, 0);
        assert_eq!(Location::of_flags(plan.flags[0]), Location::Host);
    }
}
