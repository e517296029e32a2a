// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-region orchestration of the placement engine.
//!
//! [`Engine::plan_region`] ranks the arguments of one target region,
//! resolves their residency entries and decides where each buffer should
//! live; [`Engine::admit`] realizes the decisions through the device
//! driver. A single mapping mutex protects the residency index and all
//! entry mutations; driver calls are short and synchronous and happen
//! under the lock.

use std::sync::{Arc, Mutex};

use driver_api::{DeviceDriver, MemOp};
use log::{debug, error, warn};

use crate::budget::DeviceBudget;
use crate::cluster::{ClusterId, ClusterRegistry};
use crate::config::{EngineConfig, GlobalMode, RankOrder};
use crate::entry::{Location, MappingEntry};
use crate::flags;
use crate::index::{EntryId, LookupOutcome, ResidencyIndex};
use crate::policy;
use crate::range::HostRange;
use crate::transition;
use crate::{Error, Result};

/// One buffer argument of a target region.
#[derive(Debug, Clone, Copy)]
pub struct RegionArg {
    /// Region-level base pointer of the buffer.
    pub base: u64,
    /// First host byte accessed.
    pub begin: u64,
    pub size: u64,
    pub flags: u64,
}

/// Rewritten per-argument descriptors handed back to the caller.
#[derive(Debug, Clone)]
pub struct RegionPlan {
    pub flags: Vec<u64>,
    pub sizes: Vec<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct AdmitOutcome {
    /// Device-visible address of the admitted range.
    pub device_ptr: u64,
    /// True when this admission established a new mapping.
    pub is_new: bool,
}

/// A managed argument in admission order.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlanArg {
    pub idx: usize,
    pub rank: u64,
    pub reuse_dist: u64,
    pub base: u64,
    pub entry: Option<EntryId>,
}

pub(crate) struct EngineInner {
    pub(crate) index: ResidencyIndex,
    pub(crate) clusters: ClusterRegistry,
    pub(crate) budget: DeviceBudget,
    pub(crate) clock: u64,
    pub(crate) loop_trip_count: u64,
    pub(crate) current_cluster: Option<ClusterId>,
    pub(crate) new_cluster: bool,
    pub(crate) part_dev_size: u64,
}

impl EngineInner {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        EngineInner {
            index: ResidencyIndex::new(),
            clusters: ClusterRegistry::new(),
            budget: DeviceBudget::new(config.total_dev_size, config.budget_slack),
            clock: 0,
            loop_trip_count: 0,
            current_cluster: None,
            new_cluster: false,
            part_dev_size: 0,
        }
    }
}

/// The placement engine for one device.
pub struct Engine {
    driver: Arc<dyn DeviceDriver>,
    config: EngineConfig,
    inner: Mutex<EngineInner>,
}

impl Engine {
    pub fn new(driver: Arc<dyn DeviceDriver>, config: EngineConfig) -> Result<Self> {
        config.validate().map_err(Error::Validation)?;
        let inner = EngineInner::new(&config);
        Ok(Engine {
            driver,
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Record the loop trip count of the upcoming region; it feeds the
    /// access density estimate.
    pub fn set_loop_trip_count(&self, trip_count: u64) {
        self.inner.lock().unwrap().loop_trip_count = trip_count;
    }

    pub fn device_bytes(&self) -> u64 {
        self.inner.lock().unwrap().budget.device_bytes()
    }

    pub fn um_bytes(&self) -> u64 {
        self.inner.lock().unwrap().budget.um_bytes()
    }

    pub fn clock(&self) -> u64 {
        self.inner.lock().unwrap().clock
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().index.len()
    }

    /// Decide the placement of every managed argument of one region.
    ///
    /// `region_key` is the caller-supplied region identifier; `None`
    /// denotes a data-environment open without compute. The returned
    /// descriptors carry the rewritten residency bits and the fixed-up
    /// sizes; the caller passes them to [`Engine::admit`] per argument.
    pub fn plan_region(&self, args: &[RegionArg], region_key: Option<u64>) -> Result<RegionPlan> {
        let inner = &mut *self.inner.lock().unwrap();
        inner.clock += 1;
        inner.part_dev_size = 0;
        inner.current_cluster = None;
        inner.new_cluster = false;
        let trip_count = inner.loop_trip_count;
        match region_key {
            Some(key) => debug!(
                "compute region {:#x} (#iter: {} device: {} um: {})",
                key,
                trip_count,
                inner.budget.device_bytes(),
                inner.budget.um_bytes()
            ),
            None => debug!(
                "data region (#iter: {} device: {} um: {})",
                trip_count,
                inner.budget.device_bytes(),
                inner.budget.um_bytes()
            ),
        }

        let mut plan = RegionPlan {
            flags: args.iter().map(|a| a.flags).collect(),
            sizes: args.iter().map(|a| a.size).collect(),
        };

        let mut list: Vec<PlanArg> = Vec::new();
        let mut priority = 0.0f64;
        for (i, a) in args.iter().enumerate() {
            if !flags::is_managed(a.flags) {
                continue;
            }
            match self.config.mode {
                GlobalMode::Auto | GlobalMode::Dev => {}
                GlobalMode::Um => plan.flags[i] |= flags::MAP_TYPE_UVM,
                GlobalMode::Host => plan.flags[i] |= flags::MAP_TYPE_HOST,
                GlobalMode::Hyb => plan.flags[i] |= flags::MAP_TYPE_HYB,
                GlobalMode::SoftDev => plan.flags[i] |= flags::MAP_TYPE_SDEV,
            }
            let rank = flags::reuse_rank(a.flags);
            list.push(PlanArg {
                idx: i,
                rank,
                reuse_dist: flags::reuse_distance(a.flags),
                base: a.base,
                entry: None,
            });
            priority += rank as f64;
        }
        if self.config.mode != GlobalMode::Auto || list.is_empty() {
            return Ok(plan);
        }

        // Arguments with the tightest expected reuse are admitted first.
        match self.config.rank_order {
            RankOrder::ReuseDistance => {
                list.sort_by(|a, b| a.reuse_dist.cmp(&b.reuse_dist).then(a.rank.cmp(&b.rank)))
            }
            RankOrder::Reuse => list.sort_by(|a, b| a.rank.cmp(&b.rank)),
        }

        if let Some(key) = region_key {
            let (cid, is_new) = inner.clusters.lookup_or_create(key);
            inner.current_cluster = Some(cid);
            inner.new_cluster = is_new;
            inner
                .clusters
                .get_mut(cid)
                .set_priority(priority / list.len() as f64);
        }

        // Fix argument sizes and map types against the residency index.
        let mut cluster_size = 0u64;
        let mut required = 0u64;
        for a in &mut list {
            let arg = &args[a.idx];
            let lr = inner.index.lookup(arg.begin, arg.size);
            let mut data_size = arg.size;
            if let Some(id) = lr.entry {
                a.entry = Some(id);
                let e = inner.index.get(id);
                data_size = e.len();
                if !e.is_decided() || !e.is_valid() {
                    // Restore the recorded caller intent.
                    plan.flags[a.idx] = (plan.flags[a.idx] & !flags::MAP_TYPE_BASE)
                        | (e.map_flags() & flags::MAP_TYPE_BASE);
                }
            }
            plan.sizes[a.idx] = data_size;
            let needs_space = match a.entry {
                None => true,
                Some(id) => {
                    let e = inner.index.get(id);
                    !e.is_valid() || e.map_flags() & flags::MAP_TYPE_HOST != 0
                }
            };
            if needs_space {
                required += data_size;
            } else {
                inner
                    .index
                    .get_mut(a.entry.unwrap())
                    .set_pinned_in_cluster(true);
            }
            cluster_size += data_size;
        }

        if required > 0 {
            if let Some(cid) = inner.current_cluster {
                {
                    let c = inner.clusters.get_mut(cid);
                    if !c.size_fixed() {
                        c.fix_size(cluster_size);
                    } else {
                        c.assert_size(cluster_size);
                    }
                }
                inner.admit_cluster(
                    self.driver.as_ref(),
                    &self.config,
                    cid,
                    &list,
                    required,
                    &mut plan,
                    trip_count,
                )?;
            } else {
                // A data-environment open defers every decision.
                for a in &list {
                    if a
                        .entry
                        .map_or(false, |id| inner.index.get(id).is_pinned_in_cluster())
                    {
                        continue;
                    }
                    let entry = match a.entry {
                        Some(id) => Some(inner.index.get_mut(id)),
                        None => None,
                    };
                    policy::place_buffer(
                        &self.config,
                        a.idx,
                        a.base,
                        plan.sizes[a.idx],
                        trip_count,
                        true,
                        entry,
                        &mut plan.flags[a.idx],
                    );
                }
            }
        }

        for a in &list {
            if let Some(id) = a.entry {
                inner.index.get_mut(id).set_pinned_in_cluster(false);
            }
        }
        Ok(plan)
    }

    /// Admit one argument range, realizing any pending residency change.
    ///
    /// Returns the device-visible address of `begin`. Idempotent per
    /// region: repeated admissions only bump the reference count and the
    /// access timestamp.
    pub fn admit(
        &self,
        begin: u64,
        base: u64,
        size: u64,
        word: u64,
        is_implicit: bool,
        update_ref_count: bool,
    ) -> Result<AdmitOutcome> {
        if size == 0 {
            return Err(Error::EmptyRange);
        }
        let driver = self.driver.as_ref();
        let inner = &mut *self.inner.lock().unwrap();
        let clock = inner.clock;
        let part_size = inner.part_dev_size;
        let lr = inner.index.lookup(begin, size);
        let requested = Location::of_flags(word);

        let (outcome, id) = match lr.outcome {
            LookupOutcome::Contained
            | LookupOutcome::ExtendsBefore
            | LookupOutcome::ExtendsAfter => {
                let id = lr.entry.unwrap();
                if lr.outcome.is_extension() && !is_implicit {
                    warn!("explicit extension of mapping {:#x} is not allowed", begin);
                    return Ok(AdmitOutcome {
                        device_ptr: inner.index.get(id).device_ptr(),
                        is_new: false,
                    });
                }
                if update_ref_count {
                    inner.index.get_mut(id).retain();
                }
                let mut is_new = false;
                if !inner.index.get(id).is_decided() {
                    is_new = decide_first_use(driver, inner, id, word, part_size)?;
                } else if inner.index.get(id).is_dirty() {
                    if requested == Location::Undecided {
                        error!(
                            "{:#x} becomes undecided after being mapped, size={}",
                            begin, size
                        );
                    } else {
                        transition::retarget(
                            driver,
                            &mut inner.budget,
                            inner.index.get_mut(id),
                            requested,
                            part_size,
                        )?;
                        inner.index.get_mut(id).set_map_flags(word);
                    }
                }
                let e = inner.index.get_mut(id);
                e.set_dirty(false);
                e.touch(clock, flags::reuse_distance(word));
                let tp = e.device_ptr() + begin.saturating_sub(e.range().begin());
                (
                    AdmitOutcome {
                        device_ptr: tp,
                        is_new,
                    },
                    id,
                )
            }
            LookupOutcome::InvalidContained
            | LookupOutcome::InvalidExtendsBefore
            | LookupOutcome::InvalidExtendsAfter => {
                let id = lr.entry.unwrap();
                if lr.outcome.is_extension() && !is_implicit {
                    warn!("explicit extension of mapping {:#x} is not allowed", begin);
                    return Ok(AdmitOutcome {
                        device_ptr: inner.index.get(id).device_ptr(),
                        is_new: false,
                    });
                }
                revive(driver, inner, id, word, part_size, update_ref_count, clock)?
            }
            LookupOutcome::NotFound => create(
                driver,
                inner,
                &self.config,
                begin,
                base,
                size,
                word,
                part_size,
                clock,
            )?,
        };

        // Register the entry with a newly formed cluster.
        if let (Some(cid), true) = (inner.current_cluster, inner.new_cluster) {
            if !inner.index.get(id).clusters().contains(&cid) {
                inner.index.get_mut(id).add_cluster(cid);
                inner.clusters.get_mut(cid).add_member(id);
            }
        }
        Ok(outcome)
    }

    /// Drop one reference from the entry covering `begin`; the last
    /// reference releases the device-side backing and leaves an invalid
    /// entry behind for a later revival. Returns the bytes freed.
    pub fn region_end(&self, begin: u64, size: u64) -> Result<u64> {
        let driver = self.driver.as_ref();
        let inner = &mut *self.inner.lock().unwrap();
        let lr = inner.index.lookup(begin, size);
        let id = match lr.entry {
            Some(id) => id,
            None => return Ok(0),
        };
        if inner.index.get(id).ref_count() == 0 {
            return Ok(0);
        }
        if inner.index.get_mut(id).release() > 0 {
            return Ok(0);
        }
        let freed = transition::drop_backing(driver, &mut inner.budget, inner.index.get_mut(id))?;
        debug!("release {:#x}, freed={}", begin, freed);
        Ok(freed)
    }

    /// Release every mapping when the owning device goes away.
    pub fn teardown(&self) -> Result<()> {
        let driver = self.driver.as_ref();
        let inner = &mut *self.inner.lock().unwrap();
        debug!("tearing down device mappings");
        let ids: Vec<EntryId> = inner.index.iter().map(|(id, _)| id).collect();
        for id in ids {
            let e = inner.index.get(id);
            if e.is_deleted() || (!e.is_valid() && e.ref_count() == 0) {
                continue;
            }
            transition::drop_backing(driver, &mut inner.budget, inner.index.get_mut(id))?;
        }
        inner.index.clear();
        inner.clusters.clear();
        Ok(())
    }

    /// Log the full entry table.
    pub fn dump_entries(&self) {
        let inner = self.inner.lock().unwrap();
        debug!("target data:");
        for (id, e) in inner.index.iter() {
            debug!(
                "entry {:2}: base={:#x} begin={:#x} valid={} deleted={} reuse={} time={} size={} flags={:#x}",
                id.0,
                e.base(),
                e.range().begin(),
                e.is_valid(),
                e.is_deleted(),
                e.reuse(),
                e.timestamp(),
                e.len(),
                e.map_flags()
            );
        }
    }

    /// Log the cluster table.
    pub fn dump_clusters(&self) {
        let inner = self.inner.lock().unwrap();
        debug!("clusters:");
        for (id, c) in inner.clusters.iter() {
            debug!(
                "cluster {:2}: base={:#x} type={:?} members={} size={} priority={:.2}",
                id.0,
                c.base_key(),
                c.cluster_type(),
                c.members().len(),
                c.size(),
                c.priority()
            );
        }
    }
}

/// First compute touch of an undecided entry: realize the location the
/// planner chose for it.
fn decide_first_use(
    driver: &dyn DeviceDriver,
    inner: &mut EngineInner,
    id: EntryId,
    word: u64,
    part_size: u64,
) -> Result<bool> {
    let requested = Location::of_flags(word);
    let (begin, size) = {
        let e = inner.index.get(id);
        (e.range().begin(), e.len())
    };
    match requested {
        Location::Undecided => return Ok(false),
        Location::Um => {
            debug!("map {:#x} to unified memory, size={}", begin, size);
            inner.budget.charge_um(size);
        }
        Location::SoftDev => {
            debug!("map {:#x} to soft device, size={}", begin, size);
            driver
                .opt(size, begin, MemOp::PinDevice)
                .map_err(Error::Driver)?;
            driver
                .opt(size, begin, MemOp::PrefetchDevice)
                .map_err(Error::Driver)?;
            inner.budget.charge_device(size);
        }
        Location::Host => {
            debug!("map {:#x} to host, size={}", begin, size);
            driver
                .opt(size, begin, MemOp::PinHost)
                .map_err(Error::Driver)?;
        }
        Location::Part => {
            debug!("map {:#x} to partial, size={} ({})", begin, size, part_size);
            driver
                .opt(part_size, begin, MemOp::PinDevice)
                .map_err(Error::Driver)?;
            driver
                .opt(part_size, begin, MemOp::PrefetchDevice)
                .map_err(Error::Driver)?;
            driver
                .opt(size - part_size, begin + part_size, MemOp::PinHost)
                .map_err(Error::Driver)?;
            inner.budget.charge_device(part_size);
            inner.index.get_mut(id).set_dev_size(part_size);
        }
        Location::Dev => {
            let tp = driver.alloc(size, begin).map_err(Error::Driver)?;
            inner.budget.charge_device(size);
            inner.index.get_mut(id).set_device_ptr(tp);
            debug!("map {:#x} to device ({:#x}), size={}", begin, tp, size);
        }
    }
    let e = inner.index.get_mut(id);
    e.set_decided(true);
    e.set_map_flags(word);
    Ok(true)
}

/// Re-establish backing for an invalidated entry over its original range.
fn revive(
    driver: &dyn DeviceDriver,
    inner: &mut EngineInner,
    id: EntryId,
    word: u64,
    part_size: u64,
    update_ref_count: bool,
    clock: u64,
) -> Result<(AdmitOutcome, EntryId)> {
    let requested = Location::of_flags(word);
    let (begin, size, backed, deleted, dev_ptr) = {
        let e = inner.index.get(id);
        (
            e.range().begin(),
            e.len(),
            e.is_dev_backed(),
            e.is_deleted(),
            e.device_ptr(),
        )
    };
    if update_ref_count {
        inner.index.get_mut(id).retain();
    }
    let free_stale_backing = |inner: &mut EngineInner| -> Result<()> {
        if backed && !deleted {
            inner.budget.discharge_device(size);
            driver.free(dev_ptr).map_err(Error::Driver)?;
            debug!(
                "unmap {:#x} from device ({:#x}), size={}",
                begin, dev_ptr, size
            );
        }
        Ok(())
    };
    let mut is_new = true;
    let tp = match requested {
        Location::Undecided => {
            inner.index.get_mut(id).set_decided(false);
            is_new = false;
            begin
        }
        Location::Um => {
            free_stale_backing(inner)?;
            debug!("remap {:#x} to unified memory, size={}", begin, size);
            inner.budget.charge_um(size);
            begin
        }
        Location::SoftDev => {
            free_stale_backing(inner)?;
            debug!("remap {:#x} to soft device, size={}", begin, size);
            driver
                .opt(size, begin, MemOp::PinDevice)
                .map_err(Error::Driver)?;
            driver
                .opt(size, begin, MemOp::PrefetchDevice)
                .map_err(Error::Driver)?;
            inner.budget.charge_device(size);
            begin
        }
        Location::Host => {
            free_stale_backing(inner)?;
            debug!("remap {:#x} to host, size={}", begin, size);
            driver
                .opt(size, begin, MemOp::PinHost)
                .map_err(Error::Driver)?;
            begin
        }
        Location::Part => {
            free_stale_backing(inner)?;
            debug!("remap {:#x} to partial, size={} ({})", begin, size, part_size);
            driver
                .opt(part_size, begin, MemOp::PinDevice)
                .map_err(Error::Driver)?;
            driver
                .opt(part_size, begin, MemOp::PrefetchDevice)
                .map_err(Error::Driver)?;
            driver
                .opt(size - part_size, begin + part_size, MemOp::PinHost)
                .map_err(Error::Driver)?;
            inner.budget.charge_device(part_size);
            inner.index.get_mut(id).set_dev_size(part_size);
            begin
        }
        Location::Dev => {
            if backed && !deleted {
                debug!(
                    "reassociate {:#x} to device ({:#x}), size={}",
                    begin, dev_ptr, size
                );
                dev_ptr
            } else {
                let tp = driver.alloc(size, begin).map_err(Error::Driver)?;
                debug!("remap {:#x} to device ({:#x}), size={}", begin, tp, size);
                inner.budget.charge_device(size);
                tp
            }
        }
    };
    let e = inner.index.get_mut(id);
    e.set_valid(true);
    e.set_deleted(false);
    e.set_device_ptr(tp);
    e.set_map_flags(word);
    e.set_dirty(false);
    if requested != Location::Undecided {
        e.set_decided(true);
    }
    e.touch(clock, flags::reuse_distance(word));
    Ok((
        AdmitOutcome {
            device_ptr: tp,
            is_new,
        },
        id,
    ))
}

/// Create a mapping entry for a range seen for the first time.
fn create(
    driver: &dyn DeviceDriver,
    inner: &mut EngineInner,
    config: &EngineConfig,
    begin: u64,
    base: u64,
    size: u64,
    word: u64,
    part_size: u64,
    clock: u64,
) -> Result<(AdmitOutcome, EntryId)> {
    let requested = Location::of_flags(word);
    let mut e = MappingEntry::new(base, HostRange::new(begin, size), clock, word);
    let mut is_new = true;
    match requested {
        Location::Undecided => {
            e.set_decided(false);
            is_new = false;
        }
        Location::Um => {
            debug!("map {:#x} to unified memory, size={}", begin, size);
            inner.budget.charge_um(size);
        }
        Location::SoftDev => {
            debug!("map {:#x} to soft device, size={}", begin, size);
            driver
                .opt(size, begin, MemOp::PinDevice)
                .map_err(Error::Driver)?;
            driver
                .opt(size, begin, MemOp::PrefetchDevice)
                .map_err(Error::Driver)?;
            inner.budget.charge_device(size);
        }
        Location::Host => {
            debug!("map {:#x} to host, size={}", begin, size);
            driver
                .opt(size, begin, MemOp::PinHost)
                .map_err(Error::Driver)?;
        }
        Location::Part => {
            debug!("map {:#x} to partial, size={} ({})", begin, size, part_size);
            driver
                .opt(part_size, begin, MemOp::PinDevice)
                .map_err(Error::Driver)?;
            driver
                .opt(part_size, begin, MemOp::PrefetchDevice)
                .map_err(Error::Driver)?;
            driver
                .opt(size - part_size, begin + part_size, MemOp::PinHost)
                .map_err(Error::Driver)?;
            inner.budget.charge_device(part_size);
            e.set_dev_size(part_size);
        }
        Location::Dev => {
            let ratio_split = word & flags::MAP_TYPE_HYB != 0;
            let dev_share = (size as f64 * config.dev_mem_ratio) as u64;
            if ratio_split && dev_share < size {
                debug!(
                    "map {:#x} to both locations, size={} ({})",
                    begin, size, dev_share
                );
                driver
                    .opt(dev_share, begin, MemOp::PinDevice)
                    .map_err(Error::Driver)?;
                driver
                    .opt(dev_share, begin, MemOp::PrefetchDevice)
                    .map_err(Error::Driver)?;
                driver
                    .opt(size - dev_share, begin + dev_share, MemOp::PinHost)
                    .map_err(Error::Driver)?;
                inner.budget.charge_device(dev_share);
                e.set_dev_size(dev_share);
                e.set_map_flags(Location::Part.write_flags(word));
            } else {
                let tp = driver.alloc(size, begin).map_err(Error::Driver)?;
                inner.budget.charge_device(size);
                e.set_device_ptr(tp);
                debug!("map {:#x} to device ({:#x}), size={}", begin, tp, size);
            }
        }
    }
    let device_ptr = e.device_ptr();
    let id = inner.index.insert(e);
    Ok((
        AdmitOutcome {
            device_ptr,
            is_new,
        },
        id,
    ))
}
