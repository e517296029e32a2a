// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Residency transitions of a mapping entry.
//!
//! Each `(from, to)` pair issues a fixed sequence of driver calls and
//! moves the corresponding budget commitment. Transfer failures are
//! tolerated: the entry is marked stale and the region proceeds. Every
//! other driver failure aborts the region.

use driver_api::{DeviceDriver, MemOp};
use log::{debug, error};

use crate::budget::DeviceBudget;
use crate::entry::{Location, MappingEntry};
use crate::{Error, Result};

fn submit(driver: &dyn DeviceDriver, entry: &mut MappingEntry, dst: u64, src: u64, size: u64) {
    if let Err(e) = driver.submit(dst, src, size) {
        error!("copying data to device failed: {}", e);
        entry.set_valid(false);
    }
}

fn retrieve(driver: &dyn DeviceDriver, entry: &mut MappingEntry, dst: u64, src: u64, size: u64) {
    if let Err(e) = driver.retrieve(dst, src, size) {
        error!("copying data from device failed: {}", e);
        entry.set_valid(false);
    }
}

fn opt(driver: &dyn DeviceDriver, size: u64, ptr: u64, op: MemOp) -> Result<()> {
    driver.opt(size, ptr, op).map_err(Error::Driver)
}

/// Move an entry from its current location to `to`.
///
/// `part_size` is the device prefix length used when `to` is
/// [`Location::Part`]. The caller rewrites the entry's flag word; this
/// routine only performs the driver calls and the accounting.
pub(crate) fn retarget(
    driver: &dyn DeviceDriver,
    budget: &mut DeviceBudget,
    entry: &mut MappingEntry,
    to: Location,
    part_size: u64,
) -> Result<()> {
    let from = entry.location();
    let begin = entry.range().begin();
    let size = entry.len();
    if from == to && from != Location::Part {
        return Ok(());
    }
    match (from, to) {
        (Location::Dev, Location::SoftDev) => {
            debug!(
                "remap {:#x} from device ({:#x}) to soft device, size={}",
                begin,
                entry.device_ptr(),
                size
            );
            driver.free(entry.device_ptr()).map_err(Error::Driver)?;
            entry.set_device_ptr(begin);
            opt(driver, size, begin, MemOp::PinDevice)?;
            opt(driver, size, begin, MemOp::PrefetchDevice)?;
        }
        (Location::Dev, Location::Um) => {
            debug!(
                "remap {:#x} from device ({:#x}) to unified memory, size={}",
                begin,
                entry.device_ptr(),
                size
            );
            budget.discharge_device(size);
            driver.free(entry.device_ptr()).map_err(Error::Driver)?;
            entry.set_device_ptr(begin);
            budget.charge_um(size);
        }
        (Location::Dev, Location::Host) => {
            debug!(
                "remap {:#x} from device ({:#x}) to host, size={}",
                begin,
                entry.device_ptr(),
                size
            );
            budget.discharge_device(size);
            driver.free(entry.device_ptr()).map_err(Error::Driver)?;
            entry.set_device_ptr(begin);
            opt(driver, size, begin, MemOp::PinHost)?;
        }
        (Location::Dev, Location::Part) => {
            debug!(
                "remap {:#x} from device ({:#x}) to partial, size={} ({})",
                begin,
                entry.device_ptr(),
                size,
                part_size
            );
            budget.discharge_device(size);
            driver.free(entry.device_ptr()).map_err(Error::Driver)?;
            entry.set_device_ptr(begin);
            opt(driver, part_size, begin, MemOp::PinDevice)?;
            opt(driver, part_size, begin, MemOp::PrefetchDevice)?;
            opt(driver, size - part_size, begin + part_size, MemOp::PinHost)?;
            budget.charge_device(part_size);
            entry.set_dev_size(part_size);
        }
        (Location::SoftDev, Location::Dev) => {
            opt(driver, size, begin, MemOp::Unpin)?;
            let tp = driver.alloc(size, begin).map_err(Error::Driver)?;
            entry.set_device_ptr(tp);
            submit(driver, entry, tp, begin, size);
            debug!(
                "remap {:#x} from soft device to device ({:#x}), size={}",
                begin, tp, size
            );
        }
        (Location::SoftDev, Location::Um) => {
            debug!("remap {:#x} from soft device to unified memory, size={}", begin, size);
            opt(driver, size, begin, MemOp::Unpin)?;
            budget.discharge_device(size);
            budget.charge_um(size);
        }
        (Location::SoftDev, Location::Host) => {
            debug!("remap {:#x} from soft device to host, size={}", begin, size);
            opt(driver, size, begin, MemOp::PinHost)?;
            opt(driver, size, begin, MemOp::PrefetchHost)?;
            budget.discharge_device(size);
        }
        (Location::SoftDev, Location::Part) => {
            debug!(
                "remap {:#x} from soft device to partial, size={} ({})",
                begin, size, part_size
            );
            opt(driver, size - part_size, begin + part_size, MemOp::PinHost)?;
            opt(driver, size - part_size, begin + part_size, MemOp::PrefetchHost)?;
            budget.discharge_device(size - part_size);
            entry.set_dev_size(part_size);
        }
        (Location::Um, Location::Dev) => {
            opt(driver, size, begin, MemOp::PrefetchDevice)?;
            let tp = driver.alloc(size, begin).map_err(Error::Driver)?;
            entry.set_device_ptr(tp);
            submit(driver, entry, tp, begin, size);
            debug!(
                "remap {:#x} from unified memory to device ({:#x}), size={}",
                begin, tp, size
            );
            budget.discharge_um(size);
            budget.charge_device(size);
        }
        (Location::Um, Location::SoftDev) => {
            debug!("remap {:#x} from unified memory to soft device, size={}", begin, size);
            opt(driver, size, begin, MemOp::PinDevice)?;
            opt(driver, size, begin, MemOp::PrefetchDevice)?;
            budget.discharge_um(size);
            budget.charge_device(size);
        }
        (Location::Um, Location::Host) => {
            debug!("remap {:#x} from unified memory to host, size={}", begin, size);
            opt(driver, size, begin, MemOp::PinHost)?;
            opt(driver, size, begin, MemOp::PrefetchHost)?;
            budget.discharge_um(size);
        }
        (Location::Um, Location::Part) => {
            debug!(
                "remap {:#x} from unified memory to partial, size={} ({})",
                begin, size, part_size
            );
            opt(driver, part_size, begin, MemOp::PinDevice)?;
            opt(driver, part_size, begin, MemOp::PrefetchDevice)?;
            opt(driver, size - part_size, begin + part_size, MemOp::PinHost)?;
            opt(driver, size - part_size, begin + part_size, MemOp::PrefetchHost)?;
            budget.discharge_um(size);
            budget.charge_device(part_size);
            entry.set_dev_size(part_size);
        }
        (Location::Host, Location::Dev) => {
            let tp = driver.alloc(size, begin).map_err(Error::Driver)?;
            entry.set_device_ptr(tp);
            submit(driver, entry, tp, begin, size);
            debug!(
                "remap {:#x} from host to device ({:#x}), size={}",
                begin, tp, size
            );
            budget.charge_device(size);
        }
        (Location::Host, Location::SoftDev) => {
            debug!("remap {:#x} from host to soft device, size={}", begin, size);
            opt(driver, size, begin, MemOp::PinDevice)?;
            opt(driver, size, begin, MemOp::PrefetchDevice)?;
            budget.charge_device(size);
        }
        (Location::Host, Location::Um) => {
            debug!("remap {:#x} from host to unified memory, size={}", begin, size);
            opt(driver, size, begin, MemOp::Unpin)?;
            budget.charge_um(size);
        }
        (Location::Host, Location::Part) => {
            debug!(
                "remap {:#x} from host to partial, size={} ({})",
                begin, size, part_size
            );
            opt(driver, part_size, begin, MemOp::PinDevice)?;
            opt(driver, part_size, begin, MemOp::PrefetchDevice)?;
            budget.charge_device(part_size);
            entry.set_dev_size(part_size);
        }
        (Location::Part, Location::Dev) => {
            let prefix = entry.dev_size();
            opt(driver, prefix, begin, MemOp::PinHost)?;
            opt(driver, prefix, begin, MemOp::PrefetchHost)?;
            let tp = driver.alloc(size, begin).map_err(Error::Driver)?;
            entry.set_device_ptr(tp);
            submit(driver, entry, tp, begin, size);
            debug!(
                "remap {:#x} from partial to device ({:#x}), size={}",
                begin, tp, size
            );
            budget.discharge_device(prefix);
            budget.charge_device(size);
            entry.set_dev_size(0);
        }
        (Location::Part, Location::SoftDev) => {
            let prefix = entry.dev_size();
            debug!("remap {:#x} from partial to soft device, size={}", begin, size);
            opt(driver, size - prefix, begin + prefix, MemOp::PinDevice)?;
            opt(driver, size - prefix, begin + prefix, MemOp::PrefetchDevice)?;
            budget.charge_device(size - prefix);
            entry.set_dev_size(0);
        }
        (Location::Part, Location::Um) => {
            debug!("remap {:#x} from partial to unified memory, size={}", begin, size);
            opt(driver, size, begin, MemOp::Unpin)?;
            budget.discharge_device(entry.dev_size());
            budget.charge_um(size);
            entry.set_dev_size(0);
        }
        (Location::Part, Location::Host) => {
            let prefix = entry.dev_size();
            debug!("remap {:#x} from partial to host, size={}", begin, size);
            opt(driver, prefix, begin, MemOp::PinHost)?;
            opt(driver, prefix, begin, MemOp::PrefetchHost)?;
            budget.discharge_device(prefix);
            entry.set_dev_size(0);
        }
        (Location::Part, Location::Part) => {
            // Re-split: grow the device prefix or hand part of it back.
            let old = entry.dev_size();
            if part_size > old {
                let delta = part_size - old;
                opt(driver, delta, begin + old, MemOp::PinDevice)?;
                opt(driver, delta, begin + old, MemOp::PrefetchDevice)?;
                budget.charge_device(delta);
            } else if part_size < old {
                let delta = old - part_size;
                opt(driver, delta, begin + part_size, MemOp::PinHost)?;
                opt(driver, delta, begin + part_size, MemOp::PrefetchHost)?;
                budget.discharge_device(delta);
            }
            debug!(
                "re-split {:#x} partial prefix {} -> {}",
                begin, old, part_size
            );
            entry.set_dev_size(part_size);
        }
        (from, to) => unreachable!("no transition defined from {:?} to {:?}", from, to),
    }
    Ok(())
}

/// Release an entry's device-side footprint to make room for another
/// buffer. Dedicated allocations are retrieved and torn down; pinned and
/// managed entries migrate back to the host and stay valid.
///
/// Returns the number of bytes reclaimed.
pub(crate) fn evict_release(
    driver: &dyn DeviceDriver,
    budget: &mut DeviceBudget,
    entry: &mut MappingEntry,
) -> Result<u64> {
    let begin = entry.range().begin();
    let size = entry.len();
    match entry.location() {
        Location::Dev => {
            debug!(
                "replace {:#x} from device ({:#x}), size={}",
                begin,
                entry.device_ptr(),
                size
            );
            if entry.is_valid() {
                let dev_ptr = entry.device_ptr();
                retrieve(driver, entry, begin, dev_ptr, size);
                entry.set_valid(false);
            }
            budget.discharge_device(size);
            driver.free(entry.device_ptr()).map_err(Error::Driver)?;
            entry.set_deleted(true);
            Ok(size)
        }
        Location::Um => {
            debug!("replace {:#x} from unified memory, size={}", begin, size);
            opt(driver, size, begin, MemOp::PinHost)?;
            opt(driver, size, begin, MemOp::PrefetchHost)?;
            budget.discharge_um(size);
            entry.set_location(Location::Host);
            Ok(size)
        }
        Location::SoftDev => {
            debug!("replace {:#x} from soft device, size={}", begin, size);
            opt(driver, size, begin, MemOp::PinHost)?;
            opt(driver, size, begin, MemOp::PrefetchHost)?;
            budget.discharge_device(size);
            entry.set_location(Location::Host);
            Ok(size)
        }
        Location::Part => {
            let prefix = entry.dev_size();
            debug!("replace {:#x} partial prefix, size={}", begin, prefix);
            opt(driver, prefix, begin, MemOp::PinHost)?;
            opt(driver, prefix, begin, MemOp::PrefetchHost)?;
            budget.discharge_device(prefix);
            entry.set_dev_size(0);
            entry.set_location(Location::Host);
            Ok(prefix)
        }
        Location::Host => {
            error!("attempt to replace a host-resident object {:#x}", begin);
            Ok(0)
        }
        Location::Undecided => {
            unreachable!("undecided entries hold no device footprint")
        }
    }
}

/// Drop the backing of an entry whose last reference went away, or that
/// is being torn down with its device. The entry stays indexed as an
/// invalid tombstone so a later admission can revive it.
///
/// Returns the bytes returned to the budget.
pub(crate) fn drop_backing(
    driver: &dyn DeviceDriver,
    budget: &mut DeviceBudget,
    entry: &mut MappingEntry,
) -> Result<u64> {
    let begin = entry.range().begin();
    let size = entry.len();
    let freed = match entry.location() {
        Location::Dev => {
            if entry.is_valid() {
                let dev_ptr = entry.device_ptr();
                retrieve(driver, entry, begin, dev_ptr, size);
            }
            budget.discharge_device(size);
            driver.free(entry.device_ptr()).map_err(Error::Driver)?;
            entry.set_deleted(true);
            size
        }
        Location::Um => {
            budget.discharge_um(size);
            size
        }
        Location::SoftDev => {
            opt(driver, size, begin, MemOp::Unpin)?;
            budget.discharge_device(size);
            size
        }
        Location::Host => {
            opt(driver, size, begin, MemOp::Unpin)?;
            0
        }
        Location::Part => {
            let prefix = entry.dev_size();
            opt(driver, size, begin, MemOp::Unpin)?;
            budget.discharge_device(prefix);
            entry.set_dev_size(0);
            prefix
        }
        Location::Undecided => 0,
    };
    entry.set_valid(false);
    Ok(freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::HostRange;
    use crate::testing::{DriverCall, MockDriver};
    use driver_api::MemOp;

    fn entry(begin: u64, size: u64, location: Location) -> MappingEntry {
        let mut e = MappingEntry::new(begin, HostRange::new(begin, size), 0, 0);
        e.set_location(location);
        e
    }

    #[test]
    fn test_um_to_dev_allocates_and_submits() {
        let driver = MockDriver::new();
        let mut budget = DeviceBudget::new(1 << 20, 1024);
        let mut e = entry(0x10000, 131072, Location::Um);
        budget.charge_um(131072);

        retarget(&driver, &mut budget, &mut e, Location::Dev, 0).unwrap();

        assert_eq!(budget.um_bytes(), 0);
        assert_eq!(budget.device_bytes(), 131072);
        assert!(e.is_dev_backed());
        let calls = driver.calls();
        assert_eq!(
            calls,
            vec![
                DriverCall::Opt {
                    op: MemOp::PrefetchDevice,
                    ptr: 0x10000,
                    size: 131072
                },
                DriverCall::Alloc {
                    size: 131072,
                    host: 0x10000
                },
                DriverCall::Submit {
                    dst: e.device_ptr(),
                    src: 0x10000,
                    size: 131072
                },
            ]
        );
    }

    #[test]
    fn test_dev_to_soft_dev_frees_allocation() {
        let driver = MockDriver::new();
        let mut budget = DeviceBudget::new(1 << 20, 1024);
        let mut e = entry(0x10000, 0x4000, Location::Dev);
        e.set_device_ptr(0xd000_0000);
        budget.charge_device(0x4000);

        retarget(&driver, &mut budget, &mut e, Location::SoftDev, 0).unwrap();

        // Still charged: a soft device mapping occupies the same footprint.
        assert_eq!(budget.device_bytes(), 0x4000);
        assert!(!e.is_dev_backed());
        assert_eq!(
            driver.calls(),
            vec![
                DriverCall::Free { ptr: 0xd000_0000 },
                DriverCall::Opt {
                    op: MemOp::PinDevice,
                    ptr: 0x10000,
                    size: 0x4000
                },
                DriverCall::Opt {
                    op: MemOp::PrefetchDevice,
                    ptr: 0x10000,
                    size: 0x4000
                },
            ]
        );
    }

    #[test]
    fn test_part_resplit_adjusts_prefix() {
        let driver = MockDriver::new();
        let mut budget = DeviceBudget::new(1 << 20, 1024);
        let mut e = entry(0x10000, 0x8000, Location::Part);
        e.set_dev_size(0x2000);
        budget.charge_device(0x2000);

        retarget(&driver, &mut budget, &mut e, Location::Part, 0x4000).unwrap();
        assert_eq!(e.dev_size(), 0x4000);
        assert_eq!(budget.device_bytes(), 0x4000);

        retarget(&driver, &mut budget, &mut e, Location::Part, 0x1000).unwrap();
        assert_eq!(e.dev_size(), 0x1000);
        assert_eq!(budget.device_bytes(), 0x1000);
    }

    #[test]
    fn test_failed_transfer_marks_entry_stale() {
        let driver = MockDriver::new();
        driver.fail_transfers(true);
        let mut budget = DeviceBudget::new(1 << 20, 1024);
        let mut e = entry(0x10000, 0x1000, Location::Host);

        retarget(&driver, &mut budget, &mut e, Location::Dev, 0).unwrap();
        assert!(!e.is_valid());
        assert_eq!(budget.device_bytes(), 0x1000);
    }

    #[test]
    fn test_evict_release_soft_dev_returns_to_host() {
        let driver = MockDriver::new();
        let mut budget = DeviceBudget::new(1 << 20, 1024);
        let mut e = entry(0x10000, 0x4000, Location::SoftDev);
        budget.charge_device(0x4000);

        let freed = evict_release(&driver, &mut budget, &mut e).unwrap();
        assert_eq!(freed, 0x4000);
        assert_eq!(budget.device_bytes(), 0);
        assert_eq!(e.location(), Location::Host);
        assert!(e.is_valid());
    }

    #[test]
    fn test_drop_backing_restores_budget() {
        let driver = MockDriver::new();
        let mut budget = DeviceBudget::new(1 << 20, 1024);
        let mut e = entry(0x10000, 0x4000, Location::Part);
        e.set_dev_size(0x1000);
        budget.charge_device(0x1000);

        let freed = drop_backing(&driver, &mut budget, &mut e).unwrap();
        assert_eq!(freed, 0x1000);
        assert_eq!(budget.device_bytes(), 0);
        assert!(!e.is_valid());
    }
}
