// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Device driver capability consumed by the placement engine.
//!
//! One trait object represents one accelerator. Device selection and
//! per-device lifecycle management live with the embedding runtime; the
//! placement engine only issues memory operations against the device it
//! was constructed with.

use thiserror::Error;

/// Memory advise and pinning operations.
///
/// The discriminants match the operation codes of the underlying runtime
/// interface and are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemOp {
    /// Page-lock a host range.
    PinHost = 0,
    /// Migrate a range towards the device.
    PrefetchDevice = 1,
    /// Reset migration advice to the driver default.
    AdviseDefault = 2,
    /// Page-lock a range for device access.
    PinDevice = 4,
    /// Migrate a range back to the host.
    PrefetchHost = 5,
    /// Drop a previously applied pin.
    Unpin = 6,
}

impl MemOp {
    pub fn as_raw(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("device allocation of {0} bytes failed")]
    Alloc(u64),
    #[error("freeing device pointer {0:#x} failed")]
    Free(u64),
    #[error("host to device transfer of {0} bytes failed")]
    Submit(u64),
    #[error("device to host transfer of {0} bytes failed")]
    Retrieve(u64),
    #[error("memory operation {0:?} on {1:#x} failed")]
    Opt(MemOp, u64),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// Low-level memory operations offered by a device runtime.
pub trait DeviceDriver: Send + Sync {
    /// Allocate `size` bytes of dedicated device memory. `host_hint` is the
    /// host address the allocation will shadow.
    fn alloc(&self, size: u64, host_hint: u64) -> Result<u64>;

    /// Release a dedicated device allocation.
    fn free(&self, ptr: u64) -> Result<()>;

    /// Copy `size` bytes from host memory to device memory.
    fn submit(&self, dst_dev: u64, src_host: u64, size: u64) -> Result<()>;

    /// Copy `size` bytes from device memory back to host memory.
    fn retrieve(&self, dst_host: u64, src_dev: u64, size: u64) -> Result<()>;

    /// Apply a pinning or migration operation to a host range.
    fn opt(&self, size: u64, ptr: u64, op: MemOp) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_op_raw_values() {
        // The raw values form the wire contract with the device runtime.
        assert_eq!(MemOp::PinHost.as_raw(), 0);
        assert_eq!(MemOp::PrefetchDevice.as_raw(), 1);
        assert_eq!(MemOp::AdviseDefault.as_raw(), 2);
        assert_eq!(MemOp::PinDevice.as_raw(), 4);
        assert_eq!(MemOp::PrefetchHost.as_raw(), 5);
        assert_eq!(MemOp::Unpin.as_raw(), 6);
    }
}
