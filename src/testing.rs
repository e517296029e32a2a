// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! A recording device driver for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use driver_api::{DeviceDriver, DriverError, MemOp, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriverCall {
    Alloc { size: u64, host: u64 },
    Free { ptr: u64 },
    Submit { dst: u64, src: u64, size: u64 },
    Retrieve { dst: u64, src: u64, size: u64 },
    Opt { op: MemOp, ptr: u64, size: u64 },
}

/// Hands out device pointers from a private arena and records every call.
pub(crate) struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    next_dev: Mutex<u64>,
    fail_transfers: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver {
            calls: Mutex::new(Vec::new()),
            next_dev: Mutex::new(0xd000_0000),
            fail_transfers: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.fail_transfers.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl DeviceDriver for MockDriver {
    fn alloc(&self, size: u64, host_hint: u64) -> Result<u64> {
        self.record(DriverCall::Alloc {
            size,
            host: host_hint,
        });
        let mut next = self.next_dev.lock().unwrap();
        let ptr = *next;
        *next += size.max(0x1000);
        Ok(ptr)
    }

    fn free(&self, ptr: u64) -> Result<()> {
        self.record(DriverCall::Free { ptr });
        Ok(())
    }

    fn submit(&self, dst_dev: u64, src_host: u64, size: u64) -> Result<()> {
        self.record(DriverCall::Submit {
            dst: dst_dev,
            src: src_host,
            size,
        });
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(DriverError::Submit(size));
        }
        Ok(())
    }

    fn retrieve(&self, dst_host: u64, src_dev: u64, size: u64) -> Result<()> {
        self.record(DriverCall::Retrieve {
            dst: dst_host,
            src: src_dev,
            size,
        });
        if self.fail_transfers.load(Ordering::SeqCst) {
            return Err(DriverError::Retrieve(size));
        }
        Ok(())
    }

    fn opt(&self, size: u64, ptr: u64, op: MemOp) -> Result<()> {
        self.record(DriverCall::Opt { op, ptr, size });
        Ok(())
    }
}
