// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Heterogeneous-memory placement engine for an offloading runtime.
//!
//! Given a stream of target regions annotated with per-argument locality
//! metadata, the engine decides for every buffer where its storage should
//! physically live: in dedicated device memory, in unified managed
//! memory, pinned on the host, or split across device and host. It
//! performs the minimum data movement required to realize the placement
//! while respecting the device memory budget.
//!
//! The embedding runtime calls [`Engine::plan_region`] once per target
//! region to obtain rewritten argument descriptors, then
//! [`Engine::admit`] per argument to realize the placement through the
//! [`DeviceDriver`] it supplied at construction.

use thiserror::Error;

pub mod flags;

mod admission;
mod budget;
mod cluster;
mod config;
mod engine;
mod entry;
mod eviction;
mod index;
mod policy;
mod range;
mod transition;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{EngineConfig, GlobalMode, RankOrder, ValidationError};
pub use engine::{AdmitOutcome, Engine, RegionArg, RegionPlan};
pub use entry::Location;
pub use index::LookupOutcome;
pub use range::HostRange;

pub use driver_api::{DeviceDriver, DriverError, MemOp};

#[derive(Debug, Error)]
pub enum Error {
    #[error("device driver operation failed")]
    Driver(#[source] DriverError),
    #[error("invalid engine configuration")]
    Validation(#[source] ValidationError),
    #[error("cannot admit an empty host range")]
    EmptyRange,
}

pub type Result<T> = std::result::Result<T, Error>;
