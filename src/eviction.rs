// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Victim selection for freeing device and managed memory.

use driver_api::DeviceDriver;
use log::debug;

use crate::cluster::ClusterId;
use crate::entry::Location;
use crate::index::EntryId;
use crate::engine::EngineInner;
use crate::transition;
use crate::Result;

/// Objects below this size are never worth replacing.
pub(crate) const MIN_EVICTABLE_BYTES: u64 = 4096;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub id: EntryId,
    pub score: u64,
    pub reuse: u64,
    pub bytes: u64,
}

/// Order candidates by predicted next use, coldest first. Ties fall back
/// to the reuse rank so heavily used buffers go last among equals.
pub(crate) fn order_candidates(candidates: &mut Vec<Candidate>) {
    candidates.sort_by(|a, b| b.score.cmp(&a.score).then(b.reuse.cmp(&a.reuse)));
}

/// Walk an ordered candidate set until `need` bytes are covered.
///
/// The selector is pessimistic: if the whole set cannot cover the need,
/// nothing is selected.
pub(crate) fn select_victims(mut candidates: Vec<Candidate>, need: u64) -> Option<Vec<EntryId>> {
    let total: u64 = candidates.iter().map(|c| c.bytes).sum();
    if total < need {
        debug!("no enough space for replacement ({} < {})", total, need);
        return None;
    }
    order_candidates(&mut candidates);
    let mut victims = Vec::new();
    let mut reclaimed = 0u64;
    for c in candidates {
        victims.push(c.id);
        reclaimed += c.bytes;
        if reclaimed >= need {
            break;
        }
    }
    Some(victims)
}

impl EngineInner {
    /// Collect every entry that may legally give up device space.
    ///
    /// `exclude_cluster` shields the cluster currently being admitted;
    /// `poorer_than` restricts the set to entries with a worse reuse rank
    /// than the buffer asking for room.
    pub(crate) fn eviction_candidates(
        &self,
        exclude_cluster: Option<ClusterId>,
        poorer_than: Option<u64>,
    ) -> Vec<Candidate> {
        self.index
            .iter()
            .filter(|(_, e)| !e.is_pinned_in_cluster() && !e.is_deleted())
            .filter(|(_, e)| !matches!(e.location(), Location::Host | Location::Undecided))
            .filter(|(_, e)| e.len() >= MIN_EVICTABLE_BYTES)
            .filter(|(_, e)| !self.clusters.is_in_dev_cluster(e))
            .filter(|(_, e)| match exclude_cluster {
                Some(id) => !e.clusters().contains(&id),
                None => true,
            })
            .filter(|(_, e)| match poorer_than {
                Some(reuse) => e.reuse() > reuse,
                None => true,
            })
            .map(|(id, e)| Candidate {
                id,
                score: e.score(),
                reuse: e.reuse(),
                bytes: e.reclaimable(),
            })
            .collect()
    }

    /// Release the selected victims and return the reclaimed byte count.
    pub(crate) fn evict(&mut self, driver: &dyn DeviceDriver, victims: &[EntryId]) -> Result<u64> {
        let mut freed = 0u64;
        for &id in victims {
            freed += transition::evict_release(driver, &mut self.budget, self.index.get_mut(id))?;
        }
        Ok(freed)
    }
}
