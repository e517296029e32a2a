// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Clusters group the buffers used together by one compute region.

use crate::entry::MappingEntry;
use crate::index::EntryId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    /// All members are device resident; members are eviction immune.
    Dev,
    /// Members are spread across device, host and managed memory.
    Mix,
}

#[derive(Debug)]
pub struct Cluster {
    base_key: u64,
    members: Vec<EntryId>,
    ty: ClusterType,
    size: u64,
    size_fixed: bool,
    priority: f64,
}

impl Cluster {
    fn new(base_key: u64) -> Self {
        Cluster {
            base_key,
            members: Vec::new(),
            ty: ClusterType::Mix,
            size: 0,
            size_fixed: false,
            priority: 0.0,
        }
    }

    pub fn base_key(&self) -> u64 {
        self.base_key
    }

    pub fn members(&self) -> &[EntryId] {
        &self.members
    }

    pub fn add_member(&mut self, id: EntryId) {
        self.members.push(id);
    }

    pub fn cluster_type(&self) -> ClusterType {
        self.ty
    }

    pub fn set_cluster_type(&mut self, ty: ClusterType) {
        self.ty = ty;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn size_fixed(&self) -> bool {
        self.size_fixed
    }

    /// The footprint is computed on the first admission and then invariant.
    pub fn fix_size(&mut self, size: u64) {
        self.size = size;
        self.size_fixed = true;
    }

    pub fn assert_size(&self, size: u64) {
        assert_eq!(
            self.size, size,
            "cluster {:#x} footprint must stay consistent",
            self.base_key
        );
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: f64) {
        self.priority = priority;
    }
}

#[derive(Debug, Default)]
pub struct ClusterRegistry {
    clusters: Vec<Cluster>,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        ClusterRegistry {
            clusters: Vec::new(),
        }
    }

    pub fn get(&self, id: ClusterId) -> &Cluster {
        &self.clusters[id.0]
    }

    pub fn get_mut(&mut self, id: ClusterId) -> &mut Cluster {
        &mut self.clusters[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClusterId, &Cluster)> {
        self.clusters
            .iter()
            .enumerate()
            .map(|(i, c)| (ClusterId(i), c))
    }

    /// Find the cluster for a region key, creating it on first sight.
    /// Returns the id and whether the cluster is new.
    pub fn lookup_or_create(&mut self, base_key: u64) -> (ClusterId, bool) {
        for (i, c) in self.clusters.iter().enumerate() {
            if c.base_key == base_key {
                return (ClusterId(i), false);
            }
        }
        let id = ClusterId(self.clusters.len());
        self.clusters.push(Cluster::new(base_key));
        (id, true)
    }

    /// True when the entry belongs to any device-typed cluster.
    pub fn is_in_dev_cluster(&self, entry: &MappingEntry) -> bool {
        entry
            .clusters()
            .iter()
            .any(|&id| self.get(id).ty == ClusterType::Dev)
    }

    pub fn clear(&mut self) {
        self.clusters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::MappingEntry;
    use crate::range::HostRange;

    #[test]
    fn test_lookup_or_create() {
        let mut reg = ClusterRegistry::new();
        let (a, new_a) = reg.lookup_or_create(0x1000);
        assert!(new_a);
        let (b, new_b) = reg.lookup_or_create(0x1000);
        assert!(!new_b);
        assert_eq!(a, b);
        let (c, new_c) = reg.lookup_or_create(0x2000);
        assert!(new_c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_size_is_fixed_once() {
        let mut reg = ClusterRegistry::new();
        let (id, _) = reg.lookup_or_create(0x1000);
        assert!(!reg.get(id).size_fixed());
        reg.get_mut(id).fix_size(0x8000);
        assert!(reg.get(id).size_fixed());
        reg.get(id).assert_size(0x8000);
    }

    #[test]
    #[should_panic(expected = "footprint must stay consistent")]
    fn test_inconsistent_size_is_fatal() {
        let mut reg = ClusterRegistry::new();
        let (id, _) = reg.lookup_or_create(0x1000);
        reg.get_mut(id).fix_size(0x8000);
        reg.get(id).assert_size(0x4000);
    }

    #[test]
    fn test_dev_cluster_membership() {
        let mut reg = ClusterRegistry::new();
        let (dev, _) = reg.lookup_or_create(0x1000);
        let (mix, _) = reg.lookup_or_create(0x2000);
        reg.get_mut(dev).set_cluster_type(ClusterType::Dev);

        let mut e = MappingEntry::new(0x10000, HostRange::new(0x10000, 0x1000), 0, 0);
        assert!(!reg.is_in_dev_cluster(&e));
        e.add_cluster(mix);
        assert!(!reg.is_in_dev_cluster(&e));
        e.add_cluster(dev);
        assert!(reg.is_in_dev_cluster(&e));
    }
}
