// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Residency index: the collection of mapping entries keyed by host range.
//!
//! Entries live in a stable arena and are addressed by [`EntryId`];
//! tombstoned entries keep their slot so statistics and revival keep
//! working. Iteration follows insertion order, which keeps victim
//! selection reproducible.

use crate::entry::MappingEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(pub(crate) usize);

/// Relation between a queried host range and an indexed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupOutcome {
    /// The query lies entirely within an entry.
    Contained,
    /// The query starts before an entry and reaches into it.
    ExtendsBefore,
    /// The query starts inside an entry and runs past its end.
    ExtendsAfter,
    InvalidContained,
    InvalidExtendsBefore,
    InvalidExtendsAfter,
    NotFound,
}

impl LookupOutcome {
    pub fn is_contained(self) -> bool {
        matches!(
            self,
            LookupOutcome::Contained | LookupOutcome::InvalidContained
        )
    }

    pub fn is_extension(self) -> bool {
        matches!(
            self,
            LookupOutcome::ExtendsBefore
                | LookupOutcome::ExtendsAfter
                | LookupOutcome::InvalidExtendsBefore
                | LookupOutcome::InvalidExtendsAfter
        )
    }

    pub fn is_invalid(self) -> bool {
        matches!(
            self,
            LookupOutcome::InvalidContained
                | LookupOutcome::InvalidExtendsBefore
                | LookupOutcome::InvalidExtendsAfter
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Lookup {
    pub outcome: LookupOutcome,
    pub entry: Option<EntryId>,
}

impl Lookup {
    fn not_found() -> Self {
        Lookup {
            outcome: LookupOutcome::NotFound,
            entry: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResidencyIndex {
    entries: Vec<MappingEntry>,
}

impl ResidencyIndex {
    pub fn new() -> Self {
        ResidencyIndex {
            entries: Vec::new(),
        }
    }

    pub fn insert(&mut self, entry: MappingEntry) -> EntryId {
        let id = EntryId(self.entries.len());
        self.entries.push(entry);
        id
    }

    pub fn get(&self, id: EntryId) -> &MappingEntry {
        &self.entries[id.0]
    }

    pub fn get_mut(&mut self, id: EntryId) -> &mut MappingEntry {
        &mut self.entries[id.0]
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &MappingEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (EntryId(i), e))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Find the entry sharing address space with `[begin, begin + size)`.
    ///
    /// Indexed ranges are pairwise equal or disjoint, so at most one entry
    /// can match and the first hit in insertion order is authoritative.
    pub fn lookup(&self, begin: u64, size: u64) -> Lookup {
        let end = begin + size;
        for (i, e) in self.entries.iter().enumerate() {
            let r = e.range();
            let outcome = if r.contains_addr(begin) {
                if end <= r.end() {
                    LookupOutcome::Contained
                } else {
                    LookupOutcome::ExtendsAfter
                }
            } else if begin < r.begin() && end > r.begin() {
                LookupOutcome::ExtendsBefore
            } else {
                continue;
            };
            let outcome = if e.is_valid() {
                outcome
            } else {
                match outcome {
                    LookupOutcome::Contained => LookupOutcome::InvalidContained,
                    LookupOutcome::ExtendsBefore => LookupOutcome::InvalidExtendsBefore,
                    _ => LookupOutcome::InvalidExtendsAfter,
                }
            };
            return Lookup {
                outcome,
                entry: Some(EntryId(i)),
            };
        }
        Lookup::not_found()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::HostRange;

    fn index_with(ranges: &[(u64, u64)]) -> ResidencyIndex {
        let mut idx = ResidencyIndex::new();
        for &(begin, len) in ranges {
            idx.insert(MappingEntry::new(begin, HostRange::new(begin, len), 0, 0));
        }
        idx
    }

    #[test]
    fn test_lookup_contained() {
        let idx = index_with(&[(0x1000, 0x1000), (0x4000, 0x2000)]);
        let lr = idx.lookup(0x4000, 0x2000);
        assert_eq!(lr.outcome, LookupOutcome::Contained);
        assert_eq!(lr.entry, Some(EntryId(1)));

        let lr = idx.lookup(0x1800, 0x100);
        assert_eq!(lr.outcome, LookupOutcome::Contained);
        assert_eq!(lr.entry, Some(EntryId(0)));
    }

    #[test]
    fn test_lookup_extensions() {
        let idx = index_with(&[(0x1000, 0x1000)]);
        let lr = idx.lookup(0x800, 0x1000);
        assert_eq!(lr.outcome, LookupOutcome::ExtendsBefore);
        let lr = idx.lookup(0x1800, 0x1000);
        assert_eq!(lr.outcome, LookupOutcome::ExtendsAfter);
        assert!(lr.outcome.is_extension());
    }

    #[test]
    fn test_lookup_invalid_variants() {
        let mut idx = index_with(&[(0x1000, 0x1000)]);
        idx.get_mut(EntryId(0)).set_valid(false);
        assert_eq!(
            idx.lookup(0x1000, 0x1000).outcome,
            LookupOutcome::InvalidContained
        );
        assert_eq!(
            idx.lookup(0x800, 0x1000).outcome,
            LookupOutcome::InvalidExtendsBefore
        );
        assert_eq!(
            idx.lookup(0x1800, 0x1000).outcome,
            LookupOutcome::InvalidExtendsAfter
        );
        assert!(idx.lookup(0x1000, 0x1000).outcome.is_invalid());
    }

    #[test]
    fn test_lookup_not_found() {
        let idx = index_with(&[(0x1000, 0x1000)]);
        let lr = idx.lookup(0x8000, 0x1000);
        assert_eq!(lr.outcome, LookupOutcome::NotFound);
        assert!(lr.entry.is_none());
        // Adjacent but disjoint.
        assert_eq!(idx.lookup(0x2000, 0x100).outcome, LookupOutcome::NotFound);
    }
}
