//! Foreign master table and Best Master Clock Algorithm (C9).
//!
//! No C source in the filtered pack implements `bmc()`'s body directly (the closest relative,
//! `original_source/src/dep/clockdriver.c`'s `compareClockDriver`, compares clock *drivers*, not
//! PTP *datasets*); this module is authored fresh from IEEE 1588-2008 §9.3.2 (dataset comparison
//! algorithm) and §J.1 (decision code state table); the bounded table below uses a plain
//! round-robin `Vec` rather than any teacher collaborator, since nothing in the pack keeps a
//! bounded table of PTP datasets.

use crate::wire::{AnnounceBody, ClockIdentity, PortIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComparisonDataset {
    pub grandmaster_identity: ClockIdentity,
    pub grandmaster_priority1: u8,
    pub grandmaster_clock_class: u8,
    pub grandmaster_clock_accuracy: u8,
    pub grandmaster_offset_scaled_log_variance: u16,
    pub grandmaster_priority2: u8,
    pub steps_removed: u16,
    pub sender_identity: PortIdentity,
}

impl ComparisonDataset {
    pub fn from_announce(sender: PortIdentity, body: &AnnounceBody) -> Self {
        ComparisonDataset {
            grandmaster_identity: body.grandmaster_identity,
            grandmaster_priority1: body.grandmaster_priority1,
            grandmaster_clock_class: body.grandmaster_clock_class,
            grandmaster_clock_accuracy: body.grandmaster_clock_accuracy,
            grandmaster_offset_scaled_log_variance: body.grandmaster_offset_scaled_log_variance,
            grandmaster_priority2: body.grandmaster_priority2,
            steps_removed: body.steps_removed,
            sender_identity: sender,
        }
    }
}

/// §9.3.2 decision codes: the outcome of comparing two datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonResult {
    /// Same grandmaster, `a` has fewer (or equal, with a lower sender identity) steps removed.
    ABetterByTopology,
    BBetterByTopology,
    /// Different grandmasters, `a` wins on the priority1/clockClass/accuracy/variance/priority2
    /// tuple (§9.3.2's `dataset_cmp` table, rows for unequal grandmaster identities).
    ABetterByGrandmaster,
    BBetterByGrandmaster,
    /// Identical grandmaster identity, identical steps removed apart from sender tiebreak.
    Same,
}

/// §9.3.2 `dataset_cmp`. Identical grandmaster identity branches into the topology comparison
/// (steps removed, then sender port identity as final tiebreak); distinct identities branch into
/// the grandmaster-quality tuple comparison, best (lowest) value wins at each step.
pub fn compare_datasets(a: &ComparisonDataset, b: &ComparisonDataset) -> ComparisonResult {
    if a.grandmaster_identity == b.grandmaster_identity {
        if a.steps_removed + 1 < b.steps_removed {
            return ComparisonResult::ABetterByTopology;
        }
        if b.steps_removed + 1 < a.steps_removed {
            return ComparisonResult::BBetterByTopology;
        }
        if a.steps_removed < b.steps_removed {
            return ComparisonResult::ABetterByTopology;
        }
        if b.steps_removed < a.steps_removed {
            return ComparisonResult::BBetterByTopology;
        }
        return if a.sender_identity.clock_identity.0 < b.sender_identity.clock_identity.0 {
            ComparisonResult::ABetterByTopology
        } else if b.sender_identity.clock_identity.0 < a.sender_identity.clock_identity.0 {
            ComparisonResult::BBetterByTopology
        } else {
            ComparisonResult::Same
        };
    }

    let tuple = |d: &ComparisonDataset| {
        (
            d.grandmaster_priority1,
            d.grandmaster_clock_class,
            d.grandmaster_clock_accuracy,
            d.grandmaster_offset_scaled_log_variance,
            d.grandmaster_priority2,
            d.grandmaster_identity.0,
        )
    };
    if tuple(a) < tuple(b) {
        ComparisonResult::ABetterByGrandmaster
    } else {
        ComparisonResult::BBetterByGrandmaster
    }
}

pub fn a_is_better(a: &ComparisonDataset, b: &ComparisonDataset) -> bool {
    matches!(compare_datasets(a, b), ComparisonResult::ABetterByTopology | ComparisonResult::ABetterByGrandmaster)
}

#[derive(Debug, Clone)]
struct ForeignMasterRecord {
    port_identity: PortIdentity,
    dataset: ComparisonDataset,
    announce_count: u32,
}

/// Bounded foreign master table with round-robin eviction, per spec.md §4.9/§3.
pub struct ForeignMasterTable {
    capacity: usize,
    records: Vec<ForeignMasterRecord>,
    next_evict: usize,
}

/// §3: a foreign master must have been seen at least this many times (beyond its first
/// sighting) before it is eligible for BMCA.
pub const FOREIGN_MASTER_THRESHOLD: u32 = 2;

impl ForeignMasterTable {
    pub fn new(capacity: usize) -> Self {
        ForeignMasterTable { capacity: capacity.max(1), records: Vec::new(), next_evict: 0 }
    }

    /// Registers (or refreshes) a foreign master's announce; returns the number of announces
    /// now on record for it, used by the port FSM's `FOREIGN_MASTER_THRESHOLD` qualification.
    /// Per spec.md §8 S1: the first sighting of a sender records `announceCount=0`; each
    /// subsequent Announce from the same `(clockIdentity, portNumber)` increments it, so the
    /// third Announce overall is the one that reaches the threshold of 2.
    pub fn record_announce(&mut self, sender: PortIdentity, dataset: ComparisonDataset) -> u32 {
        if let Some(existing) = self.records.iter_mut().find(|r| r.port_identity == sender) {
            existing.dataset = dataset;
            existing.announce_count += 1;
            return existing.announce_count;
        }
        let record = ForeignMasterRecord { port_identity: sender, dataset, announce_count: 0 };
        if self.records.len() < self.capacity {
            self.records.push(record);
        } else {
            let idx = self.next_evict % self.records.len();
            self.records[idx] = record;
            self.next_evict = (self.next_evict + 1) % self.capacity;
        }
        0
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.next_evict = 0;
    }

    pub fn expire_stale(&mut self, is_qualified: impl Fn(&PortIdentity) -> bool) {
        self.records.retain(|r| is_qualified(&r.port_identity));
    }

    /// Runs the Best Master Clock Algorithm over the qualified foreign masters plus this port's
    /// own dataset (`own`, `None` if this port has no candidate grandmaster of its own), and
    /// returns the best foreign master's dataset, if any foreign master beats `own`.
    pub fn best_foreign_master(&self, own: Option<&ComparisonDataset>) -> Option<&ComparisonDataset> {
        let mut best: Option<&ComparisonDataset> = None;
        for record in self.records.iter().filter(|r| r.announce_count >= FOREIGN_MASTER_THRESHOLD) {
            best = match best {
                None => Some(&record.dataset),
                Some(current) => {
                    if a_is_better(&record.dataset, current) {
                        Some(&record.dataset)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        match (best, own) {
            (Some(b), Some(o)) if a_is_better(b, o) => Some(b),
            (Some(_), Some(_)) => None,
            (Some(b), None) => Some(b),
            (None, _) => None,
        }
    }
}
