// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

/// This is a simple structure for tracking the slots of one fixed-size
/// hardware table: single-slot set/clear/query, plus allocation and
/// release of contiguous runs.  Each replication table gets one of these
/// for its live slots, and the reclaimable tables get a second, unreserved
/// instance tracking their quarantined slots.
use slog::debug;

use aal::McastTable;

use crate::types::McastError;
use crate::types::McastResult;

pub struct SlotMap {
    // Where debug messages are logged
    log: slog::Logger,
    // The table whose slots are being tracked
    table: McastTable,
    // One bit per table slot
    bits: Vec<u64>,
    // Number of slots in the table
    size: u16,
    // Number of set bits
    used: u16,
}

impl SlotMap {
    /// Track the live slots of `table`.  Slot 0 is permanently reserved:
    /// the hardware treats index 0 as "no entry", so it can never be
    /// handed out.
    pub fn new(log: &slog::Logger, table: McastTable, size: u16) -> Self {
        let mut map = Self::unreserved(log, "slotmap", table, size);
        map.set(0);
        map
    }

    /// Track the quarantined slots of `table`.  No reservation: slot 0 is
    /// never relocated, so it never appears here.
    pub fn quarantine(
        log: &slog::Logger,
        table: McastTable,
        size: u16,
    ) -> Self {
        Self::unreserved(log, "quarantine", table, size)
    }

    fn unreserved(
        log: &slog::Logger,
        kind: &str,
        table: McastTable,
        size: u16,
    ) -> Self {
        let unit = format!("{kind}_{table}");
        let log = log.new(slog::o!("unit" => unit));
        debug!(log, "created new slot map.  size: {size}");
        SlotMap {
            log,
            table,
            bits: vec![0u64; (usize::from(size) + 63) / 64],
            size,
            used: 0,
        }
    }

    /// Number of slots currently set, including the reserved slot 0.
    pub fn used(&self) -> u16 {
        self.used
    }

    /// Number of slots currently clear.
    pub fn free(&self) -> u16 {
        self.size - self.used
    }

    pub fn is_set(&self, idx: u16) -> bool {
        assert!(idx < self.size);
        self.bits[usize::from(idx) / 64] & (1u64 << (idx % 64)) != 0
    }

    pub fn set(&mut self, idx: u16) {
        assert!(idx < self.size);
        debug_assert!(!self.is_set(idx));
        self.bits[usize::from(idx) / 64] |= 1u64 << (idx % 64);
        self.used += 1;
    }

    pub fn clear(&mut self, idx: u16) {
        assert!(idx < self.size);
        debug_assert!(self.is_set(idx));
        self.bits[usize::from(idx) / 64] &= !(1u64 << (idx % 64));
        self.used -= 1;
    }

    /// The set slots, in increasing order.
    pub fn indices(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.size).filter(move |idx| self.is_set(*idx))
    }

    // Find the lowest-index run of `slots` consecutive clear bits.  Slot 0
    // is reserved, so runs start at index 1.
    fn find_free_run(&self, slots: u16) -> Option<u16> {
        let mut run_start = 1;
        let mut run_len = 0;
        for idx in 1..self.size {
            if self.is_set(idx) {
                run_start = idx + 1;
                run_len = 0;
            } else {
                run_len += 1;
                if run_len == slots {
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Allocate a contiguous run of `slots` entries, marking them used.
    /// On success this returns the start of the run.  Failure leaves the
    /// map untouched, so the caller can reclaim quarantined space and
    /// retry.
    pub fn alloc_run(&mut self, slots: u16) -> McastResult<u16> {
        if slots == 0 {
            return Err(McastError::Invalid(
                "cannot allocate a zero-length run".to_string(),
            ));
        }
        let Some(idx) = self.find_free_run(slots) else {
            return Err(McastError::TableFull(self.table));
        };
        for slot in idx..idx + slots {
            self.set(slot);
        }
        #[cfg(not(test))]
        slog::trace!(self.log, "allocated run [{idx}, {})", idx + slots);
        Ok(idx)
    }

    /// Release a previously-allocated run.
    pub fn free_run(&mut self, idx: u16, slots: u16) {
        #[cfg(not(test))]
        slog::trace!(self.log, "freeing run [{idx}, {})", idx + slots);
        for slot in idx..idx + slots {
            self.clear(slot);
        }
    }
}

#[cfg(test)]
fn new_slotmap(size: u16) -> SlotMap {
    let log =
        common::logging::init("test", &None, common::logging::LogFormat::Human)
            .unwrap();
    SlotMap::new(&log, McastTable::Member, size)
}

// The reserved slot is set from the start and never part of a run
#[test]
fn test_reserved_slot() -> anyhow::Result<()> {
    let mut map = new_slotmap(16);
    assert!(map.is_set(0));
    assert_eq!(map.used(), 1);

    let a = map.alloc_run(1)?;
    assert_eq!(a, 1);
    assert_eq!(map.used(), 2);
    Ok(())
}

// Simple allocation and release of single slots
#[test]
fn test_basic() -> anyhow::Result<()> {
    let mut map = new_slotmap(128);

    let a = map.alloc_run(1)?;
    assert_eq!(a, 1);
    let b = map.alloc_run(1)?;
    assert_eq!(b, 2);

    map.free_run(a, 1);
    assert!(!map.is_set(a));
    let c = map.alloc_run(1)?;
    assert_eq!(c, 1);
    Ok(())
}

// Runs must be contiguous, and the lowest suitable run wins
#[test]
fn test_runs() -> anyhow::Result<()> {
    let mut map = new_slotmap(128);

    let a = map.alloc_run(4)?;
    assert_eq!(a, 1);
    let b = map.alloc_run(5)?;
    assert_eq!(b, 5);

    // Free the first run and punch a hole in the middle of it.  A 4-slot
    // allocation no longer fits below the second run.
    map.free_run(a, 4);
    map.set(2);
    let c = map.alloc_run(4)?;
    assert_eq!(c, 10);

    // A 1-slot allocation still fits in the fragment
    let d = map.alloc_run(1)?;
    assert_eq!(d, 1);
    Ok(())
}

// With slot 0 reserved, a table of N slots holds at most N-1 entries
#[test]
fn test_exhaustion() -> anyhow::Result<()> {
    let mut map = new_slotmap(128);

    map.alloc_run(128).unwrap_err();
    let a = map.alloc_run(127)?;
    assert_eq!(a, 1);
    match map.alloc_run(1) {
        Err(McastError::TableFull(t)) => {
            assert_eq!(t, McastTable::Member)
        }
        x => panic!("expected TableFull, got {x:?}"),
    }

    map.free_run(a, 127);
    assert_eq!(map.used(), 1);
    Ok(())
}

// Zero-length allocations are a caller bug
#[test]
fn test_zero_run() -> anyhow::Result<()> {
    let mut map = new_slotmap(16);
    match map.alloc_run(0) {
        Err(McastError::Invalid(_)) => Ok(()),
        x => panic!("expected Invalid, got {x:?}"),
    }
}

// Quarantine maps have no reserved slot
#[test]
fn test_quarantine_map() -> anyhow::Result<()> {
    let log =
        common::logging::init("test", &None, common::logging::LogFormat::Human)
            .unwrap();
    let mut map = SlotMap::quarantine(&log, McastTable::Length, 16);
    assert_eq!(map.used(), 0);
    map.set(3);
    map.set(7);
    let set: Vec<u16> = map.indices().collect();
    assert_eq!(set, vec![3, 7]);
    map.clear(3);
    assert_eq!(map.used(), 1);
    Ok(())
}
