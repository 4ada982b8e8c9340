// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

// Contiguous blocks in the length and member tables change size by being
// relocated, never by being edited in place.  Growing or shrinking a block
// is a four step process:
//
//     1. Allocate a run of the new size
//     2. Copy the surviving entries across, leaving a gap at the insert
//        offset on a grow and dropping the removed entry on a shrink
//     3. Update the upstream pointer (group entry or length entry) to the
//        new base -- done by the caller once this module returns
//     4. Quarantine the old slots
//
// The hardware may be part-way through walking the old block for a packet
// in flight, so step 4 marks the old slots expired rather than free: their
// contents stay intact and their "used" bits stay set until an epoch flip
// proves no walk that started before step 3 is still running.  Reclamation
// is the epoch module's job.
//
// A worked shrink of a 3-entry member block at base 4, dropping offset 1,
// with the new run allocated at 9:
//
//     member table        old block            new block
//     ---------------------------------------------------
//     slot 4  (copied)    offset 0     ->     slot 9
//     slot 5  (dropped)   offset 1            -
//     slot 6  (copied)    offset 2     ->     slot 10
//
// Slots 4, 5, and 6 all end up quarantined; the port's length entry is
// rewritten to point at 9 with count 2.
//
// The software index is re-pointed entry by entry as the copy proceeds, so
// it never holds a slot number the hardware tables no longer back.

use slog::error;

use aal::AsicOps;
use common::ports::PhysPort;

use crate::epoch;
use crate::epoch::Scope;
use crate::types::McastError;
use crate::types::McastResult;
use crate::Mcast;
use crate::McastData;

/// How a relocation changes a block's shape.  Offsets are relative to the
/// old base.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Reshape {
    /// One slot bigger, with a gap left at `insert` for the caller to
    /// fill.  Entries at and above the offset shift up by one.
    Grow { insert: u16 },
    /// One slot smaller, with the entry at `skip` dropped.  Entries above
    /// the offset shift down by one.
    Shrink { skip: u16 },
}

impl Reshape {
    fn new_size(&self, old_size: u16) -> u16 {
        match self {
            Reshape::Grow { .. } => old_size + 1,
            Reshape::Shrink { .. } => old_size - 1,
        }
    }

    // Destination offset for a surviving source offset, or None for the
    // dropped entry.
    fn dest(&self, offset: u16) -> Option<u16> {
        match self {
            Reshape::Grow { insert } => {
                if offset < *insert {
                    Some(offset)
                } else {
                    Some(offset + 1)
                }
            }
            Reshape::Shrink { skip } => match offset.cmp(skip) {
                std::cmp::Ordering::Less => Some(offset),
                std::cmp::Ordering::Equal => None,
                std::cmp::Ordering::Greater => Some(offset - 1),
            },
        }
    }
}

/// Mark a length-table slot expired: stale in hardware, not yet
/// reusable.
pub(crate) fn expire_length_slot(data: &mut McastData, idx: u16) {
    data.length_quar.set(idx);
}

/// Mark a member-table slot expired.
pub(crate) fn expire_member_slot(data: &mut McastData, idx: u16) {
    data.member_quar.set(idx);
}

/// Allocate a run of length-table slots, reclaiming quarantined space and
/// retrying once if the table looks full.
pub(crate) fn alloc_length_run(
    s: &Mcast,
    data: &mut McastData,
    slots: u16,
) -> McastResult<u16> {
    match data.length_map.alloc_run(slots) {
        Err(McastError::TableFull(_)) => {
            epoch::reclaim(s, data, Scope::Length)?;
            data.length_map.alloc_run(slots)
        }
        r => r,
    }
}

/// Allocate a run of member-table slots, reclaiming quarantined space and
/// retrying once if the table looks full.
pub(crate) fn alloc_member_run(
    s: &Mcast,
    data: &mut McastData,
    slots: u16,
) -> McastResult<u16> {
    match data.member_map.alloc_run(slots) {
        Err(McastError::TableFull(_)) => {
            epoch::reclaim(s, data, Scope::Member)?;
            data.member_map.alloc_run(slots)
        }
        r => r,
    }
}

/// Relocate a group's length-table block to a run of the new size,
/// returning the new base.  Every index record referencing a moved slot
/// is re-pointed.  The caller still owns steps 3 and up: writing the
/// inserted entry on a grow, and swinging the group entry to the new
/// base.
///
/// Failure to allocate the new run leaves hardware untouched.  A failure
/// after the copy has started leaves the tables inconsistent; there is no
/// transactional undo across hardware writes, so those are reported as
/// fatal.
pub(crate) fn clone_length_block(
    s: &Mcast,
    data: &mut McastData,
    old_base: u16,
    old_size: u16,
    op: Reshape,
) -> McastResult<u16> {
    let new_base = alloc_length_run(s, data, op.new_size(old_size))?;

    for offset in 0..old_size {
        let src = old_base + offset;
        let Some(dst) = op.dest(offset) else {
            expire_length_slot(data, src);
            continue;
        };
        let dst = new_base + dst;
        copy_length_entry(s, src, dst)?;
        expire_length_slot(data, src);
        for id in data.index.ids_for_length_slot(src) {
            data.index.set_length_slot(id, dst);
        }
    }

    Ok(new_base)
}

/// Relocate one port's member-table block, returning the new base.  The
/// caller rewrites the port's length entry afterwards.
pub(crate) fn clone_member_block(
    s: &Mcast,
    data: &mut McastData,
    port: PhysPort,
    old_base: u16,
    old_size: u16,
    op: Reshape,
) -> McastResult<u16> {
    let new_base = alloc_member_run(s, data, op.new_size(old_size))?;

    for offset in 0..old_size {
        let src = old_base + offset;
        let Some(dst) = op.dest(offset) else {
            expire_member_slot(data, src);
            continue;
        };
        let dst = new_base + dst;
        copy_member_entry(s, src, dst)?;
        expire_member_slot(data, src);
        if let Some(id) = data.index.find_by_member_slot(port, src) {
            data.index.set_member_slot(id, dst);
        }
    }

    Ok(new_base)
}

fn copy_length_entry(s: &Mcast, src: u16, dst: u16) -> McastResult<()> {
    let entry = s.asic_hdl.length_read(src)?;
    s.asic_hdl.length_write(dst, entry).map_err(|e| {
        error!(s.log,
            "length-table relocation failed mid-copy; tables are inconsistent";
            "src" => src, "dst" => dst);
        e.into()
    })
}

fn copy_member_entry(s: &Mcast, src: u16, dst: u16) -> McastResult<()> {
    let entry = s.asic_hdl.member_read(src)?;
    s.asic_hdl.member_write(dst, entry).map_err(|e| {
        error!(s.log,
            "member-table relocation failed mid-copy; tables are inconsistent";
            "src" => src, "dst" => dst);
        e.into()
    })
}
