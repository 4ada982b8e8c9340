// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::collections::BTreeMap;
use std::collections::VecDeque;

use aal::AsicError;
use aal::AsicResult;
use aal::Epoch;
use aal::GroupTableEntry;
use aal::LengthTableEntry;
use aal::McastTable;
use aal::MemberTableEntry;
use aal::PortMask;

use super::AsicConfig;

/// Backing store for the stub pipeline: the three replication tables, the
/// per-group forwarding masks, and the epoch machinery.
pub(super) struct StubTables {
    pub groups: Vec<GroupTableEntry>,
    pub lengths: Vec<LengthTableEntry>,
    pub members: Vec<MemberTableEntry>,
    pub fwd_masks: BTreeMap<u16, PortMask>,
    pub epoch: Epoch,
    pub epoch_flips: u32,
    // Scheduled in-flight counter readings, one queue per epoch tag.  An
    // empty queue reads as 0.
    pub drain: [VecDeque<u32>; 2],
}

impl StubTables {
    pub fn new(config: &AsicConfig) -> Self {
        StubTables {
            groups: vec![GroupTableEntry::default(); config.group_slots],
            lengths: vec![LengthTableEntry::default(); config.length_slots],
            members: vec![MemberTableEntry::default(); config.member_slots],
            fwd_masks: BTreeMap::new(),
            epoch: 0,
            epoch_flips: 0,
            drain: [VecDeque::new(), VecDeque::new()],
        }
    }

    pub fn size(&self, table: McastTable) -> usize {
        match table {
            McastTable::Group => self.groups.len(),
            McastTable::Length => self.lengths.len(),
            McastTable::Member => self.members.len(),
        }
    }

    pub fn check_idx(&self, table: McastTable, idx: u16) -> AsicResult<()> {
        if usize::from(idx) < self.size(table) {
            Ok(())
        } else {
            Err(AsicError::InvalidArg(format!(
                "index {idx} out of range for table {table}"
            )))
        }
    }
}
