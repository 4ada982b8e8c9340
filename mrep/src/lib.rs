// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Resource management for the multicast replication pipeline.
//!
//! Replicated traffic fans out by walking three linked hardware tables:
//! the group table (one entry per replication group: port mask plus
//! length-table base), the length table (one contiguous block per group,
//! one entry per member port), and the member table (one contiguous block
//! per port, one entry per listener).  This crate owns the slot
//! accounting for all three, the block relocations that grow and shrink
//! the contiguous runs, and the epoch-fenced reclamation that returns
//! superseded slots to service once the hardware has stopped reading
//! them.  A software index mirrors the member table so listeners can be
//! found by identity without touching hardware.
//!
//! All state for one switch lives in a [`Mcast`] handle and is guarded by
//! a single coarse lock; operations are synchronous and run to
//! completion.  Blocks of table entries are never edited in place: a
//! block changes size by being rewritten at a freshly allocated location,
//! after which the old slots sit in quarantine until an epoch flip proves
//! no in-flight pipeline walk can still reach them.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use slog::info;

use aal::AsicOps;
use aal::Epoch;
use aal::McastTable;

mod bitmap;
mod epoch;
mod group;
mod index;
mod listener;
mod relocate;
mod types;
mod validate;

pub use epoch::force_reclamation;
pub use epoch::periodic_maintenance;
pub use group::disable_group;
pub use group::enable_group;
pub use group::free_group_entry;
pub use group::free_group_vlan_entries;
pub use group::reserve_group_entry;
pub use index::ListenerCount;
pub use listener::add_listener;
pub use listener::available_listener_capacity;
pub use listener::delete_listener;
pub use listener::listener_count;
pub use listener::update_listener_state;
pub use types::GroupFlags;
pub use types::ListenerSpec;
pub use types::McastError;
pub use types::McastGroupId;
pub use types::McastResult;
pub use types::ReplGroupId;
pub use validate::check_consistency;

use bitmap::SlotMap;
use group::GroupRecord;
use index::ListenerCounts;
use index::ListenerIndex;

/// Tunables for the reclamation machinery.
#[derive(Clone, Copy, Debug)]
pub struct McastConfig {
    /// Opportunistic reclamation starts once the quarantined member-slot
    /// count exceeds this percentage of the member table's free space.
    pub reclaim_pct: u8,
    /// Delay between polls of the previous epoch's in-flight counter.
    pub drain_poll_interval: Duration,
    /// Polls before a non-draining counter is reported as fatal.
    pub drain_poll_limit: u32,
}

impl Default for McastConfig {
    fn default() -> Self {
        McastConfig {
            reclaim_pct: 50,
            drain_poll_interval: Duration::from_millis(1),
            drain_poll_limit: 1000,
        }
    }
}

// All mutable state for one switch's replication pipeline.  Everything in
// here is guarded by the Mutex in the owning Mcast.
pub(crate) struct McastData {
    // Live-slot tracking, one map per hardware table
    pub group_map: SlotMap,
    pub length_map: SlotMap,
    pub member_map: SlotMap,
    // Quarantined-slot tracking for the relocatable tables
    pub length_quar: SlotMap,
    pub member_quar: SlotMap,
    // Group-table index -> record
    pub groups: BTreeMap<u16, GroupRecord>,
    // Replication group -> group-table index
    pub by_repl_group: BTreeMap<ReplGroupId, u16>,
    pub index: ListenerIndex,
    pub counts: ListenerCounts,
    // The currently published epoch tag
    pub epoch: Epoch,
}

impl McastData {
    /// The group-table index reserved for this replication group.
    pub fn group_idx(&self, repl_group: ReplGroupId) -> McastResult<u16> {
        self.by_repl_group
            .get(&repl_group)
            .copied()
            .ok_or(McastError::NotReserved(repl_group))
    }

    /// The quarantined-member-slot count above which opportunistic
    /// reclamation kicks in: a share of the member table's remaining free
    /// space, so pressure rises as the table fills.
    pub fn watermark(&self, reclaim_pct: u8) -> u16 {
        let free = u32::from(self.member_map.free());
        (u32::from(reclaim_pct) * free / 100) as u16
    }
}

/// Handle to one switch's multicast replication state.
pub struct Mcast {
    pub log: slog::Logger,
    pub asic_hdl: asic::Handle,
    pub(crate) config: McastConfig,
    pub(crate) data: Mutex<McastData>,
}

impl Mcast {
    /// Build the software state for a freshly reset pipeline: all maps
    /// cleared, slot 0 reserved in every table, and epoch 0 published.
    pub fn new(
        log: &slog::Logger,
        asic_hdl: asic::Handle,
        config: McastConfig,
    ) -> McastResult<Self> {
        let log = log.new(slog::o!("unit" => "mcast"));

        let table_slots = |table: McastTable| -> McastResult<u16> {
            asic_hdl.table_size(table).try_into().map_err(|_| {
                McastError::Invalid(format!("table {table} too large"))
            })
        };
        let group_slots = table_slots(McastTable::Group)?;
        let length_slots = table_slots(McastTable::Length)?;
        let member_slots = table_slots(McastTable::Member)?;

        let data = McastData {
            group_map: SlotMap::new(&log, McastTable::Group, group_slots),
            length_map: SlotMap::new(&log, McastTable::Length, length_slots),
            member_map: SlotMap::new(&log, McastTable::Member, member_slots),
            length_quar: SlotMap::quarantine(
                &log,
                McastTable::Length,
                length_slots,
            ),
            member_quar: SlotMap::quarantine(
                &log,
                McastTable::Member,
                member_slots,
            ),
            groups: BTreeMap::new(),
            by_repl_group: BTreeMap::new(),
            index: ListenerIndex::new(),
            counts: ListenerCounts::new(),
            epoch: 0,
        };
        asic_hdl.epoch_set(data.epoch)?;

        info!(log, "initialized replication table state";
            "group_slots" => group_slots,
            "length_slots" => length_slots,
            "member_slots" => member_slots);

        Ok(Mcast {
            log,
            asic_hdl,
            config,
            data: Mutex::new(data),
        })
    }
}
