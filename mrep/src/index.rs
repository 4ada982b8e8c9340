// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The software-side view of the member table.
//!
//! Every listener is described by exactly one [`ListenerRecord`], owned by
//! the index's record map.  Two secondary views hold record IDs, never
//! records: one keyed by (physical port, VLAN) and destination tag for the
//! control plane's lookups, and one keyed by length-table slot so a
//! relocation can re-point every record that references a moving slot.
//! Removal always goes through the owning map, so a record is freed
//! exactly once no matter how many views reach it.

use std::collections::BTreeMap;

use aal::PortMask;
use aal::RewriteOps;
use common::ports::PhysPort;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::types::McastGroupId;
use crate::types::ReplGroupId;

pub(crate) type ListenerId = u32;

/// Everything the control plane knows about one listener.  The slot pair
/// is (0, 0) until the listener is installed in hardware; slot 0 is
/// reserved in every table, so the pair is unambiguous.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ListenerRecord {
    pub mcast_group: McastGroupId,
    pub repl_group: ReplGroupId,
    pub port: PhysPort,
    pub vlan: u16,
    pub dest_tag: u16,
    pub rewrite: RewriteOps,
    pub stp_aware: bool,
    /// The listener's member-table slot, or 0
    pub member_slot: u16,
    /// The length-table slot describing the listener's port, or 0
    pub length_slot: u16,
}

impl ListenerRecord {
    /// Has this listener been written to the hardware tables?
    pub fn is_installed(&self) -> bool {
        self.member_slot != 0
    }
}

#[derive(Default)]
pub(crate) struct ListenerIndex {
    next_id: ListenerId,
    /// The owning container.  All other views hold IDs into this map.
    records: BTreeMap<ListenerId, ListenerRecord>,
    /// (port, VLAN) -> destination tag -> IDs, in insertion order
    by_port_vlan: BTreeMap<(PhysPort, u16), BTreeMap<u16, Vec<ListenerId>>>,
    /// length-table slot -> IDs of the installed listeners it describes
    by_length_slot: BTreeMap<u16, Vec<ListenerId>>,
}

impl ListenerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, installed or not.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn get(&self, id: ListenerId) -> Option<&ListenerRecord> {
        self.records.get(&id)
    }

    pub fn records(
        &self,
    ) -> impl Iterator<Item = (ListenerId, &ListenerRecord)> {
        self.records.iter().map(|(id, rec)| (*id, rec))
    }

    /// Number of records currently installed in hardware.
    pub fn installed(&self) -> usize {
        self.records.values().filter(|r| r.is_installed()).count()
    }

    pub fn insert(&mut self, record: ListenerRecord) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;

        self.by_port_vlan
            .entry((record.port, record.vlan))
            .or_default()
            .entry(record.dest_tag)
            .or_default()
            .push(id);
        if record.is_installed() {
            self.by_length_slot
                .entry(record.length_slot)
                .or_default()
                .push(id);
        }
        self.records.insert(id, record);
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> Option<ListenerRecord> {
        let record = self.records.remove(&id)?;

        let pv = (record.port, record.vlan);
        if let Some(tags) = self.by_port_vlan.get_mut(&pv) {
            if let Some(ids) = tags.get_mut(&record.dest_tag) {
                ids.retain(|x| *x != id);
                if ids.is_empty() {
                    tags.remove(&record.dest_tag);
                }
            }
            if tags.is_empty() {
                self.by_port_vlan.remove(&pv);
            }
        }
        if record.is_installed() {
            self.unlink_length_slot(id, record.length_slot);
        }
        Some(record)
    }

    /// O(1)-ish lookup of a listener by its full identity.
    pub fn find(
        &self,
        mcast_group: McastGroupId,
        repl_group: ReplGroupId,
        port: PhysPort,
        vlan: u16,
        dest_tag: u16,
    ) -> Option<ListenerId> {
        self.by_port_vlan
            .get(&(port, vlan))?
            .get(&dest_tag)?
            .iter()
            .copied()
            .find(|id| {
                let rec = &self.records[id];
                rec.repl_group == repl_group && rec.mcast_group == mcast_group
            })
    }

    /// A snapshot of every listener on the port, across all VLANs.
    pub fn ids_for_port(&self, port: PhysPort) -> Vec<ListenerId> {
        self.by_port_vlan
            .range((port, 0)..=(port, u16::MAX))
            .flat_map(|(_, tags)| tags.values())
            .flatten()
            .copied()
            .collect()
    }

    /// A snapshot of every listener belonging to the replication group.
    pub fn ids_for_group(&self, repl_group: ReplGroupId) -> Vec<ListenerId> {
        self.records
            .iter()
            .filter(|(_, rec)| rec.repl_group == repl_group)
            .map(|(id, _)| *id)
            .collect()
    }

    /// A snapshot of the replication group's listeners on one VLAN.
    pub fn ids_for_group_vlan(
        &self,
        repl_group: ReplGroupId,
        vlan: u16,
    ) -> Vec<ListenerId> {
        self.records
            .iter()
            .filter(|(_, rec)| {
                rec.repl_group == repl_group && rec.vlan == vlan
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// The installed listeners whose port is described by this
    /// length-table slot.
    pub fn ids_for_length_slot(&self, slot: u16) -> Vec<ListenerId> {
        self.by_length_slot.get(&slot).cloned().unwrap_or_default()
    }

    /// The installed listener occupying this member-table slot.  Member
    /// slots belong to exactly one listener, so the port's lists are
    /// scanned rather than indexed.
    pub fn find_by_member_slot(
        &self,
        port: PhysPort,
        slot: u16,
    ) -> Option<ListenerId> {
        self.ids_for_port(port)
            .into_iter()
            .find(|id| self.records[id].member_slot == slot)
    }

    /// Re-point a record at the member-table slot its entry was relocated
    /// to.
    pub fn set_member_slot(&mut self, id: ListenerId, slot: u16) {
        if let Some(rec) = self.records.get_mut(&id) {
            rec.member_slot = slot;
        }
    }

    /// Re-point a record at the length-table slot its port's entry was
    /// relocated to.
    pub fn set_length_slot(&mut self, id: ListenerId, slot: u16) {
        let Some(rec) = self.records.get_mut(&id) else {
            return;
        };
        let old = rec.length_slot;
        rec.length_slot = slot;
        self.unlink_length_slot(id, old);
        self.by_length_slot.entry(slot).or_default().push(id);
    }

    /// Record the hardware slots a listener was just written to.
    pub fn install(&mut self, id: ListenerId, member_slot: u16, length_slot: u16) {
        let Some(rec) = self.records.get_mut(&id) else {
            return;
        };
        debug_assert!(!rec.is_installed());
        rec.member_slot = member_slot;
        rec.length_slot = length_slot;
        self.by_length_slot
            .entry(length_slot)
            .or_default()
            .push(id);
    }

    /// Return a listener to the not-installed state, keeping its record.
    pub fn uninstall(&mut self, id: ListenerId) {
        let Some(rec) = self.records.get_mut(&id) else {
            return;
        };
        let slot = rec.length_slot;
        rec.member_slot = 0;
        rec.length_slot = 0;
        self.unlink_length_slot(id, slot);
    }

    fn unlink_length_slot(&mut self, id: ListenerId, slot: u16) {
        if let Some(ids) = self.by_length_slot.get_mut(&slot) {
            ids.retain(|x| *x != id);
            if ids.is_empty() {
                self.by_length_slot.remove(&slot);
            }
        }
    }
}

/// Per (replication group, physical port) listener counters.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    Serialize,
    JsonSchema,
)]
pub struct ListenerCount {
    /// Listeners installed in hardware
    pub active: u32,
    /// All listeners, installed or not
    pub total: u32,
}

#[derive(Default)]
pub(crate) struct ListenerCounts {
    counts: BTreeMap<(ReplGroupId, PhysPort), ListenerCount>,
}

impl ListenerCounts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        repl_group: ReplGroupId,
        port: PhysPort,
    ) -> Option<ListenerCount> {
        self.counts.get(&(repl_group, port)).copied()
    }

    /// Active listeners on the port.  A missing entry counts as zero.
    pub fn active(&self, repl_group: ReplGroupId, port: PhysPort) -> u32 {
        self.counts
            .get(&(repl_group, port))
            .map(|c| c.active)
            .unwrap_or(0)
    }

    pub fn bump_total(&mut self, repl_group: ReplGroupId, port: PhysPort) {
        self.counts.entry((repl_group, port)).or_default().total += 1;
    }

    pub fn bump_active(&mut self, repl_group: ReplGroupId, port: PhysPort) {
        self.counts.entry((repl_group, port)).or_default().active += 1;
    }

    pub fn drop_active(&mut self, repl_group: ReplGroupId, port: PhysPort) {
        if let Some(count) = self.counts.get_mut(&(repl_group, port)) {
            count.active = count.active.saturating_sub(1);
        }
    }

    /// Drop the total count, removing the entry entirely when the last
    /// listener goes.
    pub fn drop_total(&mut self, repl_group: ReplGroupId, port: PhysPort) {
        if let Some(count) = self.counts.get_mut(&(repl_group, port)) {
            count.total = count.total.saturating_sub(1);
            if count.total == 0 {
                self.counts.remove(&(repl_group, port));
            }
        }
    }

    /// Drop every counter belonging to a replication group being torn
    /// down.
    pub fn clear_group(&mut self, repl_group: ReplGroupId) {
        self.counts.retain(|(rg, _), _| *rg != repl_group);
    }

    /// The ports that should appear in the replication group's forwarding
    /// mask: those with at least one active listener.
    pub fn active_mask(&self, repl_group: ReplGroupId) -> PortMask {
        let mut mask = PortMask::EMPTY;
        for ((rg, port), count) in &self.counts {
            if *rg == repl_group && count.active > 0 {
                mask.set(*port);
            }
        }
        mask
    }
}
