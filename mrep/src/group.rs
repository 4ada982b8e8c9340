// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Replication group lifecycle.
//!
//! A replication group exists in hardware as one group-table entry.  The
//! entry is reserved ahead of use, gated by an enable/disable pair, and
//! released either on disable (private groups) or through the bulk
//! teardown helpers when the group's owner is torn down outside the
//! normal per-listener path.

use slog::debug;
use slog::error;

use aal::AsicOps;
use aal::GroupTableEntry;
use aal::PortMask;

use crate::listener;
use crate::relocate;
use crate::types::GroupFlags;
use crate::types::McastError;
use crate::types::McastGroupId;
use crate::types::McastResult;
use crate::types::ReplGroupId;
use crate::Mcast;
use crate::McastData;

/// Control-plane state for one reserved group-table entry.
#[derive(Clone, Copy, Debug)]
pub(crate) struct GroupRecord {
    pub mcast_group: McastGroupId,
    pub repl_group: ReplGroupId,
    pub enabled: bool,
    pub flags: GroupFlags,
}

/// Reserve a group-table entry for a replication group, zeroing the
/// hardware entry.  Returns the reserved index.
pub fn reserve_group_entry(
    s: &Mcast,
    group: McastGroupId,
    repl_group: ReplGroupId,
) -> McastResult<u16> {
    let mut data = s.data.lock().unwrap();
    let data = &mut *data;

    if data.by_repl_group.contains_key(&repl_group) {
        return Err(McastError::Exists(format!(
            "replication group {repl_group} already has a group-table entry"
        )));
    }

    let gidx = data.group_map.alloc_run(1)?;
    if let Err(e) = s.asic_hdl.group_write(gidx, GroupTableEntry::default()) {
        data.group_map.free_run(gidx, 1);
        return Err(e.into());
    }

    data.groups.insert(
        gidx,
        GroupRecord {
            mcast_group: group,
            repl_group,
            enabled: false,
            flags: GroupFlags::default(),
        },
    );
    data.by_repl_group.insert(repl_group, gidx);

    debug!(s.log, "reserved group-table entry";
        "group" => group, "repl_group" => repl_group, "index" => gidx);
    Ok(gidx)
}

/// Allow a replication group to mutate its group-table entry.  The flags
/// recorded here govern the group until it is disabled.
pub fn enable_group(
    s: &Mcast,
    group: McastGroupId,
    repl_group: ReplGroupId,
    flags: GroupFlags,
) -> McastResult<()> {
    let mut data = s.data.lock().unwrap();
    let data = &mut *data;

    let gidx = data.group_idx(repl_group)?;
    let rec = data.groups.get_mut(&gidx).unwrap();
    if rec.mcast_group != group {
        return Err(McastError::Invalid(format!(
            "replication group {repl_group} belongs to group {}",
            rec.mcast_group
        )));
    }
    rec.enabled = true;
    rec.flags = flags;
    debug!(s.log, "enabled replication group";
        "repl_group" => repl_group, "shared" => flags.shared,
        "stp_bypass" => flags.stp_bypass);
    Ok(())
}

/// Stop a replication group from mutating its group-table entry.  A
/// private group's entry is released; a shared group keeps its
/// reservation for the next enable.  Fails while the group still has
/// active listeners.
pub fn disable_group(
    s: &Mcast,
    group: McastGroupId,
    repl_group: ReplGroupId,
) -> McastResult<()> {
    let mut data = s.data.lock().unwrap();
    let data = &mut *data;

    let gidx = data.group_idx(repl_group)?;
    let rec = data.groups.get_mut(&gidx).unwrap();
    if rec.mcast_group != group {
        return Err(McastError::Invalid(format!(
            "replication group {repl_group} belongs to group {}",
            rec.mcast_group
        )));
    }

    let fwd = s.asic_hdl.fwd_mask_get(repl_group)?;
    if !fwd.is_empty() {
        return Err(McastError::Busy(format!(
            "replication group {repl_group} still forwards to {fwd}"
        )));
    }

    rec.enabled = false;
    if !rec.flags.shared {
        release_group_entry(s, data, gidx, repl_group)?;
    }
    debug!(s.log, "disabled replication group"; "repl_group" => repl_group);
    Ok(())
}

/// Remove every listener a replication group has on one VLAN.  Used when
/// a VLAN is destroyed out from under its groups.  Returns the number of
/// listeners removed.
pub fn free_group_vlan_entries(
    s: &Mcast,
    repl_group: ReplGroupId,
    vlan: u16,
) -> McastResult<usize> {
    let mut data = s.data.lock().unwrap();
    let data = &mut *data;

    let ids = data.index.ids_for_group_vlan(repl_group, vlan);
    let removed = ids.len();
    for id in ids {
        remove_one(s, data, id);
    }
    listener::refresh_fwd_mask(s, data, repl_group)?;

    debug!(s.log, "dropped {removed} listeners";
        "repl_group" => repl_group, "vlan" => vlan);
    Ok(removed)
}

/// Tear down a replication group entirely: the hardware entry is zeroed,
/// every block it reached is quarantined wholesale, and the group-table
/// index is released whether or not the group is shared.  Unlike the
/// per-listener path, no blocks are relocated on the way down, so this
/// cannot fail for lack of table space.
pub fn free_group_entry(
    s: &Mcast,
    repl_group: ReplGroupId,
) -> McastResult<()> {
    let mut data = s.data.lock().unwrap();
    let data = &mut *data;

    let gidx = data.group_idx(repl_group)?;
    let gentry = s.asic_hdl.group_read(gidx)?;
    if !gentry.ports.is_empty() {
        for offset in 0..gentry.ports.count() {
            let lslot = gentry.base + offset;
            let lentry = s.asic_hdl.length_read(lslot)?;
            for i in 0..lentry.count {
                relocate::expire_member_slot(data, lentry.base + i);
            }
            relocate::expire_length_slot(data, lslot);
        }
    }

    for id in data.index.ids_for_group(repl_group) {
        data.index.remove(id);
    }
    data.counts.clear_group(repl_group);
    s.asic_hdl.fwd_mask_set(repl_group, PortMask::EMPTY)?;
    release_group_entry(s, data, gidx, repl_group)?;

    debug!(s.log, "released replication group"; "repl_group" => repl_group);
    Ok(())
}

// Remove one listener, record and all, logging rather than propagating
// hardware errors so a bulk teardown keeps going.
fn remove_one(s: &Mcast, data: &mut McastData, id: crate::index::ListenerId) {
    let Some(rec) = data.index.get(id).copied() else {
        return;
    };
    if rec.is_installed() {
        if let Err(e) = listener::uninstall_listener(s, data, id) {
            error!(s.log, "failed to remove listener during teardown";
                "port" => %rec.port, "vlan" => rec.vlan, "error" => %e);
        } else {
            data.counts.drop_active(rec.repl_group, rec.port);
        }
    }
    data.index.remove(id);
    data.counts.drop_total(rec.repl_group, rec.port);
}

// Zero the hardware entry and return the group-table index to the free
// pool.
fn release_group_entry(
    s: &Mcast,
    data: &mut McastData,
    gidx: u16,
    repl_group: ReplGroupId,
) -> McastResult<()> {
    s.asic_hdl.group_write(gidx, GroupTableEntry::default())?;
    data.group_map.free_run(gidx, 1);
    data.groups.remove(&gidx);
    data.by_repl_group.remove(&repl_group);
    Ok(())
}
