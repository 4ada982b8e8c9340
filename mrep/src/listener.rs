// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Listener add/delete orchestration.
//!
//! Adding a listener touches up to all three tables, in an order chosen
//! so the linkage the hardware follows is never dangling: new member and
//! length entries are written before the pointers that lead to them, and
//! a block being resized is fully populated at its new location before
//! the upstream pointer swings over.  Slot allocation happens first and
//! is the only step that can fail for lack of resources, so a failed add
//! leaves the hardware untouched.
//!
//! Listeners whose port is not forwarding (by spanning tree) are recorded
//! in the index with the (0, 0) slot sentinel and installed later, when
//! the spanning-tree subsystem reports the port forwarding.

use slog::debug;
use slog::error;

use aal::AsicOps;
use aal::GroupTableEntry;
use aal::LengthTableEntry;
use aal::McastTable;
use aal::MemberTableEntry;
use common::network::StpState;
use common::ports::PortId;

use crate::epoch;
use crate::epoch::Scope;
use crate::index::ListenerCount;
use crate::index::ListenerId;
use crate::index::ListenerRecord;
use crate::relocate;
use crate::relocate::Reshape;
use crate::types::ListenerSpec;
use crate::types::McastError;
use crate::types::McastGroupId;
use crate::types::McastResult;
use crate::types::ReplGroupId;
use crate::Mcast;
use crate::McastData;

/// Add a listener to a replication group.
///
/// `stp` is the current spanning-tree state of the listener's (port,
/// VLAN).  A spanning-tree-aware listener on a non-forwarding port is
/// recorded but not installed; `update_listener_state` installs it when
/// the port starts forwarding.
pub fn add_listener(
    s: &Mcast,
    group: McastGroupId,
    repl_group: ReplGroupId,
    listener: &ListenerSpec,
    stp: StpState,
) -> McastResult<()> {
    common::network::validate_vlan(listener.vlan)?;
    let port = s.asic_hdl.port_to_phys(listener.port)?;

    let mut data = s.data.lock().unwrap();
    let data = &mut *data;

    let gidx = data.group_idx(repl_group)?;
    let grec = &data.groups[&gidx];
    if !grec.enabled {
        return Err(McastError::NotEnabled(repl_group));
    }
    let stp_bypass = grec.flags.stp_bypass;

    if data
        .index
        .find(group, repl_group, port, listener.vlan, listener.dest_tag)
        .is_some()
    {
        return Err(McastError::Exists(format!(
            "group {group} already replicates to ({port}, vlan {}, tag {})",
            listener.vlan, listener.dest_tag
        )));
    }

    let id = data.index.insert(ListenerRecord {
        mcast_group: group,
        repl_group,
        port,
        vlan: listener.vlan,
        dest_tag: listener.dest_tag,
        rewrite: listener.rewrite,
        stp_aware: listener.stp_aware,
        member_slot: 0,
        length_slot: 0,
    });
    data.counts.bump_total(repl_group, port);

    if listener.stp_aware && !stp_bypass && !stp.is_forwarding() {
        debug!(s.log,
            "listener recorded but not installed: port not forwarding";
            "port" => %port, "vlan" => listener.vlan, "stp" => %stp);
        return Ok(());
    }

    if let Err(e) = install_listener(s, data, gidx, id) {
        data.index.remove(id);
        data.counts.drop_total(repl_group, port);
        return Err(e);
    }
    data.counts.bump_active(repl_group, port);
    refresh_fwd_mask(s, data, repl_group)?;

    // Any length block this add displaced became unreachable the moment
    // the group entry moved on, so fold the quarantined slots back in
    // now.
    if data.length_quar.used() > 0 {
        epoch::reclaim(s, data, Scope::Length)?;
    }
    Ok(())
}

/// Remove a listener from a replication group.  `update_mask` also
/// refreshes the group's forwarding mask; bulk teardown paths pass false
/// and refresh once at the end.
pub fn delete_listener(
    s: &Mcast,
    group: McastGroupId,
    repl_group: ReplGroupId,
    listener: &ListenerSpec,
    update_mask: bool,
) -> McastResult<()> {
    let port = s.asic_hdl.port_to_phys(listener.port)?;

    let mut data = s.data.lock().unwrap();
    let data = &mut *data;

    let id = data
        .index
        .find(group, repl_group, port, listener.vlan, listener.dest_tag)
        .ok_or_else(|| {
            McastError::Missing(format!(
                "group {group} has no listener ({port}, vlan {}, tag {})",
                listener.vlan, listener.dest_tag
            ))
        })?;

    let installed =
        data.index.get(id).map(|r| r.is_installed()).unwrap_or(false);
    if installed {
        uninstall_listener(s, data, id)?;
        data.counts.drop_active(repl_group, port);
    }
    data.index.remove(id);
    data.counts.drop_total(repl_group, port);

    if update_mask {
        refresh_fwd_mask(s, data, repl_group)?;
    }
    Ok(())
}

/// React to a spanning-tree state change for a port: re-walk the port's
/// listeners, installing or removing the spanning-tree-aware ones to
/// match the new state.  Listeners in groups that bypass spanning tree
/// are untouched.
pub fn update_listener_state(
    s: &Mcast,
    port: PortId,
    state: StpState,
) -> McastResult<()> {
    let port = s.asic_hdl.port_to_phys(port)?;

    let mut data = s.data.lock().unwrap();
    let data = &mut *data;

    let mut touched_groups = Vec::new();
    for id in data.index.ids_for_port(port) {
        let Some(rec) = data.index.get(id).copied() else {
            continue;
        };
        if !rec.stp_aware {
            continue;
        }
        let Ok(gidx) = data.group_idx(rec.repl_group) else {
            continue;
        };
        let grec = &data.groups[&gidx];
        if grec.flags.stp_bypass {
            continue;
        }

        if state.is_forwarding() && !rec.is_installed() {
            if !grec.enabled {
                continue;
            }
            if let Err(e) = install_listener(s, data, gidx, id) {
                error!(s.log, "failed to install listener on stp change";
                    "port" => %port, "vlan" => rec.vlan,
                    "error" => %e);
                continue;
            }
            data.counts.bump_active(rec.repl_group, port);
            touched_groups.push(rec.repl_group);
        } else if !state.is_forwarding() && rec.is_installed() {
            if let Err(e) = uninstall_listener(s, data, id) {
                error!(s.log, "failed to remove listener on stp change";
                    "port" => %port, "vlan" => rec.vlan,
                    "error" => %e);
                continue;
            }
            data.counts.drop_active(rec.repl_group, port);
            touched_groups.push(rec.repl_group);
        }
    }

    touched_groups.sort_unstable();
    touched_groups.dedup();
    for repl_group in touched_groups {
        refresh_fwd_mask(s, data, repl_group)?;
    }
    Ok(())
}

/// How many more listeners the member table can hold right now.
/// Quarantined slots are not counted; they come back after the next
/// reclamation pass.
pub fn available_listener_capacity(s: &Mcast) -> usize {
    let data = s.data.lock().unwrap();
    usize::from(data.member_map.free())
}

/// The listener counters for one (replication group, port) pair, if any
/// listeners exist there.
pub fn listener_count(
    s: &Mcast,
    repl_group: ReplGroupId,
    port: PortId,
) -> McastResult<Option<ListenerCount>> {
    let port = s.asic_hdl.port_to_phys(port)?;
    let data = s.data.lock().unwrap();
    Ok(data.counts.get(repl_group, port))
}

/// Align the group's forwarding-mask attribute with its active-listener
/// counts, so a port only receives replicated traffic while it has at
/// least one installed listener.
pub(crate) fn refresh_fwd_mask(
    s: &Mcast,
    data: &McastData,
    repl_group: ReplGroupId,
) -> McastResult<()> {
    let mask = data.counts.active_mask(repl_group);
    s.asic_hdl.fwd_mask_set(repl_group, mask)?;
    Ok(())
}

// Write one listener into the hardware tables.  The record must exist
// and be uninstalled; on success its slot fields point at the new
// entries.
//
// Which tables get touched depends on where the listener lands:
//   - first listener of the group: fresh 1-slot length and member blocks
//   - first listener on a new port: the length block grows, and the port
//     gets a fresh 1-slot member block
//   - another listener on a known port: the port's member block extends
//     in place if its next slot is free, else it grows by relocation
pub(crate) fn install_listener(
    s: &Mcast,
    data: &mut McastData,
    gidx: u16,
    id: ListenerId,
) -> McastResult<()> {
    let rec = *data.index.get(id).ok_or_else(|| {
        McastError::Missing(format!("no listener record {id}"))
    })?;
    let entry = MemberTableEntry {
        vlan: rec.vlan,
        dest_tag: rec.dest_tag,
        rewrite: rec.rewrite,
    };

    let mut gentry = s.asic_hdl.group_read(gidx)?;
    let (member_slot, length_slot) = if gentry.ports.is_empty() {
        // First listener of the group
        let length_base = relocate::alloc_length_run(s, data, 1)?;
        let member_base = match relocate::alloc_member_run(s, data, 1) {
            Ok(base) => base,
            Err(e) => {
                data.length_map.free_run(length_base, 1);
                return Err(e);
            }
        };
        s.asic_hdl.member_write(member_base, entry)?;
        s.asic_hdl.length_write(
            length_base,
            LengthTableEntry { count: 1, base: member_base },
        )?;
        gentry.ports.set(rec.port);
        gentry.base = length_base;
        s.asic_hdl.group_write(gidx, gentry)?;
        (member_base, length_base)
    } else if !gentry.ports.contains(rec.port) {
        // New port: the length block grows by one, with the port's entry
        // inserted at its rank in the updated mask
        let member_base = relocate::alloc_member_run(s, data, 1)?;
        let insert = gentry.ports.rank(rec.port);
        let new_base = match relocate::clone_length_block(
            s,
            data,
            gentry.base,
            gentry.ports.count(),
            Reshape::Grow { insert },
        ) {
            Ok(base) => base,
            Err(e) => {
                data.member_map.free_run(member_base, 1);
                return Err(e);
            }
        };
        s.asic_hdl.member_write(member_base, entry)?;
        s.asic_hdl.length_write(
            new_base + insert,
            LengthTableEntry { count: 1, base: member_base },
        )?;
        gentry.ports.set(rec.port);
        gentry.base = new_base;
        s.asic_hdl.group_write(gidx, gentry)?;
        (member_base, new_base + insert)
    } else {
        // Known port: extend its member block
        let length_slot = gentry.base + gentry.ports.rank(rec.port);
        let lentry = s.asic_hdl.length_read(length_slot)?;
        let next = lentry.base + lentry.count;
        let in_table =
            usize::from(next) < s.asic_hdl.table_size(McastTable::Member);
        if in_table && !data.member_map.is_set(next) {
            // The slot just past the block is free, so no relocation is
            // needed.  Quarantined slots still count as used here.
            s.asic_hdl.member_write(next, entry)?;
            data.member_map.set(next);
            s.asic_hdl.length_write(
                length_slot,
                LengthTableEntry {
                    count: lentry.count + 1,
                    base: lentry.base,
                },
            )?;
            (next, length_slot)
        } else {
            let new_base = relocate::clone_member_block(
                s,
                data,
                rec.port,
                lentry.base,
                lentry.count,
                Reshape::Grow { insert: lentry.count },
            )?;
            let slot = new_base + lentry.count;
            s.asic_hdl.member_write(slot, entry)?;
            s.asic_hdl.length_write(
                length_slot,
                LengthTableEntry {
                    count: lentry.count + 1,
                    base: new_base,
                },
            )?;
            (slot, length_slot)
        }
    };

    data.index.install(id, member_slot, length_slot);
    debug!(s.log, "installed listener";
        "port" => %rec.port, "vlan" => rec.vlan, "tag" => rec.dest_tag,
        "member_slot" => member_slot, "length_slot" => length_slot);
    Ok(())
}

// Remove one listener's hardware entries, returning its record to the
// uninstalled state.  The caller owns the record's fate and the counter
// updates.
pub(crate) fn uninstall_listener(
    s: &Mcast,
    data: &mut McastData,
    id: ListenerId,
) -> McastResult<()> {
    let rec = *data.index.get(id).ok_or_else(|| {
        McastError::Missing(format!("no listener record {id}"))
    })?;
    let gidx = data.group_idx(rec.repl_group)?;

    let mut gentry = s.asic_hdl.group_read(gidx)?;
    if !gentry.ports.contains(rec.port) {
        return Err(McastError::Missing(format!(
            "group mask lost port {}", rec.port
        )));
    }
    let offset = gentry.ports.rank(rec.port);
    let length_slot = gentry.base + offset;
    debug_assert_eq!(length_slot, rec.length_slot);
    let lentry = s.asic_hdl.length_read(length_slot)?;

    if lentry.count == 1 {
        // Last listener on the port: the port leaves the group, so its
        // member block and its length entry both retire
        if gentry.ports.count() == 1 {
            // ... and it was the last port, so the whole length block
            // retires with no replacement
            relocate::expire_length_slot(data, length_slot);
            s.asic_hdl.group_write(gidx, GroupTableEntry::default())?;
        } else {
            let new_base = relocate::clone_length_block(
                s,
                data,
                gentry.base,
                gentry.ports.count(),
                Reshape::Shrink { skip: offset },
            )?;
            gentry.ports.clear(rec.port);
            gentry.base = new_base;
            s.asic_hdl.group_write(gidx, gentry)?;
        }
        relocate::expire_member_slot(data, rec.member_slot);
    } else {
        let skip = rec.member_slot - lentry.base;
        let new_base = relocate::clone_member_block(
            s,
            data,
            rec.port,
            lentry.base,
            lentry.count,
            Reshape::Shrink { skip },
        )?;
        s.asic_hdl.length_write(
            length_slot,
            LengthTableEntry {
                count: lentry.count - 1,
                base: new_base,
            },
        )?;
    }

    data.index.uninstall(id);
    debug!(s.log, "removed listener";
        "port" => %rec.port, "vlan" => rec.vlan, "tag" => rec.dest_tag);
    Ok(())
}
