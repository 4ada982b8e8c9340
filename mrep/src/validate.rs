// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Cross-table consistency checking.
//!
//! The three replication tables, the slot maps, and the listener index
//! are all views of the same logical state, and every operation is
//! supposed to keep them aligned.  This module re-derives the linkage
//! from scratch and reports anything that doesn't line up.  Violations
//! are logged and counted, never fatal: the checker is a diagnostic aid
//! for tests and support, not part of the data path.

use slog::error;

use aal::AsicOps;

use crate::types::McastResult;
use crate::Mcast;

/// Walk every invariant the tables are supposed to hold, logging each
/// violation.  Returns the violation count; a healthy switch returns 0.
pub fn check_consistency(s: &Mcast) -> McastResult<usize> {
    let data = s.data.lock().unwrap();
    let mut violations = 0;

    let mut complain = |msg: String| {
        error!(s.log, "consistency violation: {msg}");
        violations += 1;
    };

    // Every group's length block must be contiguous, live, and exactly as
    // long as its port mask is wide, and each port's member block must be
    // live for its full count.
    for (gidx, rec) in &data.groups {
        let gentry = s.asic_hdl.group_read(*gidx)?;
        if gentry.ports.is_empty() {
            continue;
        }
        for offset in 0..gentry.ports.count() {
            let slot = gentry.base + offset;
            if !data.length_map.is_set(slot) {
                complain(format!(
                    "group {}: length slot {slot} not marked used",
                    rec.repl_group
                ));
            }
        }
        for (offset, port) in gentry.ports.ports().enumerate() {
            let lentry = s.asic_hdl.length_read(gentry.base + offset as u16)?;
            if lentry.count == 0 {
                complain(format!(
                    "group {}: port {port} has an empty member block",
                    rec.repl_group
                ));
                continue;
            }
            for i in 0..lentry.count {
                if !data.member_map.is_set(lentry.base + i) {
                    complain(format!(
                        "group {}: member slot {} not marked used",
                        rec.repl_group,
                        lentry.base + i
                    ));
                }
            }
        }
    }

    // Every installed record must sit on live slots and be reachable from
    // both index views.
    for (id, rec) in data.index.records() {
        if !rec.is_installed() {
            continue;
        }
        if !data.member_map.is_set(rec.member_slot) {
            complain(format!(
                "listener {id}: member slot {} not marked used",
                rec.member_slot
            ));
        }
        if !data.length_map.is_set(rec.length_slot) {
            complain(format!(
                "listener {id}: length slot {} not marked used",
                rec.length_slot
            ));
        }
        if data.index.find(
            rec.mcast_group,
            rec.repl_group,
            rec.port,
            rec.vlan,
            rec.dest_tag,
        ) != Some(id)
        {
            complain(format!("listener {id}: missing from the primary view"));
        }
        if !data.index.ids_for_length_slot(rec.length_slot).contains(&id) {
            complain(format!(
                "listener {id}: missing from the length-slot view"
            ));
        }
    }

    // Expired slots stay used until reclaimed
    for idx in data.length_quar.indices() {
        if !data.length_map.is_set(idx) {
            complain(format!("quarantined length slot {idx} marked free"));
        }
    }
    for idx in data.member_quar.indices() {
        if !data.member_map.is_set(idx) {
            complain(format!("quarantined member slot {idx} marked free"));
        }
    }

    // Used slots are exactly: the reserved slot, the quarantined slots,
    // and one per installed listener
    let installed = data.index.installed();
    let expected =
        usize::from(data.member_map.used() - 1 - data.member_quar.used());
    if installed != expected {
        complain(format!(
            "member table accounts for {expected} listeners, index holds \
             {installed}"
        ));
    }

    Ok(violations)
}
