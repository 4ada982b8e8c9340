// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Epoch-fenced reclamation of quarantined table slots.
//!
//! Every packet walk through the replication tables is tagged with the
//! epoch that was published when it started, and the hardware keeps an
//! in-flight counter per tag.  Flipping the tag and waiting for the old
//! tag's counter to drain therefore bounds the lifetime of every read
//! that could still touch a quarantined slot.  Once the counter reads
//! zero, the quarantined slots are cleared in hardware and returned to
//! their tables' free pools.
//!
//! The drain poll runs while holding the subsystem lock.  That is a
//! deliberate latency cost, not a correctness one: the drain is bounded
//! by the pipeline depth and is normally over in a poll or two.  A
//! counter that never drains indicates sick hardware and is reported as
//! fatal rather than retried forever.

use slog::debug;
use slog::error;

use aal::AsicOps;
use aal::Epoch;
use aal::LengthTableEntry;
use aal::MemberTableEntry;

use crate::types::McastError;
use crate::types::McastResult;
use crate::Mcast;
use crate::McastData;

/// Which quarantine pools a reclamation pass sweeps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scope {
    Length,
    Member,
    Both,
}

/// Run one reclamation pass over the scoped quarantine pools.  Returns
/// whether anything was reclaimed.  The epoch flips at most once per
/// pass, no matter how many tables are swept; a pass with nothing
/// quarantined doesn't flip at all.
pub(crate) fn reclaim(
    s: &Mcast,
    data: &mut McastData,
    scope: Scope,
) -> McastResult<bool> {
    let do_length = matches!(scope, Scope::Length | Scope::Both);
    let do_member = matches!(scope, Scope::Member | Scope::Both);

    let mut pending = 0;
    if do_length {
        pending += data.length_quar.used();
    }
    if do_member {
        pending += data.member_quar.used();
    }
    if pending == 0 {
        return Ok(false);
    }

    // Fence off the quarantined slots: once the previous epoch's counter
    // drains, no in-flight walk can still be reading them.
    let prev = data.epoch;
    data.epoch ^= 1;
    s.asic_hdl.epoch_set(data.epoch)?;
    drain(s, prev)?;

    if do_length {
        for idx in data.length_quar.indices().collect::<Vec<_>>() {
            s.asic_hdl.length_write(idx, LengthTableEntry::default())?;
            data.length_map.clear(idx);
            data.length_quar.clear(idx);
        }
    }
    if do_member {
        for idx in data.member_quar.indices().collect::<Vec<_>>() {
            s.asic_hdl.member_write(idx, MemberTableEntry::default())?;
            data.member_map.clear(idx);
            data.member_quar.clear(idx);
        }
    }

    debug!(s.log, "reclaimed {pending} quarantined slots";
        "epoch" => data.epoch);
    Ok(true)
}

// Poll the in-flight counter for the given epoch tag until it drains.
fn drain(s: &Mcast, epoch: Epoch) -> McastResult<()> {
    let mut polls = 0;
    loop {
        let usage = s.asic_hdl.epoch_usage(epoch)?;
        if usage == 0 {
            return Ok(());
        }
        polls += 1;
        if polls >= s.config.drain_poll_limit {
            error!(s.log, "epoch usage counter failed to drain";
                "epoch" => epoch, "polls" => polls, "usage" => usage);
            return Err(McastError::EpochStuck { epoch, polls });
        }
        std::thread::sleep(s.config.drain_poll_interval);
    }
}

/// Threshold-triggered reclamation, intended to be called from the
/// switch's periodic housekeeping.  Quarantined slots are swept only once
/// their count climbs past the watermark, so steady-state churn doesn't
/// pay an epoch flip per operation.
pub fn periodic_maintenance(s: &Mcast) -> McastResult<bool> {
    let mut data = s.data.lock().unwrap();
    let data = &mut *data;

    let watermark = data.watermark(s.config.reclaim_pct);
    if data.member_quar.used() <= watermark {
        return Ok(false);
    }
    reclaim(s, data, Scope::Both)
}

/// Reclaim everything quarantined, regardless of the watermark.
pub fn force_reclamation(s: &Mcast) -> McastResult<bool> {
    let mut data = s.data.lock().unwrap();
    reclaim(s, &mut data, Scope::Both)
}
